//! The core's error taxonomy. Every internal module returns `CoreError`;
//! the binary entrypoint is still free to collapse these into `anyhow::Error`
//! at its own boundary, matching how the rest of the ecosystem treats the two
//! crates as complementary rather than competing.

/// Conceptual error kinds a caller inside this crate can observe. Job-level
/// failures are translated into a terminal status and a sanitized message
/// (see `manager::DownloadManager`); they never unwind out of a worker.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A URL or requested option failed validation before any I/O happened.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The host in a submitted URL is not one of the supported providers.
    #[error("unsupported host: {0}")]
    Unsupported(String),

    /// The relevant rate-limit bucket denied the action (only surfaced to
    /// callers that used `Allow`/`AllowN`; `Wait` callers never see this).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The extractor or ffmpeg exited non-zero, or could not be started.
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    /// The operation's context/cancellation token was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A SQL operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// An HTTP transport error occurred talking to the roadmap CDN.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A JSON document could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Catch-all for I/O failures (spawning processes, reading streams).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
