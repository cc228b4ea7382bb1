//! The durable data model: `Job` and its wire-visible status enum, the
//! per-job options and metadata snapshot, the extractor's decoded
//! `VideoInfo`, and the roadmap read-model.

use serde::{Deserialize, Serialize};

/// The six statuses a job may hold. This is the exact wire enum of spec
/// section 6; any other string on the wire is a bug, so `FromStr` rejects it
/// rather than defaulting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// A job in this status will never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Merging => "merging",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "downloading" => Ok(JobStatus::Downloading),
            "merging" => Ok(JobStatus::Merging),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(crate::error::CoreError::Storage(sqlx::Error::Decode(
                format!("unknown job status on the wire: {other}").into(),
            ))),
        }
    }
}

/// Subtitle policy: a language list plus whether to embed (vs. leave as a
/// sidecar `.srt`/`.vtt` file).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubtitlePolicy {
    pub languages: Vec<String>,
    pub embed: bool,
}

/// Everything a worker needs to construct the extractor's argument list for
/// one job (spec section 3, section 6).
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Empty or `"best"` triggers the `YouTube` heuristic in
    /// `extractor::pick_format`.
    pub format: String,
    pub audio_only: bool,
    pub audio_format: String,
    pub audio_bitrate_kbps: Option<u32>,
    pub remux_target: Option<String>,
    pub subtitles: SubtitlePolicy,
    pub embed_thumbnail: bool,
    pub skip_existing: bool,
    pub use_aria2: bool,
    pub aria2_connections: u8,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            format: String::from("best"),
            audio_only: false,
            audio_format: String::from("mp3"),
            audio_bitrate_kbps: None,
            remux_target: None,
            subtitles: SubtitlePolicy::default(),
            embed_thumbnail: false,
            skip_existing: true,
            use_aria2: false,
            aria2_connections: 16,
        }
    }
}

/// Metadata known about a video, possibly partially populated at enqueue
/// time and filled in lazily by the worker (spec section 4.7).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobMetadataSnapshot {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration_secs: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Progress as last observed from the line parser.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub error_message: Option<String>,
}

/// The final output of a completed job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFile {
    pub path: Option<String>,
    pub size_bytes: Option<u64>,
}

/// A durable download job. See spec section 3 for the invariants this type
/// must uphold; they are enforced by `JobStore` and `DownloadManager`, not by
/// this struct itself (it is a plain data holder).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: uuid::Uuid,
    pub url: String,
    pub options: DownloadOptions,
    pub metadata: JobMetadataSnapshot,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub file: JobFile,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Job {
    /// Construct a freshly enqueued, `pending` job for a normalized URL.
    #[must_use]
    pub fn new(url: String, options: DownloadOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            url,
            options,
            metadata: JobMetadataSnapshot::default(),
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            file: JobFile::default(),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Normalize a submitted URL: trim whitespace and lowercase the scheme only
/// (spec section 3: "trimmed; scheme lowercased").
#[must_use]
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once("://") {
        Some((scheme, rest)) => format!("{}://{rest}", scheme.to_ascii_lowercase()),
        None => trimmed.to_string(),
    }
}

/// Decoded extractor metadata (`yt-dlp --dump-json`). Fields that the
/// extractor may emit in more than one JSON shape are decoded through
/// `deserialize_with` helpers rather than relying on a single serde type,
/// per spec section 4.5/9 ("do not rely on a language's default decoder").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    #[serde(default, deserialize_with = "duration_as_secs")]
    pub duration: Option<u64>,
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "resolution_opt_string")]
    pub resolution: Option<String>,
    #[serde(default, deserialize_with = "quality_as_string")]
    pub quality: Option<String>,
    #[serde(default)]
    pub entries: Option<Vec<VideoInfo>>,
}

/// `duration` may arrive as an integer or a float; truncate to whole seconds.
fn duration_as_secs<'de, D>(de: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(de)?;
    Ok(match value {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| f.max(0.0) as u64),
        _ => None,
    })
}

/// `resolution` may be a string or JSON `null`.
fn resolution_opt_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(de)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}

/// `quality` may be a string or a number; numbers are formatted with zero
/// decimal places, matching the source's `%.0f` behavior.
fn quality_as_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(de)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => n.as_f64().map(|f| format!("{f:.0}")),
        _ => None,
    })
}

/// Status of a roadmap item as reported by the upstream CDN document. An
/// unknown value defaults to `Idea` (spec section 9 open question, resolved
/// in DESIGN.md).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoadmapStatus {
    Planned,
    InProgress,
    Shipped,
    /// Also the fallback for any value the upstream CDN emits outside the
    /// four-value enum (spec section 9 open question: defaults to `Idea`).
    #[serde(other)]
    #[default]
    Idea,
}

/// One item from the roadmap read-model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoadmapItem {
    pub id: i64,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: RoadmapStatus,
    #[serde(default)]
    pub votes_up: i64,
    #[serde(default)]
    pub votes_down: i64,
    #[serde(default)]
    pub translations: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub author: Option<String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_but_not_host() {
        assert_eq!(
            normalize_url("  HTTPS://Example.com/Path  "),
            "https://Example.com/Path"
        );
    }

    #[test]
    fn duration_decodes_int_or_float() {
        let from_int: VideoInfo = serde_json::from_str(r#"{"duration": 42}"#).unwrap();
        assert_eq!(from_int.duration, Some(42));
        let from_float: VideoInfo = serde_json::from_str(r#"{"duration": 42.9}"#).unwrap();
        assert_eq!(from_float.duration, Some(42));
    }

    #[test]
    fn resolution_decodes_null_or_string() {
        let from_null: VideoInfo = serde_json::from_str(r#"{"resolution": null}"#).unwrap();
        assert_eq!(from_null.resolution, None);
        let from_str: VideoInfo = serde_json::from_str(r#"{"resolution": "1920x1080"}"#).unwrap();
        assert_eq!(from_str.resolution.as_deref(), Some("1920x1080"));
    }

    #[test]
    fn quality_decodes_number_or_string() {
        let from_num: VideoInfo = serde_json::from_str(r#"{"quality": 720}"#).unwrap();
        assert_eq!(from_num.quality.as_deref(), Some("720"));
        let from_str: VideoInfo = serde_json::from_str(r#"{"quality": "high"}"#).unwrap();
        assert_eq!(from_str.quality.as_deref(), Some("high"));
    }

    #[test]
    fn unknown_roadmap_status_defaults_to_idea() {
        let status: RoadmapStatus = serde_json::from_str(r#""something-new""#).unwrap();
        assert_eq!(status, RoadmapStatus::Idea);
    }
}
