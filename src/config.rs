//! CLI/env configuration (spec section 6/10). Mirrors the teacher's flat
//! `Args` struct, resolved once at startup via `clap`.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(about, author, version, next_line_help = true)]
pub struct Args {
    #[arg(long, env, default_value = "127.0.0.1")]
    /// The IP address the HTTP listener will bind to.
    pub listen_ip: String,

    #[arg(long, env, default_value = "22408")]
    /// The port number the HTTP listener will bind to.
    pub listen_port: String,

    #[arg(long, env)]
    /// File system path to the directory holding the `SQLite` database and
    /// roadmap cache. Defaults to the platform's per-user data directory.
    pub data_dir: Option<String>,

    #[arg(long, env)]
    /// File system path under which downloaded videos are placed.
    pub video_dir: String,

    #[arg(long, env, default_value = "yt-dlp")]
    pub ytdlp_path: String,

    #[arg(long, env, default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    #[arg(long, env)]
    /// Optional path to `aria2c`; when unset, `--use-aria2` download options
    /// are silently ignored (spec section 4.5).
    pub aria2_path: Option<String>,

    #[arg(long, env)]
    /// Optional path to `whisper-cli`; subtitle generation is out of this
    /// core's scope (spec section 4, Non-goals) but the path is still plumbed
    /// through for collaborators that shell out to it directly.
    pub whisper_path: Option<String>,

    #[arg(long, env, default_value_t = 3)]
    /// Maximum number of concurrently downloading jobs (spec section 4.7).
    pub worker_count: usize,

    #[arg(long, env, default_value = "https://roadmap.downkingo.app/items.json")]
    pub roadmap_base_url: String,
}

impl Args {
    /// Resolves `data_dir`, falling back to the platform per-user data
    /// directory under an app-specific subfolder (spec section 6: "one
    /// `SQLite` file under the app's per-user data directory"). The subfolder
    /// is `DownKingo-dev` in debug builds, `DownKingo` otherwise, so a
    /// development build never shares state with an installed release.
    pub fn resolve_data_dir(&self) -> std::io::Result<std::path::PathBuf> {
        let path = match &self.data_dir {
            Some(p) => std::path::PathBuf::from(p),
            None => dirs::data_dir()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no per-user data directory available")
                })?
                .join(app_data_subfolder()),
        };
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(debug_assertions)]
fn app_data_subfolder() -> &'static str {
    "DownKingo-dev"
}

#[cfg(not(debug_assertions))]
fn app_data_subfolder() -> &'static str {
    "DownKingo"
}
