//! Spawns external binaries (`yt-dlp`, `ffmpeg`, `whisper-cli`, `aria2c`)
//! with a bound cancellation token and produces a merged stdout/stderr byte
//! stream (spec section 4.3).

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};

/// Environment overrides applied to every invocation, required for
/// correctness on non-English Windows (spec section 4.3/6).
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
    ("PYTHONUNBUFFERED", "1"),
    ("LC_ALL", "en_US.UTF-8"),
];

/// Applies platform-specific window suppression and the required
/// environment overrides. On Windows, hides the child console window; on
/// other platforms it only sets the environment (spec section 9: keep
/// behind a single seam).
fn configure_child_process(cmd: &mut Command) {
    for (key, value) in ENV_OVERRIDES {
        cmd.env(key, value);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        // CREATE_NO_WINDOW, see Microsoft's process creation flags.
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
}

/// A chunk read from the child's merged output, or a marker that the child
/// has exited.
pub enum RunnerEvent {
    Chunk(Vec<u8>),
    Exited(std::process::ExitStatus),
}

/// Runs one external binary under cancellation. `spawn` returns a receiver
/// of merged stdout/stderr chunks; a background task force-kills the child
/// the moment `token` is cancelled, guaranteeing no orphan children (spec
/// section 4.3/5).
pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawns `binary` with `args`, already-cancelled tokens rejected
    /// immediately (spec section 4.3: "Cancellation before Start returns an
    /// immediate error").
    pub fn spawn(
        binary: &str,
        args: &[String],
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<RunnerEvent>> {
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_child_process(&mut cmd);

        let mut child = cmd.spawn().map_err(CoreError::Io)?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            CoreError::ExternalTool(format!("failed to capture stdout of {binary}"))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            CoreError::ExternalTool(format!("failed to capture stderr of {binary}"))
        })?;

        let (tx, rx) = mpsc::channel(64);

        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout_tx
                            .send(RunnerEvent::Chunk(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        let stderr_tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stderr_tx
                            .send(RunnerEvent::Chunk(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = status.unwrap_or_else(|_| synthetic_failure_exit_status());
                    let _ = tx.send(RunnerEvent::Exited(status)).await;
                }
                () = token.cancelled() => {
                    let _ = child.start_kill();
                    let status = child.wait().await.unwrap_or_else(|_| synthetic_failure_exit_status());
                    let _ = tx.send(RunnerEvent::Exited(status)).await;
                }
            }
        });

        Ok(rx)
    }
}

/// `ExitStatus` has no public constructor; this synthesizes a failure status
/// for the unlikely path where `wait()` itself errors (the child was already
/// reaped by something else).
#[cfg(unix)]
fn synthetic_failure_exit_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(-1)
}

#[cfg(windows)]
fn synthetic_failure_exit_status() -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1)
}
