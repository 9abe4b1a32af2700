//! Invocation of the external ffmpeg binary. The media engine is a
//! black box to this service: we hand it a fully-built argument list
//! and only inspect the exit status and stderr.

use anyhow::{Context, anyhow};
use std::ffi::OsStr;
use tokio::process::Command;
use tracing::debug;

/// Run ffmpeg with the given arguments, capturing output. Returns an
/// error carrying the trailing stderr lines when the process exits
/// non-zero, since that is where ffmpeg reports what went wrong.
pub async fn run<I, S>(binary: &str, args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(binary);
    command.args(args);
    debug!(?command, "Running ffmpeg");

    let output = command
        .output()
        .await
        .with_context(|| format!("failed to execute {binary}"))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail = stderr
        .lines()
        .rev()
        .take(8)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    Err(anyhow!("{binary} exited with {}: {tail}", output.status))
}
