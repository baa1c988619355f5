use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::Result;

/// Exit information of a shell command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub status: String,
    /// Combined stdout and stderr
    pub output: String,
}

/// Runs `cmd` through `/bin/sh -c` and waits for it.
///
/// Spawn failures are returned as errors; a non-zero exit is reported
/// through [`CommandOutcome::success`].
pub async fn run_shell(cmd: &str) -> Result<CommandOutcome> {
    debug!(cmd, "running command");
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    debug!(cmd, status = %output.status, "command finished: {}", combined.trim_end());

    Ok(CommandOutcome {
        success: output.status.success(),
        status: output.status.to_string(),
        output: combined,
    })
}
