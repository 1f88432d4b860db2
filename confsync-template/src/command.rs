//! Shell command primitive: run one command line through the platform shell,
//! capture combined output, return the exit status.
//!
//! Deliberately has no timeout — a hung check or reload command stalls the
//! owning resource's monitor and nothing else.

use tokio::process::Command;

/// Captured result of one shell invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    /// Combined stdout + stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Exit code for error reporting; signal deaths read as `-1`.
    pub fn status_code(&self) -> i32 {
        self.status.unwrap_or(-1)
    }
}

/// Run `cmd` via `/bin/sh -c` (or `cmd /C` on windows).
pub async fn run_command(cmd: &str) -> Result<CommandOutput, std::io::Error> {
    tracing::debug!(command = cmd, "running command");

    let output = if cfg!(windows) {
        Command::new("cmd").args(["/C", cmd]).output().await?
    } else {
        Command::new("/bin/sh").args(["-c", cmd]).output().await?
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim_end().to_string();

    if !combined.is_empty() {
        tracing::debug!(command = cmd, output = %combined, "command output");
    }

    Ok(CommandOutput {
        status: output.status.code(),
        output: combined,
    })
}
