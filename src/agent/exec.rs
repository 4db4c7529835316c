//! Shell command execution with a hard timeout.
//!
//! Three failure shapes reach the controller as distinct text: launch
//! failure (shell/binary missing), timeout, and non-zero exit. Output is
//! truncated so a chatty command cannot flood the reply channel.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

pub const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_STDOUT_CHARS: usize = 10_000;
const MAX_STDERR_CHARS: usize = 5_000;
const TRUNCATION_MARKER: &str = "\n...output truncated...";

/// Run `cmd` through the platform shell and render the outcome as the
/// reply text. Never returns an error: every failure is a report.
pub async fn run_shell(cmd: &str, limit: Duration) -> String {
    let mut command = shell_command(cmd);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return format!("Failed to launch command: {e}"),
    };

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return format!("Failed to collect command output: {e}"),
        // Dropping the future kills the child (kill_on_drop).
        Err(_) => return format!("Command timed out after {} seconds", limit.as_secs()),
    };

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        format!("Command completed:\n{}", truncate(&stdout, MAX_STDOUT_CHARS))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "terminated by signal".into());
        format!(
            "Command failed (exit code: {code}):\n{}",
            truncate(&stderr, MAX_STDERR_CHARS)
        )
    }
}

#[cfg(windows)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}

#[cfg(not(windows))]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_command_reports_stdout() {
        let reply = run_shell("echo hello", SHELL_TIMEOUT).await;
        assert!(reply.starts_with("Command completed:"), "{reply}");
        assert!(reply.contains("hello"), "{reply}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_stderr() {
        let reply = run_shell("echo oops >&2; exit 3", SHELL_TIMEOUT).await;
        assert!(reply.contains("Command failed (exit code: 3)"), "{reply}");
        assert!(reply.contains("oops"), "{reply}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_command_times_out() {
        let start = std::time::Instant::now();
        let reply = run_shell("sleep 5", Duration::from_secs(1)).await;
        assert!(reply.contains("timed out after 1 seconds"), "{reply}");
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_truncation_appends_marker() {
        let long = "x".repeat(MAX_STDOUT_CHARS + 5);
        let out = truncate(&long, MAX_STDOUT_CHARS);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.chars().count(), MAX_STDOUT_CHARS + TRUNCATION_MARKER.chars().count());
        assert_eq!(truncate("short", MAX_STDOUT_CHARS), "short");
    }
}
