use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("Deploy command is empty")]
    EmptyCommand,
    #[error("Failed to spawn deploy command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A launched deploy command. Only the pid is kept; the process itself is
/// never waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launched {
    pub pid: Option<u32>,
}

/// Starts the deployment tool. Implementations must return as soon as the
/// process is running.
pub trait Runner {
    fn command_line(&self) -> &str;

    fn launch(&self) -> Result<Launched, RunnerError>;
}

/// Runs a fixed command line through `sh -c`, detached from our stdio.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    command: String,
}

impl ShellRunner {
    pub fn new(command: impl Into<String>) -> Result<Self, RunnerError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        Ok(ShellRunner { command })
    }
}

impl Runner for ShellRunner {
    fn command_line(&self) -> &str {
        &self.command
    }

    fn launch(&self) -> Result<Launched, RunnerError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let pid = child.id();
        debug!(pid = ?pid, "deploy command spawned");

        // Fire and forget: tokio reaps the child in the background once the
        // handle is gone.
        drop(child);

        Ok(Launched { pid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(ShellRunner::new(""), Err(RunnerError::EmptyCommand)));
        assert!(matches!(ShellRunner::new("  \t"), Err(RunnerError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_launch_runs_command() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("deployed");
        let runner = ShellRunner::new(format!("touch '{}'", marker.display())).unwrap();

        let launched = runner.launch().unwrap();
        assert!(launched.pid.is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !marker.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.exists(), "deploy command never ran");
    }

    #[tokio::test]
    async fn test_launch_does_not_wait_for_command() {
        let runner = ShellRunner::new("sleep 5").unwrap();

        let started = Instant::now();
        runner.launch().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_failing_command_still_launches() {
        let runner = ShellRunner::new("exit 3").unwrap();
        assert!(runner.launch().is_ok());
    }
}
