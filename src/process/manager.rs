use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::io::drain_stderr;
use crate::error::{Error, Result};

/// Owns a spawned child process and tears it down on shutdown
#[derive(Default)]
pub struct ProcessManager {
    child: Option<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self { child: None }
    }

    /// Spawn `command` with piped stdio.
    ///
    /// Returns the child's stdin and stdout for the caller to speak the protocol over;
    /// stderr is drained into the log in the background.
    pub fn start_process(&mut self, command: Command) -> Result<(ChildStdin, ChildStdout)> {
        if self.child.is_some() {
            return Err(Error::Transport("process already started".to_string()));
        }
        let mut child = self.spawn_process(command)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("failed to get child stderr".to_string()))?;

        tokio::spawn(drain_stderr(stderr, child.id()));
        self.child = Some(child);

        Ok((stdin, stdout))
    }

    fn spawn_process(&mut self, mut command: Command) -> Result<Child> {
        tracing::debug!("spawning process: {:?}", command);

        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(child)
    }

    /// Process id of the running child, if any
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::debug!("stopping child process...");
            if let Err(e) = child.kill().await {
                tracing::error!("failed to stop child process: {}", e);
            }
            if let Err(e) = child.wait().await {
                tracing::error!("error waiting for child process to exit: {}", e);
            }
            tracing::debug!("child process stopped");
        }
    }
}
