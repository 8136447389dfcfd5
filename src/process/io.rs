use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;

/// Forward a child's stderr into the log, line by line, until it closes
pub async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    while let Ok(n) = reader.read_line(&mut line).await {
        if should_stop(n) {
            break;
        }
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            tracing::debug!(pid = ?pid, "child stderr: {}", trimmed);
        }
        line.clear();
    }
    tracing::trace!(pid = ?pid, "child stderr closed");
}

fn should_stop(n: usize) -> bool {
    n == 0
}
