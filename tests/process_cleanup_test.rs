use std::sync::Arc;

use mcp_rpc::{
    process::ProcessManager,
    transport::{stdio::StreamTransport, Transport},
    Message, Notification,
};
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout, Duration},
};

/// Child processes must be reaped and their pipes closed on shutdown
#[tokio::test]
async fn test_process_cleanup() {
    let initial_fd_count = get_fd_count().unwrap_or(0);
    println!("Initial FD count: {}", initial_fd_count);

    for i in 0..5 {
        let mut pm = ProcessManager::new();

        let mut command = tokio::process::Command::new("echo");
        command.arg("Hello from process").arg(i.to_string());

        let (_stdin, _stdout) = pm.start_process(command).expect("Failed to start process");
        assert!(pm.is_running());

        sleep(Duration::from_millis(100)).await;
        pm.shutdown().await;
        assert!(!pm.is_running());
    }

    sleep(Duration::from_millis(500)).await;

    let final_fd_count = get_fd_count().unwrap_or(0);
    println!("Final FD count: {}", final_fd_count);

    assert!(
        final_fd_count <= initial_fd_count + 10,
        "File descriptor leak detected: initial={}, final={}",
        initial_fd_count,
        final_fd_count
    );
}

/// A spawned `cat` echoes every frame back, so the transport reads what it wrote
#[tokio::test]
async fn test_spawned_stream_transport_round_trip() {
    let initial_fd_count = get_fd_count().unwrap_or(0);

    for i in 0..3 {
        let command = tokio::process::Command::new("cat");
        let transport = Arc::new(StreamTransport::spawn(command).expect("Failed to spawn cat"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_message_handler(Arc::new(move |message: Message| {
            let _ = tx.send(message);
        }));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        transport.set_close_handler(Arc::new(move || {
            let _ = closed_tx.send(());
        }));
        transport.start().await.expect("Failed to start transport");

        let sent = Notification::new("notifications/echo", Some(json!({ "round": i })));
        transport
            .send(Message::Notification(sent.clone()))
            .await
            .expect("Failed to send");

        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for echo")
            .expect("channel open");
        assert_eq!(received, Message::Notification(sent));

        transport.close().await.expect("Failed to close");
        timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .expect("close handler not called")
            .expect("channel open");
        assert!(transport
            .send(Message::Notification(Notification::new("late", None)))
            .await
            .is_err());
    }

    sleep(Duration::from_millis(500)).await;
    let final_fd_count = get_fd_count().unwrap_or(0);
    assert!(
        final_fd_count <= initial_fd_count + 15,
        "Transport file descriptor leak detected: initial={}, final={}",
        initial_fd_count,
        final_fd_count
    );
}

/// Get the current number of open file descriptors for this process
#[cfg(unix)]
fn get_fd_count() -> Option<usize> {
    use std::fs;

    // /proc/self/fd exists on Linux only
    if let Ok(entries) = fs::read_dir("/proc/self/fd") {
        Some(entries.count())
    } else {
        None
    }
}

#[cfg(not(unix))]
fn get_fd_count() -> Option<usize> {
    None
}

/// Stress test to verify no file descriptor leaks under load
#[tokio::test]
async fn test_no_fd_leak_under_load() {
    let initial_fd_count = get_fd_count().unwrap_or(0);
    println!("Initial FD count for stress test: {}", initial_fd_count);

    let mut task_count = 0;

    for _ in 0..10 {
        for i in 0..5 {
            let mut pm = ProcessManager::new();

            let mut command = tokio::process::Command::new("echo");
            command.arg(format!("test-{}", i));

            if pm.start_process(command).is_ok() {
                sleep(Duration::from_millis(10)).await;
                pm.shutdown().await;
            }

            task_count += 1;
        }
    }

    println!("Completed {} tasks", task_count);

    sleep(Duration::from_millis(500)).await;

    let final_fd_count = get_fd_count().unwrap_or(0);
    println!("Final FD count for stress test: {}", final_fd_count);

    assert!(
        final_fd_count <= initial_fd_count + 20,
        "Stress test file descriptor leak detected: initial={}, final={}",
        initial_fd_count,
        final_fd_count
    );
}
