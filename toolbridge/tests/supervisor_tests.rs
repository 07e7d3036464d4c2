use std::time::Duration;

use tempfile::TempDir;
use toolbridge::errors::ToolbridgeError;
use toolbridge::supervisor::{SupervisorConfig, TaskOutcome, TaskSupervisor};

fn shell_supervisor(
    root: &std::path::Path,
    script: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> TaskSupervisor {
    let config = SupervisorConfig::new(
        "/bin/sh",
        vec!["-c".to_string(), script.to_string()],
        root,
        timeout,
        max_output_bytes,
    )
    .expect("valid config");
    TaskSupervisor::new(config)
}

#[tokio::test]
async fn captures_output_and_reports_success() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(
        temp.path(),
        "cat; echo done",
        Duration::from_secs(5),
        64 * 1024,
    );

    let run = supervisor
        .run_task("compute 2+3*4")
        .await
        .expect("task runs");
    assert_eq!(run.outcome, TaskOutcome::Success);
    assert_eq!(run.exit_code, Some(0));
    assert!(run.had_output);
    assert!(!run.truncated);
    assert!(run.output.contains("compute 2+3*4"));
    assert!(run.output.contains("done"));
    assert!(run.finished_at >= run.started_at);
}

#[tokio::test]
async fn exit_code_is_authoritative_for_failure() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(
        temp.path(),
        "echo partial work; exit 3",
        Duration::from_secs(5),
        64 * 1024,
    );

    let run = supervisor.run_task("do something").await.expect("task runs");
    // Output was produced but the worker failed; that stays a failure.
    assert_eq!(run.outcome, TaskOutcome::Failure);
    assert_eq!(run.exit_code, Some(3));
    assert!(run.had_output);
}

#[tokio::test]
async fn deadline_kills_the_worker() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(
        temp.path(),
        "sleep 30",
        Duration::from_millis(300),
        64 * 1024,
    );

    let started = std::time::Instant::now();
    let run = supervisor.run_task("never finishes").await.expect("task runs");
    assert_eq!(run.outcome, TaskOutcome::Timeout);
    assert_eq!(run.exit_code, None);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn oversized_task_cannot_stall_past_the_deadline() {
    let temp = TempDir::new().unwrap();
    // Worker never reads stdin, so a task larger than the pipe buffer would
    // block the feed; the deadline must still fire on time.
    let supervisor = shell_supervisor(
        temp.path(),
        "exec sleep 30",
        Duration::from_millis(300),
        64 * 1024,
    );

    let task = "x".repeat(1024 * 1024);
    let started = std::time::Instant::now();
    let run = supervisor.run_task(&task).await.expect("task runs");
    assert_eq!(run.outcome, TaskOutcome::Timeout);
    assert_eq!(run.exit_code, None);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn worker_ignoring_stdin_still_reports_its_exit() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(temp.path(), "exec true", Duration::from_secs(5), 64 * 1024);

    // The broken pipe on the unread feed must not surface as an error.
    let task = "x".repeat(1024 * 1024);
    let run = supervisor.run_task(&task).await.expect("task runs");
    assert_eq!(run.outcome, TaskOutcome::Success);
    assert_eq!(run.exit_code, Some(0));
}

#[tokio::test]
async fn scans_generated_files_after_exit() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(
        temp.path(),
        "printf hi > \"$AGENT_OUTPUT_DIR/report.md\"; echo wrote report",
        Duration::from_secs(5),
        64 * 1024,
    );

    let run = supervisor.run_task("write a report").await.expect("task runs");
    assert_eq!(run.outcome, TaskOutcome::Success);
    assert_eq!(run.files.len(), 1);
    let file = &run.files[0];
    assert_eq!(file.name, "report.md");
    assert_eq!(file.size, 2);
    assert_eq!(file.path, "/api/files/report.md");
}

#[tokio::test]
async fn preexisting_files_are_reported_too() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("leftover.txt"), b"old").unwrap();
    let supervisor = shell_supervisor(temp.path(), "true", Duration::from_secs(5), 64 * 1024);

    let run = supervisor.run_task("noop").await.expect("task runs");
    assert_eq!(run.files.len(), 1);
    assert_eq!(run.files[0].name, "leftover.txt");
}

#[tokio::test]
async fn output_is_truncated_with_a_marker() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(
        temp.path(),
        "i=0; while [ $i -lt 100 ]; do echo aaaaaaaaaaaaaaaa; i=$((i+1)); done",
        Duration::from_secs(5),
        128,
    );

    let run = supervisor.run_task("flood").await.expect("task runs");
    assert!(run.truncated);
    assert!(run.output.contains("[output truncated at 128 bytes]"));
    assert!(run.output.len() < 1024);
}

#[tokio::test]
async fn spawn_failure_is_worker_unavailable() {
    let temp = TempDir::new().unwrap();
    let config = SupervisorConfig::new(
        "/nonexistent/worker-binary",
        Vec::new(),
        temp.path(),
        Duration::from_secs(5),
        64 * 1024,
    )
    .expect("valid config");
    let supervisor = TaskSupervisor::new(config);

    let err = supervisor
        .run_task("anything")
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, ToolbridgeError::WorkerUnavailable(_)));
}

#[tokio::test]
async fn blank_task_is_rejected_before_spawning() {
    let temp = TempDir::new().unwrap();
    let supervisor = shell_supervisor(temp.path(), "true", Duration::from_secs(5), 1024);

    let err = supervisor.run_task("   ").await.expect_err("blank task");
    assert!(matches!(err, ToolbridgeError::MissingRequiredField("task")));
}

#[test]
fn config_rejects_relative_output_dir_and_zero_limits() {
    assert!(matches!(
        SupervisorConfig::new(
            "/bin/sh",
            Vec::new(),
            "relative/outbox",
            Duration::from_secs(5),
            1024,
        ),
        Err(ToolbridgeError::InvalidConfig(_))
    ));
    assert!(matches!(
        SupervisorConfig::new("/bin/sh", Vec::new(), "/tmp", Duration::ZERO, 1024),
        Err(ToolbridgeError::InvalidConfig(_))
    ));
    assert!(matches!(
        SupervisorConfig::new("/bin/sh", Vec::new(), "/tmp", Duration::from_secs(5), 0),
        Err(ToolbridgeError::InvalidConfig(_))
    ));
    assert!(matches!(
        SupervisorConfig::new("  ", Vec::new(), "/tmp", Duration::from_secs(5), 1024),
        Err(ToolbridgeError::InvalidConfig(_))
    ));
}
