#![cfg(unix)]

use std::time::Duration;

use executors::{
    CommandSpec, ProcessManager, ProcessOutput, ProcessStatus,
    process::ProcessError,
};

#[tokio::test]
async fn clean_exit_completes_with_code_zero() {
    let manager = ProcessManager::new();
    let spec = CommandSpec::new("sh", std::env::temp_dir())
        .arg("-c")
        .arg("echo hello");
    let record = manager.spawn(spec).await.unwrap();
    assert!(record.pid > 0);

    let exit = manager.wait_for_exit(record.id).await.unwrap();
    assert_eq!(exit.exit_code, Some(0));
    assert_eq!(record.status(), ProcessStatus::Completed);

    match &record.collected_output()[..] {
        [ProcessOutput::Stdout(line)] => assert_eq!(line, "hello"),
        other => panic!("unexpected output: {other:?}"),
    }
}

#[tokio::test]
async fn nonzero_exit_crashes() {
    let manager = ProcessManager::new();
    let spec = CommandSpec::new("sh", std::env::temp_dir()).arg("-c").arg("exit 3");
    let record = manager.spawn(spec).await.unwrap();

    let exit = manager.wait_for_exit(record.id).await.unwrap();
    assert_eq!(exit.exit_code, Some(3));
    assert_eq!(record.status(), ProcessStatus::Crashed);

    let stats = manager.stats();
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.crashed, 1);
}

#[tokio::test]
async fn missing_executable_fails_spawn() {
    let manager = ProcessManager::new();
    let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", std::env::temp_dir());
    match manager.spawn(spec).await {
        Err(ProcessError::ExecutableNotFound(name)) => {
            assert_eq!(name, "definitely-not-a-real-binary-xyz")
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn timeout_triggers_termination() {
    let manager = ProcessManager::with_config(Duration::from_millis(100), Duration::from_secs(5));
    let spec = CommandSpec::new("sh", std::env::temp_dir())
        .arg("-c")
        .arg("sleep 30")
        .timeout(Duration::from_millis(200));
    let record = manager.spawn(spec).await.unwrap();

    let _ = manager.wait_for_exit(record.id).await.unwrap();
    assert!(record.status().is_terminal());
}

#[tokio::test]
async fn terminate_stops_a_busy_process() {
    let manager = ProcessManager::with_config(Duration::from_millis(100), Duration::from_secs(5));
    let spec = CommandSpec::new("sh", std::env::temp_dir()).arg("-c").arg("sleep 30");
    let record = manager.spawn(spec).await.unwrap();
    assert_eq!(record.status(), ProcessStatus::Busy);

    let final_status = manager.terminate(record.id).await.unwrap();
    assert!(final_status.is_terminal());
}

#[tokio::test]
async fn stdin_reaches_the_child() {
    let manager = ProcessManager::new();
    let spec = CommandSpec::new("sh", std::env::temp_dir()).arg("-c").arg("read line; echo got:$line");
    let record = manager.spawn(spec).await.unwrap();

    manager.write_stdin(record.id, "ping\n").await.unwrap();
    manager.close_stdin(record.id).await.unwrap();

    let exit = manager.wait_for_exit(record.id).await.unwrap();
    assert_eq!(exit.exit_code, Some(0));
    match &record.collected_output()[..] {
        [ProcessOutput::Stdout(line)] => assert_eq!(line, "got:ping"),
        other => panic!("unexpected output: {other:?}"),
    }
}
