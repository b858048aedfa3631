//! End-to-end supervisor tests against a scripted fake engine.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nexus_supervisor::config::{SupervisorConfig, TimeoutConfig};
use nexus_supervisor::supervisor::{
    CommandError, Supervisor, SupervisorError, SupervisorHandle, SupervisorResult,
    SupervisorState,
};

const READY_LINE: &str = "echo 'Neural Engine: FULLY OPERATIONAL'";

/// Write an executable shell script standing in for the engine binary.
fn fake_engine(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("engine.sh");
    std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A script that answers every stdin frame with the given reply action,
/// echoing back the correlation token.
fn echo_reply_script(action: &str) -> String {
    format!(
        r#"{READY_LINE}
while IFS= read -r line; do
  ts=$(printf '%s' "$line" | sed -n 's/.*"timestamp":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$ts" ]; then
    echo "{{\"action\":\"{action}\",\"timestamp\":$ts,\"success\":true}}"
  fi
done"#
    )
}

fn test_config(engine: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.engine.executable = engine.to_path_buf();
    config.build.enabled = false;
    config.timeouts = TimeoutConfig {
        init_secs: 5,
        grace_secs: 1,
        command_secs: 2,
        sweep_millis: 20,
    };
    config
}

async fn wait_for_state(handle: &SupervisorHandle, want: SupervisorState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}, at {:?}", handle.state()));
}

#[tokio::test]
async fn engine_becomes_ready_and_answers_commands() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, &echo_reply_script("strategy_result"));
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;
    assert!(handle.status().running);
    assert!(handle.status().core_engine_active);

    let reply = handle.execute_strategy("flash_loop", 0.5).await.unwrap();
    assert_eq!(reply.action, "strategy_result");
    assert_eq!(reply.payload["success"], true);

    handle.shutdown();
    let result = session.await.unwrap().unwrap();
    assert_eq!(result, SupervisorResult::Shutdown);
    assert_eq!(handle.state(), SupervisorState::Terminated);
}

#[tokio::test]
async fn deploy_reply_resolves_and_increments_counter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, &echo_reply_script("transformer_deployed"));
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;
    assert_eq!(handle.status().deployed_transformers, 0);

    let reply = handle.deploy_transformer("mev_extraction_neural").await.unwrap();
    assert_eq!(reply.action, "transformer_deployed");
    assert_eq!(handle.status().deployed_transformers, 1);

    handle.shutdown();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn trade_lines_update_balance() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "{READY_LINE}\n\
         echo 'trade executed: +3.5 SOL'\n\
         echo 'trade executed: -1.25 SOL'\n\
         sleep 30"
    );
    let engine = fake_engine(&dir, &body);
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;

    let mut status_rx = handle.subscribe_status();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if (status_rx.borrow().cumulative_balance - 2.25).abs() < 1e-9 {
                return;
            }
            status_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("balance never reached 2.25");

    handle.shutdown();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn unanswered_command_times_out_within_sweep_granularity() {
    let dir = tempfile::tempdir().unwrap();
    // Ready, then swallow stdin without ever replying.
    let engine = fake_engine(&dir, &format!("{READY_LINE}\ncat > /dev/null"));
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;

    let started = Instant::now();
    let err = handle
        .send_command("execute_strategy", serde_json::json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err, CommandError::Timeout);
    assert!(elapsed >= Duration::from_millis(200), "resolved early: {elapsed:?}");
    // Deadline plus one sweep tick, with scheduling slack.
    assert!(elapsed < Duration::from_millis(700), "resolved late: {elapsed:?}");

    handle.shutdown();
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn crash_fails_in_flight_commands_immediately() {
    let dir = tempfile::tempdir().unwrap();
    // Read one command, then die with a distinctive code.
    let engine = fake_engine(&dir, &format!("{READY_LINE}\nIFS= read -r line\nexit 3"));
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;

    let started = Instant::now();
    let err = handle
        .send_command("execute_strategy", serde_json::json!({}), Duration::from_secs(30))
        .await
        .unwrap_err();

    // Failed by the crash, not by waiting out the 30s deadline.
    assert_eq!(err, CommandError::WorkerCrashed);
    assert!(started.elapsed() < Duration::from_secs(5));

    wait_for_state(&handle, SupervisorState::Degraded).await;
    assert!(!handle.status().running);

    // Commands in Degraded fail fast.
    let err = handle
        .send_command("execute_strategy", serde_json::json!({}), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::WorkerCrashed);

    handle.shutdown();
    let result = session.await.unwrap().unwrap();
    assert_eq!(result, SupervisorResult::EngineCrashed { code: Some(3) });
    assert_eq!(handle.state(), SupervisorState::Terminated);
}

#[tokio::test]
async fn shutdown_escalates_when_sigterm_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "trap '' TERM\n\
         {READY_LINE}\n\
         while true; do sleep 1; done"
    );
    let engine = fake_engine(&dir, &body);
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;

    let started = Instant::now();
    handle.shutdown();
    let result = session.await.unwrap().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result, SupervisorResult::Shutdown);
    assert_eq!(handle.state(), SupervisorState::Terminated);
    // The grace window (1s) elapsed before the force kill.
    assert!(elapsed >= Duration::from_secs(1), "no grace window: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "escalation too slow: {elapsed:?}");
}

#[tokio::test]
async fn shutdown_is_idempotent_and_observable_from_clones() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, &format!("{READY_LINE}\nsleep 30"));
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;

    let clone = handle.clone();
    handle.shutdown();
    clone.shutdown();

    clone.terminated().await;
    handle.terminated().await;
    assert_eq!(handle.state(), SupervisorState::Terminated);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn init_timeout_when_engine_never_reports_ready() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, "echo 'warming up'\nsleep 30");
    let mut config = test_config(&engine);
    config.timeouts.init_secs = 1;
    let (supervisor, handle) = Supervisor::new(config);

    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(err, SupervisorError::InitTimeout { .. }));
    assert_eq!(handle.state(), SupervisorState::Terminated);
}

#[tokio::test]
async fn exit_before_ready_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, "exit 7");
    let (supervisor, _handle) = Supervisor::new(test_config(&engine));

    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::ExitedBeforeReady { code: Some(7) }
    ));
}

#[tokio::test]
async fn build_failure_is_fatal_with_no_retry() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, READY_LINE);
    let mut config = test_config(&engine);
    config.build.enabled = true;
    config.build.program = "sh".to_string();
    config.build.args = vec!["-c".to_string(), "echo 'error: no target' >&2; exit 101".to_string()];
    let (supervisor, handle) = Supervisor::new(config);

    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(err, SupervisorError::BuildFailed(_)));
    assert_eq!(handle.state(), SupervisorState::Terminated);
}

#[tokio::test]
async fn shutdown_during_build_kills_the_build_process() {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let build_dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(&dir, READY_LINE);
    // The build records its pid and then hangs.
    let build = fake_engine(&build_dir, "echo $$ > \"$0.pid\"\nexec sleep 30");

    let mut config = test_config(&engine);
    config.build.enabled = true;
    config.build.program = build.to_str().unwrap().to_string();
    config.build.args = Vec::new();
    let (supervisor, handle) = Supervisor::new(config);
    let session = tokio::spawn(supervisor.run());

    let pid_path = build_dir.path().join("engine.sh.pid");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pid_path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("build never started");
    let pid: i32 = std::fs::read_to_string(&pid_path)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    handle.shutdown();
    let result = session.await.unwrap().unwrap();
    assert_eq!(result, SupervisorResult::Shutdown);
    assert_eq!(handle.state(), SupervisorState::Terminated);

    // The dropped build future must not leave its child running.
    tokio::time::timeout(Duration::from_secs(5), async {
        while kill(Pid::from_raw(pid), None).is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("build process survived shutdown");
}

#[tokio::test]
async fn missing_engine_binary_is_fatal() {
    let mut config = SupervisorConfig::default();
    config.engine.executable = PathBuf::from("/nonexistent/engine-binary");
    config.build.enabled = false;
    let (supervisor, _handle) = Supervisor::new(config);

    let err = supervisor.run().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn(_)));
}

#[tokio::test]
async fn replies_out_of_order_still_correlate() {
    let dir = tempfile::tempdir().unwrap();
    // Collect two commands, then answer them in reverse order.
    let body = format!(
        r#"{READY_LINE}
IFS= read -r first
IFS= read -r second
ts1=$(printf '%s' "$first" | sed -n 's/.*"timestamp":\([0-9][0-9]*\).*/\1/p')
ts2=$(printf '%s' "$second" | sed -n 's/.*"timestamp":\([0-9][0-9]*\).*/\1/p')
echo "{{\"action\":\"strategy_result\",\"timestamp\":$ts2,\"order\":\"second\"}}"
echo "{{\"action\":\"strategy_result\",\"timestamp\":$ts1,\"order\":\"first\"}}"
sleep 30"#
    );
    let engine = fake_engine(&dir, &body);
    let (supervisor, handle) = Supervisor::new(test_config(&engine));
    let session = tokio::spawn(supervisor.run());

    wait_for_state(&handle, SupervisorState::Ready).await;

    let h1 = handle.clone();
    let h2 = handle.clone();
    let first = tokio::spawn(async move { h1.execute_strategy("alpha", 0.1).await });
    // Give the first command a head start so stdin ordering is deterministic.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn(async move { h2.execute_strategy("beta", 0.2).await });

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.payload["order"], "first");
    assert_eq!(second.payload["order"], "second");

    handle.shutdown();
    session.await.unwrap().unwrap();
}
