//! Power-action semantics against the mock environment.

mod common;

use std::time::Duration;

use common::server_fixture;
use roost_env::{Environment as _, ProcessState};
use roost_server::PowerAction;

#[tokio::test(flavor = "multi_thread")]
async fn start_happy_path_reaches_starting() {
    let fx = server_fixture(|_| {});
    fx.server
        .handle_power_action(PowerAction::Start, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(fx.server.state(), ProcessState::Starting);
    assert_eq!(*fx.env.start_calls.lock().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_rejected_while_suspended() {
    let fx = server_fixture(|cfg| cfg.suspended = true);
    let err = fx
        .server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap_err();
    assert!(matches!(err, roost_server::CommonError::Suspended(_)));
    assert_eq!(*fx.env.start_calls.lock().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_rejected_when_already_running() {
    let fx = server_fixture(|_| {});
    fx.env.set_state(ProcessState::Running);
    let err = fx
        .server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap_err();
    assert!(matches!(err, roost_server::CommonError::AlreadyRunning));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_rejected_while_installing() {
    let fx = server_fixture(|_| {});
    fx.server.set_installing(true);
    let err = fx
        .server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_on_offline_server_is_noop() {
    let fx = server_fixture(|_| {});
    fx.server
        .handle_power_action(PowerAction::Stop, None)
        .await
        .unwrap();
    assert_eq!(fx.server.state(), ProcessState::Offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_with_wait_errors_when_process_hangs() {
    let fx = server_fixture(|cfg| cfg.crash_detection.enabled = false);
    fx.env.set_state(ProcessState::Running);
    fx.env
        .running
        .store(true, std::sync::atomic::Ordering::Release);
    fx.env
        .hang_on_stop
        .store(true, std::sync::atomic::Ordering::Release);

    let err = fx
        .server
        .handle_power_action(PowerAction::Stop, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, roost_server::CommonError::Timeout(_)));
    // The window elapsing must never escalate to a kill.
    assert_eq!(*fx.env.kill_calls.lock().unwrap(), 0);
    assert_eq!(fx.server.state(), ProcessState::Stopping);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_without_wait_signals_and_returns() {
    let fx = server_fixture(|cfg| cfg.crash_detection.enabled = false);
    fx.env.set_state(ProcessState::Running);
    fx.env
        .running
        .store(true, std::sync::atomic::Ordering::Release);
    fx.env
        .hang_on_stop
        .store(true, std::sync::atomic::Ordering::Release);

    // No window: the signal is sent and the call returns without waiting
    // for, or forcing, the exit.
    fx.server
        .handle_power_action(PowerAction::Stop, None)
        .await
        .unwrap();
    assert_eq!(fx.server.state(), ProcessState::Stopping);
    assert!(fx.env.running.load(std::sync::atomic::Ordering::Acquire));
    assert_eq!(*fx.env.kill_calls.lock().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_on_offline_server_succeeds() {
    let fx = server_fixture(|_| {});
    fx.server
        .handle_power_action(PowerAction::Kill, None)
        .await
        .unwrap();
    assert_eq!(*fx.env.kill_calls.lock().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_action_without_wait_conflicts() {
    let fx = server_fixture(|_| {});
    *fx.env.start_delay.lock().unwrap() = Duration::from_millis(500);

    let first = {
        let server = fx.server.clone();
        tokio::spawn(async move {
            server
                .handle_power_action(PowerAction::Start, Some(Duration::from_secs(5)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The first action still holds the power mutex.
    let err = fx
        .server
        .handle_power_action(PowerAction::Stop, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    first.await.unwrap().unwrap();
    assert_eq!(*fx.env.start_calls.lock().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_runs_stop_then_start() {
    let fx = server_fixture(|_| {});
    fx.env.set_state(ProcessState::Running);
    fx.env
        .running
        .store(true, std::sync::atomic::Ordering::Release);

    fx.server
        .handle_power_action(PowerAction::Restart, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(*fx.env.start_calls.lock().unwrap(), 1);
    assert_eq!(fx.server.state(), ProcessState::Starting);
}

#[tokio::test(flavor = "multi_thread")]
async fn send_command_requires_running_state() {
    let fx = server_fixture(|_| {});
    let err = fx.server.send_command("say hi").await.unwrap_err();
    assert!(matches!(
        err,
        roost_server::CommonError::InvalidState(_)
    ));

    fx.env.running.store(true, std::sync::atomic::Ordering::Release);
    fx.env.set_state(ProcessState::Running);
    fx.server.send_command("say hi").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_starts_with_status_and_stats() {
    let fx = server_fixture(|_| {});
    let mut rx = fx.server.subscribe(16);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.topic, "status");
    assert_eq!(first.data["state"], "offline");
    assert_eq!(first.data["server_id"], fx.server.id().to_string());

    let second = rx.recv().await.unwrap();
    assert_eq!(second.topic, "stats");
    assert_eq!(second.data["state"], "offline");
    assert!(second.data["network"]["rx_bytes"].is_u64());
}

#[tokio::test(flavor = "multi_thread")]
async fn console_lines_reach_history_and_feature_matches_fire() {
    let fx = server_fixture(|cfg| {
        cfg.egg.features.insert(
            "eula".to_string(),
            vec!["You need to agree to the EULA".to_string()],
        );
    });
    let mut rx = fx.server.subscribe(32);
    // Drain the two synthetic events.
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();

    fx.env.set_state(ProcessState::Running);
    // Drain the status event from the state flip.
    let ev = rx.recv().await.unwrap();
    assert_eq!(ev.topic, "status");

    fx.env
        .feed_line("[Server] You need to agree to the EULA to run the server");

    // Console line lands in history...
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, lines) = fx.server.logs(10);
    assert_eq!(lines.len(), 1);

    // ...and both the console event and the feature match are published.
    let mut topics = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        topics.push((ev.topic.clone(), ev.data));
    }
    assert!(topics.iter().any(|(t, _)| t == "console output"));
    let feature = topics
        .iter()
        .find(|(t, _)| t == "feature match")
        .expect("feature match event");
    assert_eq!(feature.1["key"], "eula");
    assert_eq!(feature.1["pattern"], "You need to agree to the EULA");
}

#[tokio::test(flavor = "multi_thread")]
async fn done_pattern_flips_starting_to_running() {
    let fx = server_fixture(|_| {});
    let mut proc_cfg = roost_remote::ProcessConfiguration::default();
    proc_cfg.startup.done = vec![")! For help, type \"help\"".to_string()];
    fx.server.update_process_configuration(proc_cfg);

    fx.env.set_state(ProcessState::Starting);
    fx.env.feed_line("[12:00:01] [Server thread/INFO]: Preparing spawn area");
    assert_eq!(fx.server.state(), ProcessState::Starting);

    fx.env
        .feed_line("[12:00:09] [Server thread/INFO]: Done (8.2s)! For help, type \"help\"");
    assert_eq!(fx.server.state(), ProcessState::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_command_echo_marks_offline_before_exit() {
    let fx = server_fixture(|cfg| cfg.crash_detection.enabled = false);
    let mut proc_cfg = roost_remote::ProcessConfiguration::default();
    proc_cfg.stop.kind = roost_env::StopType::Command;
    proc_cfg.stop.value = "stop".to_string();
    proc_cfg.startup.done = vec!["Done".to_string()];
    fx.server.update_process_configuration(proc_cfg);

    fx.env.set_state(ProcessState::Running);
    fx.env.feed_line("stop");
    assert_eq!(fx.server.state(), ProcessState::Offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn console_throttle_discards_overflow_from_history() {
    let fx = common::server_fixture_full(
        |cfg| cfg.crash_detection.enabled = false,
        |node| {
            // A wide window so the bucket cannot refill mid-test.
            node.throttle_lines = 100;
            node.throttle_window = Duration::from_secs(30);
        },
    );
    fx.env.set_state(ProcessState::Running);

    for i in 0..200 {
        fx.env.feed_line(&format!("spam {i}"));
    }
    let (_, lines) = fx.server.logs(100);
    // History ends at the admitted prefix, not the tail of the burst: the
    // overflow was consumed but discarded.
    assert_eq!(lines.last().unwrap(), "spam 99");
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_loop_restarts_once_then_suppresses() {
    let fx = server_fixture(|cfg| {
        cfg.crash_detection.enabled = true;
        cfg.crash_detection.timeout = 60;
    });
    let mut rx = fx.server.subscribe(64);

    // First unexpected exit: running -> offline with a dirty exit.
    fx.env.set_state(ProcessState::Running);
    fx.env.set_state(ProcessState::Offline);

    // The listener reacts asynchronously; the auto-restart shows up as a
    // start call on the environment.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if *fx.env.start_calls.lock().unwrap() == 1 {
            break;
        }
    }
    assert_eq!(*fx.env.start_calls.lock().unwrap(), 1);

    // Second crash 30 "seconds" later (immediately, well inside the
    // timeout): suppressed with a daemon message.
    fx.env.set_state(ProcessState::Running);
    fx.env.set_state(ProcessState::Offline);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*fx.env.start_calls.lock().unwrap(), 1);

    let mut saw_suppression = false;
    while let Ok(ev) = rx.try_recv() {
        if ev.topic == "daemon message" {
            let message = ev.data["message"].as_str().unwrap_or_default();
            if message.contains("crashing too rapidly") {
                saw_suppression = true;
            }
        }
    }
    assert!(saw_suppression, "expected a rapid-crash suppression message");
}
