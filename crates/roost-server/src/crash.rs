//! Crash detection and the one-shot disk limiter trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use roost_env::ProcessState;

use crate::{PowerAction, Server};

/// Per-server crash bookkeeping plus the disk limiter's one-shot state.
#[derive(Debug, Default)]
pub(crate) struct CrashHandler {
    last_crash: Mutex<Option<Instant>>,
    disk_triggered: AtomicBool,
}

impl CrashHandler {
    /// Re-arms the disk limiter; called whenever a boot succeeds.
    pub(crate) fn rearm_disk_limiter(&self) {
        self.disk_triggered.store(false, Ordering::Release);
    }

    /// Claims the one-shot trigger, returning true exactly once per boot.
    pub(crate) fn claim_disk_trigger(&self) -> bool {
        !self.disk_triggered.swap(true, Ordering::AcqRel)
    }

    fn seconds_since_last_crash(&self) -> Option<u64> {
        self.last_crash
            .lock()
            .expect("crash clock poisoned")
            .map(|at| at.elapsed().as_secs())
    }

    fn record_crash(&self) {
        *self.last_crash.lock().expect("crash clock poisoned") = Some(Instant::now());
    }
}

/// Outcome of evaluating an unexpected exit.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CrashDecision {
    Restart,
    /// Suppressed because the previous crash was too recent; carries the
    /// seconds since it happened.
    TooFrequent(u64),
    Ignore,
}

/// Pure decision logic, separated so it can be exercised without a
/// container runtime.
pub(crate) fn evaluate_crash(
    previous_state: ProcessState,
    exit_ok: bool,
    detection_enabled: bool,
    detect_clean_exit_as_crash: bool,
    seconds_since_last: Option<u64>,
    timeout: u64,
) -> CrashDecision {
    // An explicit stop is never treated as a crash, regardless of flags.
    if previous_state == ProcessState::Stopping {
        return CrashDecision::Ignore;
    }
    if !detection_enabled {
        return CrashDecision::Ignore;
    }
    if exit_ok && !detect_clean_exit_as_crash {
        return CrashDecision::Ignore;
    }
    match seconds_since_last {
        Some(elapsed) if elapsed < timeout => CrashDecision::TooFrequent(elapsed),
        _ => CrashDecision::Restart,
    }
}

impl Server {
    /// Handles a transition into offline that followed a running or
    /// starting state.
    pub(crate) async fn handle_unexpected_exit(self: &Arc<Self>, previous: ProcessState) {
        let cfg = self.config();
        let exit = self.environment().exit_state();

        let decision = evaluate_crash(
            previous,
            exit.ok,
            cfg.crash_detection.enabled,
            cfg.crash_detection.detect_clean_exit_as_crash,
            self.crash.seconds_since_last_crash(),
            cfg.crash_detection.timeout,
        );

        match decision {
            CrashDecision::Ignore => {}
            CrashDecision::TooFrequent(elapsed) => {
                tracing::warn!(server = %self.id(), elapsed, "aborting automatic restart: last crash was too recent");
                self.publish_daemon_message(&format!(
                    "Aborting automatic restart: last crash occurred {elapsed} seconds ago; the server is crashing too rapidly."
                ));
            }
            CrashDecision::Restart => {
                self.crash.record_crash();
                self.publish_daemon_message(&format!(
                    "Server process detected as entering a crashed state (exit code {}); restarting now.",
                    exit.exit_code
                ));
                if exit.oom_killed {
                    self.publish_daemon_message(
                        "The process was terminated by the kernel out-of-memory killer; consider raising the memory limit.",
                    );
                }
                let server = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = server
                        .handle_power_action(PowerAction::Start, Some(Duration::from_secs(30)))
                        .await
                    {
                        server.publish_error("failed to auto-restart crashed server", &err);
                    }
                });
            }
        }
    }

    /// One-shot disk limiter: ask the process to die, kill it after a
    /// minute if it has not.
    pub(crate) fn trigger_disk_limiter(self: &Arc<Self>) {
        if !self.crash.claim_disk_trigger() {
            return;
        }
        self.publish_daemon_message(
            "Server is exceeding the assigned disk space limit, stopping process now.",
        );
        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = server
                .environment()
                .wait_for_stop(Duration::from_secs(60), true)
                .await
            {
                server.publish_error(
                    "failed to stop server after exceeding space limit",
                    &err.into(),
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_stop_is_immune() {
        // Even with detect_clean_exit_as_crash, a user-issued stop must not
        // auto-restart.
        let decision = evaluate_crash(ProcessState::Stopping, false, true, true, None, 60);
        assert_eq!(decision, CrashDecision::Ignore);
    }

    #[test]
    fn clean_exit_ignored_unless_configured() {
        assert_eq!(
            evaluate_crash(ProcessState::Running, true, true, false, None, 60),
            CrashDecision::Ignore
        );
        assert_eq!(
            evaluate_crash(ProcessState::Running, true, true, true, None, 60),
            CrashDecision::Restart
        );
    }

    #[test]
    fn rapid_crashes_are_suppressed() {
        assert_eq!(
            evaluate_crash(ProcessState::Running, false, true, false, Some(30), 60),
            CrashDecision::TooFrequent(30)
        );
        assert_eq!(
            evaluate_crash(ProcessState::Running, false, true, false, Some(90), 60),
            CrashDecision::Restart
        );
        assert_eq!(
            evaluate_crash(ProcessState::Running, false, true, false, None, 60),
            CrashDecision::Restart
        );
    }

    #[test]
    fn disabled_detection_never_restarts() {
        assert_eq!(
            evaluate_crash(ProcessState::Running, false, false, true, None, 60),
            CrashDecision::Ignore
        );
    }

    #[test]
    fn disk_trigger_fires_once_per_arm() {
        let handler = CrashHandler::default();
        assert!(handler.claim_disk_trigger());
        assert!(!handler.claim_disk_trigger());
        handler.rearm_disk_limiter();
        assert!(handler.claim_disk_trigger());
    }
}
