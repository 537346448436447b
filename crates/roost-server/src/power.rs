//! Power actions and the pre-start workflow.

use std::sync::Arc;
use std::time::Duration;

use roost_env::ProcessState;
use serde::{Deserialize, Serialize};

use crate::{CommonError, Result, Server};

/// The four caller-visible power verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
            Self::Kill => write!(f, "kill"),
        }
    }
}

/// How long a restart waits for a clean stop before killing.
const RESTART_STOP_WINDOW: Duration = Duration::from_secs(60);

impl Server {
    /// Executes a power action.
    ///
    /// All actions on one server serialize through a single mutex. With
    /// `wait` unset a busy server rejects the action with a conflict error;
    /// with `wait` set the caller blocks up to that long for the lock.
    ///
    /// For `stop`, the same window also bounds the stop itself: once the
    /// signal is sent the call waits up to `wait` for the process to exit
    /// and returns a timeout error when it does not — it never escalates to
    /// a kill, which stays a separate, explicit action. With no window the
    /// call returns as soon as the signal is sent.
    pub async fn handle_power_action(
        self: &Arc<Self>,
        action: PowerAction,
        wait: Option<Duration>,
    ) -> Result<()> {
        let _guard = match wait {
            None => self.power_lock.try_lock().map_err(|_| {
                CommonError::conflict(format!(
                    "another power action is being processed for server {}",
                    self.id()
                ))
            })?,
            Some(limit) => tokio::time::timeout(limit, self.power_lock.lock())
                .await
                .map_err(|_| {
                    CommonError::conflict(format!(
                        "timed out waiting for the power lock on server {}",
                        self.id()
                    ))
                })?,
        };

        tracing::info!(server = %self.id(), %action, "processing power action");
        match action {
            PowerAction::Start => {
                self.assert_startable()?;
                self.on_before_start().await?;
                self.environment().start().await.map_err(CommonError::from)
            }
            PowerAction::Stop => {
                // Stopping an already-offline server is a no-op.
                if self.state() == ProcessState::Offline {
                    return Ok(());
                }
                self.environment().stop().await.map_err(CommonError::from)?;
                // A zero window means fire-and-return; otherwise the stop
                // must complete within it. Kill-on-timeout is deliberately
                // off here.
                match wait {
                    Some(window) if !window.is_zero() => self
                        .environment()
                        .wait_for_stop(window, false)
                        .await
                        .map_err(CommonError::from),
                    _ => Ok(()),
                }
            }
            PowerAction::Restart => {
                if self.state() != ProcessState::Offline {
                    self.environment().stop().await.map_err(CommonError::from)?;
                    self.environment()
                        .wait_for_stop(RESTART_STOP_WINDOW, true)
                        .await
                        .map_err(CommonError::from)?;
                }
                self.assert_startable()?;
                self.on_before_start().await?;
                self.environment().start().await.map_err(CommonError::from)
            }
            PowerAction::Kill => self
                .environment()
                .terminate("SIGKILL")
                .await
                .map_err(CommonError::from),
        }
    }

    fn assert_startable(&self) -> Result<()> {
        if self.is_suspended() {
            return Err(CommonError::suspended(format!(
                "server {} is suspended",
                self.id()
            )));
        }
        if self.state() != ProcessState::Offline {
            return Err(CommonError::AlreadyRunning);
        }
        if self.is_installing() {
            return Err(CommonError::conflict("server is currently installing"));
        }
        if self.is_transferring() {
            return Err(CommonError::conflict("server is currently being transferred"));
        }
        if self.is_restoring() {
            return Err(CommonError::conflict(
                "server is currently restoring a backup",
            ));
        }
        Ok(())
    }

    /// The ordered pre-start workflow. Any failing step aborts the start
    /// and returns the process to offline.
    pub(crate) async fn on_before_start(self: &Arc<Self>) -> Result<()> {
        let result = self.run_prestart().await;
        if result.is_err() {
            self.environment().set_state(ProcessState::Offline);
        }
        result
    }

    async fn run_prestart(self: &Arc<Self>) -> Result<()> {
        let cfg = self.config();

        // 1. Flag the transition; subscribers see `status: starting`.
        self.environment().set_state(ProcessState::Starting);

        // 2. Disk quota gate.
        let fs = Arc::clone(self.filesystem());
        let used = tokio::task::spawn_blocking(move || fs.disk_usage(true))
            .await
            .map_err(|e| CommonError::internal(e.to_string()))??;
        let limit = self.filesystem().limit();
        if limit > 0 && used > limit {
            return Err(CommonError::suspended(
                "server is suspended: disk space limit exceeded",
            ));
        }

        // 3. Configuration-file rewrites.
        self.update_configuration_files().await;

        // 4. Ensure the container matches the desired image and limits.
        let spec = cfg.container_spec(self.node(), self.process_configuration().stop.clone());
        self.environment()
            .create(spec)
            .await
            .map_err(CommonError::from)?;

        // Step 5, the environment start, belongs to the caller.
        // 6. Re-arm the limiters for this boot.
        self.throttler.reset();
        self.crash.rearm_disk_limiter();
        Ok(())
    }

    /// Rewrites every egg-defined configuration file, a bounded pool of one
    /// worker per logical CPU. Per-file failures are logged and skipped; a
    /// missing file that may not be created is not an error.
    pub(crate) async fn update_configuration_files(self: &Arc<Self>) {
        let files = self.process_configuration().configs.clone();
        if files.is_empty() {
            return;
        }

        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2);
        let gate = Arc::new(tokio::sync::Semaphore::new(workers));
        let env_strings = self.config().environment_strings();

        let mut handles = Vec::with_capacity(files.len());
        for file in files {
            let permit = Arc::clone(&gate);
            let server = Arc::clone(self);
            let env_strings = env_strings.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("gate never closed");
                let name = file.resolved_name(&env_strings);
                let server = &server;
                let result = tokio::task::spawn_blocking({
                    let server = Arc::clone(server);
                    let name = name.clone();
                    move || server.rewrite_configuration_file(&file, &name)
                })
                .await;
                match result {
                    Ok(Ok(())) => {
                        tracing::debug!(server = %server.id(), file = %name, "finished processing configuration file");
                    }
                    Ok(Err(err)) => {
                        tracing::error!(server = %server.id(), file = %name, error = %err, "failed to process configuration file");
                    }
                    Err(err) => {
                        tracing::error!(server = %server.id(), file = %name, error = %err, "configuration worker panicked");
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn rewrite_configuration_file(
        &self,
        file: &roost_parser::ConfigurationFile,
        name: &str,
    ) -> Result<()> {
        let fs = self.filesystem();
        let contents = match fs.read(name) {
            Ok(contents) => contents,
            Err(err) if err.is_not_found() => {
                if !file.allow_create {
                    tracing::debug!(server = %self.id(), file = name, "file not created");
                    return Ok(());
                }
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let rewritten = file
            .parse(&contents, &self.node().config_json)
            .map_err(|e| CommonError::invalid_input(e.to_string()))?;

        let mut cursor = std::io::Cursor::new(&rewritten);
        fs.write_file(name, &mut cursor, rewritten.len() as u64, 0o644)?;
        Ok(())
    }
}
