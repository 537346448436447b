//! The server aggregate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use roost_env::{Environment, ProcessState};
use roost_events::{topic, Bus, Event, SinkPool};
use roost_fs::Filesystem;
use roost_remote::{ProcessConfiguration, RemoteClient};
use roost_system::Rate;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::ActivityStore;
use crate::config::{NodeSettings, ServerConfiguration};
use crate::crash::CrashHandler;
use crate::resources::{ResourceHolder, ResourceUsage};
use crate::sessions::SessionRegistry;
use crate::{CommonError, Result};

/// A single managed workload: container, files, configuration, and live
/// state. Everything subordinate to the server hangs off its cancellation
/// context and dies with it.
pub struct Server {
    id: Uuid,
    ctx: CancellationToken,
    cfg: RwLock<Arc<ServerConfiguration>>,
    proc_cfg: RwLock<Arc<ProcessConfiguration>>,
    fs: Arc<Filesystem>,
    env: Arc<dyn Environment>,
    bus: Bus,
    sinks: SinkPool,
    remote: Arc<dyn RemoteClient>,
    node: NodeSettings,
    activity: Arc<ActivityStore>,

    pub(crate) power_lock: tokio::sync::Mutex<()>,
    pub(crate) throttler: Rate,
    pub(crate) crash: CrashHandler,
    pub(crate) resources: ResourceHolder,

    installing: AtomicBool,
    transferring: AtomicBool,
    restoring: AtomicBool,

    websockets: SessionRegistry,
    sftp: SessionRegistry,

    pub(crate) transfer: tokio::sync::Mutex<Option<Arc<crate::transfer::Transfer>>>,
    pull_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Assembles a server from its configuration snapshot and environment.
    /// Event listeners start immediately and live until the server is
    /// deleted.
    pub fn new(
        cfg: ServerConfiguration,
        proc_cfg: ProcessConfiguration,
        env: Arc<dyn Environment>,
        remote: Arc<dyn RemoteClient>,
        activity: Arc<ActivityStore>,
        node: NodeSettings,
    ) -> Result<Arc<Self>> {
        let id = cfg.uuid;
        let fs = Arc::new(Filesystem::new(
            node.data_dir.join(id.to_string()),
            cfg.build.disk_bytes(),
            node.disk_check_interval,
        )?);

        let bus = Bus::new();
        let sinks = SinkPool::new(&bus, node.console_history, &id.to_string());
        let throttler = Rate::new(node.throttle_lines, node.throttle_window);
        let websockets = SessionRegistry::new(node.websocket_limit);
        let sftp = SessionRegistry::new(0);
        let pull_semaphore = Arc::new(Semaphore::new(node.download_limit.max(1)));

        let server = Arc::new(Self {
            id,
            ctx: CancellationToken::new(),
            cfg: RwLock::new(Arc::new(cfg)),
            proc_cfg: RwLock::new(Arc::new(proc_cfg)),
            fs,
            env,
            bus,
            sinks,
            remote,
            node,
            activity,
            power_lock: tokio::sync::Mutex::new(()),
            throttler,
            crash: CrashHandler::default(),
            resources: ResourceHolder::default(),
            installing: AtomicBool::new(false),
            transferring: AtomicBool::new(false),
            restoring: AtomicBool::new(false),
            websockets,
            sftp,
            transfer: tokio::sync::Mutex::new(None),
            pull_semaphore,
        });

        crate::listeners::start_event_listeners(&server);
        Ok(server)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The current configuration snapshot. Copy-on-write: the `Arc` the
    /// caller receives never mutates.
    #[must_use]
    pub fn config(&self) -> Arc<ServerConfiguration> {
        Arc::clone(&self.cfg.read().expect("config lock poisoned"))
    }

    /// Swaps in a new configuration snapshot and propagates the fields
    /// sub-components cache (disk limit).
    pub fn update_configuration(&self, cfg: ServerConfiguration) {
        self.fs.set_limit(cfg.build.disk_bytes());
        *self.cfg.write().expect("config lock poisoned") = Arc::new(cfg);
    }

    #[must_use]
    pub fn process_configuration(&self) -> Arc<ProcessConfiguration> {
        Arc::clone(&self.proc_cfg.read().expect("process config lock poisoned"))
    }

    pub fn update_process_configuration(&self, cfg: ProcessConfiguration) {
        *self.proc_cfg.write().expect("process config lock poisoned") = Arc::new(cfg);
    }

    #[must_use]
    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    #[must_use]
    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    #[must_use]
    pub fn events(&self) -> &Bus {
        &self.bus
    }

    #[must_use]
    pub fn sinks(&self) -> &SinkPool {
        &self.sinks
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    #[must_use]
    pub fn activity(&self) -> &Arc<ActivityStore> {
        &self.activity
    }

    #[must_use]
    pub fn node(&self) -> &NodeSettings {
        &self.node
    }

    /// The cancellation context every subordinate task is tied to.
    #[must_use]
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.env.state()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.env.state() == ProcessState::Running
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    #[must_use]
    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::Acquire)
    }

    pub fn set_installing(&self, value: bool) {
        self.installing.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::Acquire)
    }

    pub fn set_transferring(&self, value: bool) {
        self.transferring.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::Acquire)
    }

    pub fn set_restoring(&self, value: bool) {
        self.restoring.store(value, Ordering::Release);
    }

    /// Suspension combines the Panel flag with disk-quota suspension.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.config().suspended
    }

    // ------------------------------------------------------------------
    // Console & events
    // ------------------------------------------------------------------

    /// Publishes a daemon-attributed message to the console history and the
    /// `daemon message` topic.
    pub fn publish_daemon_message(&self, message: &str) {
        self.sinks.log().push(&format!("[Roost Daemon]: {message}"));
        self.bus.publish(
            topic::DAEMON_MESSAGE,
            json!({ "server_id": self.id.to_string(), "message": message }),
        );
    }

    /// Publishes a background-task failure without terminating anything.
    pub fn publish_error(&self, context: &str, err: &CommonError) {
        tracing::error!(server = %self.id, error = %err, "{context}");
        self.bus.publish(
            topic::DAEMON_ERROR,
            json!({ "server_id": self.id.to_string(), "context": context, "error": err.to_string() }),
        );
    }

    /// Point-in-time resource record.
    #[must_use]
    pub fn proc(&self) -> ResourceUsage {
        let mut usage = self.resources.snapshot(self.env.state());
        usage.uptime = self.env.uptime();
        usage.disk_bytes = self.fs.cached_usage();
        usage
    }

    /// Console history snapshot, capped at 100 lines for the API surface.
    #[must_use]
    pub fn logs(&self, n: usize) -> (ProcessState, Vec<String>) {
        (self.env.state(), self.sinks.log().snapshot(n.min(100)))
    }

    /// Sends a command line to the running process.
    pub async fn send_command(&self, line: &str) -> Result<()> {
        let state = self.env.state();
        if !state.is_running() {
            return Err(CommonError::invalid_state(format!(
                "cannot send command to {state} server"
            )));
        }
        self.env
            .attach_input(line)
            .await
            .map_err(CommonError::from)
    }

    /// Subscribes a new consumer to the server's event stream. The first
    /// two deliveries are a synthetic `status` and one `stats`, so every
    /// connection starts from a known state.
    #[must_use]
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(2));
        let _ = tx.try_send(Event::new(
            topic::STATUS,
            json!({ "server_id": self.id.to_string(), "state": self.env.state() }),
        ));
        let _ = tx.try_send(Event::new(
            topic::STATS,
            self.stats_payload(),
        ));
        self.bus.subscribe(tx);
        rx
    }

    pub(crate) fn stats_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::to_value(self.proc()).expect("resource record serializes");
        payload["server_id"] = json!(self.id.to_string());
        payload
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    #[must_use]
    pub fn websockets(&self) -> &SessionRegistry {
        &self.websockets
    }

    #[must_use]
    pub fn sftp_sessions(&self) -> &SessionRegistry {
        &self.sftp
    }

    /// Permit gate for remote-pull downloads (per-server concurrency cap).
    #[must_use]
    pub fn pull_semaphore(&self) -> &Arc<Semaphore> {
        &self.pull_semaphore
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Cancels the instance context, stops and removes the container, and
    /// deletes the data directory. Called by the manager during deletion.
    pub async fn destroy(&self) -> Result<()> {
        self.ctx.cancel();
        self.websockets.cancel_all();
        self.sftp.cancel_all();

        if let Err(err) = self.env.terminate("SIGKILL").await {
            if !err.is_not_found() {
                tracing::warn!(server = %self.id, error = %err, "failed to terminate container during deletion");
            }
        }
        // Even when the runtime refuses, the data directory must go; a
        // half-deleted server must never keep user files around.
        let env_result = self.env.destroy().await;
        self.bus.close();

        let path = self.fs.path().to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(path))
            .await
            .map_err(|e| CommonError::internal(e.to_string()))?
            .map_err(CommonError::Io)?;

        env_result.map_err(CommonError::from)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("state", &self.env.state())
            .finish_non_exhaustive()
    }
}
