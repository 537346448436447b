//! Shared fixtures: a scriptable in-memory environment and a no-op Panel
//! client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use roost_env::{
    ContainerSpec, EnvError, Environment, ExitState, LogCallback, ProcessState, StateHolder, Stats,
};
use roost_events::Bus;
use roost_remote::{
    ActivityEvent, BackupRemoteUploadResponse, BackupRequest, InstallationScript,
    ProcessConfiguration, RawServerData, RemoteClient, ServerConfigurationResponse,
};
use roost_server::{CommonError, NodeSettings, Server, ServerConfiguration};
use uuid::Uuid;

/// Environment double: flips states instantly and records calls.
pub struct MockEnvironment {
    bus: Bus,
    state: StateHolder,
    pub exit: Mutex<ExitState>,
    pub running: AtomicBool,
    pub start_calls: Mutex<u32>,
    pub kill_calls: Mutex<u32>,
    /// Artificial latency inside start(), for lock-contention tests.
    pub start_delay: Mutex<Duration>,
    /// When set, stop() only signals: the process stays up until killed.
    pub hang_on_stop: AtomicBool,
    log_cb: Mutex<Option<Arc<LogCallback>>>,
}

impl MockEnvironment {
    pub fn new(uuid: &str) -> Arc<Self> {
        let bus = Bus::new();
        let state = StateHolder::new(uuid.to_string(), bus.clone());
        Arc::new(Self {
            bus,
            state,
            exit: Mutex::new(ExitState::default()),
            running: AtomicBool::new(false),
            start_calls: Mutex::new(0),
            kill_calls: Mutex::new(0),
            start_delay: Mutex::new(Duration::ZERO),
            hang_on_stop: AtomicBool::new(false),
            log_cb: Mutex::new(None),
        })
    }

    pub fn feed_line(&self, line: &str) {
        let cb = self.log_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(line);
        }
    }
}

#[async_trait]
impl Environment for MockEnvironment {
    fn events(&self) -> &Bus {
        &self.bus
    }

    async fn exists(&self) -> roost_env::Result<bool> {
        Ok(true)
    }

    async fn is_running(&self) -> roost_env::Result<bool> {
        Ok(self.running.load(Ordering::Acquire))
    }

    async fn create(&self, _spec: ContainerSpec) -> roost_env::Result<()> {
        Ok(())
    }

    async fn start(&self) -> roost_env::Result<()> {
        let delay = *self.start_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        *self.start_calls.lock().unwrap() += 1;
        self.running.store(true, Ordering::Release);
        self.state.set(ProcessState::Starting);
        Ok(())
    }

    async fn stop(&self) -> roost_env::Result<()> {
        self.state.set(ProcessState::Stopping);
        if self.hang_on_stop.load(Ordering::Acquire) {
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        self.state.set(ProcessState::Offline);
        Ok(())
    }

    async fn wait_for_stop(&self, timeout: Duration, terminate: bool) -> roost_env::Result<()> {
        if self.hang_on_stop.load(Ordering::Acquire) && self.running.load(Ordering::Acquire) {
            if terminate {
                return self.terminate("SIGKILL").await;
            }
            return Err(EnvError::Common(CommonError::timeout(format!(
                "container did not stop within {}s",
                timeout.as_secs()
            ))));
        }
        self.running.store(false, Ordering::Release);
        self.state.set(ProcessState::Offline);
        Ok(())
    }

    async fn terminate(&self, _signal: &str) -> roost_env::Result<()> {
        *self.kill_calls.lock().unwrap() += 1;
        self.running.store(false, Ordering::Release);
        self.state.set(ProcessState::Offline);
        Ok(())
    }

    async fn destroy(&self) -> roost_env::Result<()> {
        Ok(())
    }

    async fn attach_input(&self, _line: &str) -> roost_env::Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EnvError::invalid_state("not attached"));
        }
        Ok(())
    }

    fn exit_state(&self) -> ExitState {
        *self.exit.lock().unwrap()
    }

    fn state(&self) -> ProcessState {
        self.state.get()
    }

    fn set_state(&self, state: ProcessState) {
        self.state.set(state);
    }

    fn uptime(&self) -> u64 {
        0
    }

    fn resources(&self) -> Stats {
        Stats::default()
    }

    fn set_log_callback(&self, cb: Arc<LogCallback>) {
        *self.log_cb.lock().unwrap() = Some(cb);
    }
}

/// Panel client double answering with canned data.
pub struct MockRemote {
    pub settings: Mutex<serde_json::Value>,
    pub transfer_reports: Mutex<Vec<(Uuid, bool)>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(serde_json::json!({})),
            transfer_reports: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get_servers(&self) -> roost_remote::Result<Vec<RawServerData>> {
        Ok(Vec::new())
    }

    async fn get_server_configuration(
        &self,
        uuid: Uuid,
    ) -> roost_remote::Result<ServerConfigurationResponse> {
        let mut settings = self.settings.lock().unwrap().clone();
        settings["uuid"] = serde_json::json!(uuid.to_string());
        Ok(ServerConfigurationResponse {
            settings,
            process_configuration: ProcessConfiguration::default(),
        })
    }

    async fn get_installation_script(
        &self,
        _uuid: Uuid,
    ) -> roost_remote::Result<InstallationScript> {
        Ok(InstallationScript {
            container_image: String::new(),
            entrypoint: String::new(),
            script: String::new(),
        })
    }

    async fn set_installation_status(
        &self,
        _uuid: Uuid,
        _successful: bool,
        _reinstall: bool,
    ) -> roost_remote::Result<()> {
        Ok(())
    }

    async fn set_transfer_status(&self, uuid: Uuid, successful: bool) -> roost_remote::Result<()> {
        self.transfer_reports.lock().unwrap().push((uuid, successful));
        Ok(())
    }

    async fn get_backup_remote_upload_urls(
        &self,
        _backup: Uuid,
        _size: u64,
    ) -> roost_remote::Result<BackupRemoteUploadResponse> {
        Ok(BackupRemoteUploadResponse {
            parts: Vec::new(),
            part_size: 0,
        })
    }

    async fn set_backup_status(
        &self,
        _backup: Uuid,
        _data: &BackupRequest,
    ) -> roost_remote::Result<()> {
        Ok(())
    }

    async fn send_restoration_status(
        &self,
        _backup: Uuid,
        _successful: bool,
    ) -> roost_remote::Result<()> {
        Ok(())
    }

    async fn send_activity_logs(&self, _activity: &[ActivityEvent]) -> roost_remote::Result<()> {
        Ok(())
    }
}

pub struct Fixture {
    pub tmp: tempfile::TempDir,
    pub server: Arc<Server>,
    pub env: Arc<MockEnvironment>,
    pub remote: Arc<MockRemote>,
}

/// Builds a server around the mock environment inside a temp directory.
pub fn server_fixture(mutate: impl FnOnce(&mut ServerConfiguration)) -> Fixture {
    server_fixture_full(mutate, |_| {})
}

/// Fixture variant that also tunes the node settings.
pub fn server_fixture_full(
    mutate: impl FnOnce(&mut ServerConfiguration),
    tune: impl FnOnce(&mut NodeSettings),
) -> Fixture {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut node = NodeSettings {
        data_dir: tmp.path().join("volumes"),
        backup_dir: tmp.path().join("backups"),
        log_dir: tmp.path().join("logs"),
        tmp_dir: tmp.path().join("tmp"),
        ..Default::default()
    };
    tune(&mut node);

    let mut cfg = ServerConfiguration {
        uuid: Uuid::new_v4(),
        ..Default::default()
    };
    mutate(&mut cfg);

    let env = MockEnvironment::new(&cfg.uuid.to_string());
    let remote = MockRemote::new();
    let activity = Arc::new(
        roost_server::activity::ActivityStore::open(&tmp.path().join("activity.db")).unwrap(),
    );

    let server = Server::new(
        cfg,
        ProcessConfiguration::default(),
        env.clone() as Arc<dyn Environment>,
        remote.clone() as Arc<dyn RemoteClient>,
        activity,
        node,
    )
    .unwrap();

    Fixture {
        tmp,
        server,
        env,
        remote,
    }
}
