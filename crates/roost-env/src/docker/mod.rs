//! Docker Engine implementation of the container environment.

mod container;
mod image;
mod stats;
mod stream;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{KillContainerOptions, RemoveContainerOptions, WaitContainerOptions};
use bollard::Docker;
use futures::StreamExt;
use roost_error::CommonError;
use roost_events::Bus;
use tokio::io::AsyncWriteExt;

use crate::{
    ContainerSpec, EnvError, Environment, ExitState, LogCallback, ProcessState, Result, StateHolder,
    Stats, StopType,
};

/// Registry credentials for private images.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Node-level Docker settings shared by every environment instance.
#[derive(Debug, Clone)]
pub struct DockerSettings {
    /// Name of the daemon-managed container network.
    pub network_name: String,
    /// DNS servers injected into containers.
    pub dns: Vec<String>,
    /// Size of the `/tmp` tmpfs mount in megabytes.
    pub tmpfs_size_mb: u64,
    /// json-file log rotation settings.
    pub log_max_size: String,
    pub log_max_files: String,
    /// `uid:gid` the workload runs as.
    pub container_user: String,
    /// Registry host -> credentials.
    pub registries: std::collections::HashMap<String, RegistryAuth>,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            network_name: "roost0".to_string(),
            dns: vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()],
            tmpfs_size_mb: 100,
            log_max_size: "5m".to_string(),
            log_max_files: "1".to_string(),
            container_user: String::new(),
            registries: std::collections::HashMap::new(),
        }
    }
}

/// Connects a Docker client using the standard environment variables and
/// local socket discovery.
pub fn connect() -> Result<Docker> {
    Ok(Docker::connect_with_local_defaults()?)
}

/// The production [`Environment`] backed by the Docker Engine API.
pub struct DockerEnvironment {
    weak: std::sync::Weak<Self>,
    client: Docker,
    uuid: String,
    settings: DockerSettings,
    bus: Bus,
    state: StateHolder,
    spec: RwLock<ContainerSpec>,
    exit: RwLock<ExitState>,
    stats: RwLock<Stats>,
    started_at: RwLock<Option<Instant>>,
    log_cb: RwLock<Option<Arc<LogCallback>>>,
    stdin: tokio::sync::Mutex<Option<std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>>>,
}

impl DockerEnvironment {
    /// Creates an environment for one server. The bus is created here; the
    /// owning server subscribes through [`Environment::events`].
    #[must_use]
    pub fn new(client: Docker, uuid: String, spec: ContainerSpec, settings: DockerSettings) -> Arc<Self> {
        let bus = Bus::new();
        let state = StateHolder::new(uuid.clone(), bus.clone());
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            client,
            uuid,
            settings,
            bus,
            state,
            spec: RwLock::new(spec),
            exit: RwLock::new(ExitState::default()),
            stats: RwLock::new(Stats::default()),
            started_at: RwLock::new(None),
            log_cb: RwLock::new(None),
            stdin: tokio::sync::Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("environment dropped while in use")
    }

    fn spec_snapshot(&self) -> ContainerSpec {
        self.spec.read().expect("spec lock poisoned").clone()
    }

    /// Replaces the stored container spec, used when the Panel pushes a new
    /// configuration.
    pub fn update_spec(&self, spec: ContainerSpec) {
        *self.spec.write().expect("spec lock poisoned") = spec;
    }

    pub(crate) fn record_exit(&self, exit: ExitState) {
        *self.exit.write().expect("exit lock poisoned") = exit;
    }

    pub(crate) fn record_stats(&self, stats: Stats) {
        *self.stats.write().expect("stats lock poisoned") = stats;
    }

    pub(crate) fn console_line(&self, line: &str) {
        let cb = self.log_cb.read().expect("log callback poisoned").clone();
        if let Some(cb) = cb {
            cb(line);
        }
    }

    /// Handles the container going away: capture the exit state, reset the
    /// sample, drop stdin, and flip the state to offline.
    pub(crate) async fn on_container_exit(self: &Arc<Self>) {
        let exit = match self.client.inspect_container(&self.uuid, None).await {
            Ok(info) => {
                let state = info.state.unwrap_or_default();
                let code = state.exit_code.unwrap_or_default();
                let oom = state.oom_killed.unwrap_or(false);
                ExitState {
                    exit_code: code,
                    ok: code == 0 && !oom,
                    oom_killed: oom,
                }
            }
            Err(err) => {
                tracing::warn!(server = %self.uuid, error = %err, "failed to inspect exited container");
                ExitState {
                    exit_code: -1,
                    ok: false,
                    oom_killed: false,
                }
            }
        };
        self.record_exit(exit);
        self.record_stats(Stats::default());
        *self.started_at.write().expect("uptime lock poisoned") = None;
        self.stdin.lock().await.take();
        self.state.set(ProcessState::Offline);
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn events(&self) -> &Bus {
        &self.bus
    }

    async fn exists(&self) -> Result<bool> {
        match self.client.inspect_container(&self.uuid, None).await {
            Ok(_) => Ok(true),
            Err(err) if is_docker_404(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn is_running(&self) -> Result<bool> {
        match self.client.inspect_container(&self.uuid, None).await {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(err) if is_docker_404(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self, spec: ContainerSpec) -> Result<()> {
        self.update_spec(spec);
        let spec = self.spec_snapshot();

        match self.client.inspect_container(&self.uuid, None).await {
            Ok(existing) => {
                let current_image = existing
                    .config
                    .as_ref()
                    .and_then(|c| c.image.clone())
                    .unwrap_or_default();
                if current_image == spec.image {
                    return Ok(());
                }
                // Image changed: the container is recreated from scratch.
                tracing::info!(
                    server = %self.uuid,
                    old = %current_image,
                    new = %spec.image,
                    "container image changed, recreating"
                );
                self.client
                    .remove_container(
                        &self.uuid,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await?;
            }
            Err(err) if is_docker_404(&err) => {}
            Err(err) => return Err(err.into()),
        }

        image::ensure_pulled(self, &spec.image).await?;
        container::create(self, &spec).await
    }

    async fn start(&self) -> Result<()> {
        let arc = self.arc();

        if !self.exists().await? {
            return Err(EnvError::not_found(format!("container {}", self.uuid)));
        }

        self.state.set(ProcessState::Starting);

        // Attach before starting so the earliest output lines are captured.
        if let Err(err) = container::attach(&arc).await {
            self.state.set(ProcessState::Offline);
            return Err(err);
        }

        if let Err(err) = self
            .client
            .start_container::<String>(&self.uuid, None)
            .await
        {
            self.state.set(ProcessState::Offline);
            return Err(err.into());
        }

        *self.started_at.write().expect("uptime lock poisoned") = Some(Instant::now());
        stats::spawn_poller(&arc);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let spec = self.spec_snapshot();
        if self.state.get() == ProcessState::Offline {
            return Ok(());
        }
        self.state.set(ProcessState::Stopping);

        match spec.stop.kind {
            StopType::Command => self.attach_input(&spec.stop.value).await,
            // Both signal kinds deliver exactly one signal and nothing else.
            // The engine's native stop endpoint force-kills after a grace
            // period, which only terminate()/wait_for_stop may do, so the
            // "stop" kind sends the default SIGTERM the same way.
            StopType::Signal | StopType::Stop => {
                let signal = if spec.stop.kind == StopType::Stop || spec.stop.value.is_empty() {
                    "SIGTERM".to_string()
                } else {
                    spec.stop.value.clone()
                };
                self.client
                    .kill_container(&self.uuid, Some(KillContainerOptions { signal }))
                    .await
                    .map_err(EnvError::from)
            }
        }
    }

    async fn wait_for_stop(&self, timeout: Duration, terminate: bool) -> Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }

        let mut wait = self
            .client
            .wait_container(&self.uuid, None::<WaitContainerOptions<String>>);

        match tokio::time::timeout(timeout, wait.next()).await {
            Ok(_) => Ok(()),
            Err(_) if terminate => self.terminate("SIGKILL").await,
            Err(_) => Err(EnvError::Common(CommonError::timeout(format!(
                "container {} did not stop within {}s",
                self.uuid,
                timeout.as_secs()
            )))),
        }
    }

    async fn terminate(&self, signal: &str) -> Result<()> {
        if !self.is_running().await? {
            // Killing a stopped server is a no-op success.
            self.state.set(ProcessState::Offline);
            return Ok(());
        }
        self.client
            .kill_container(&self.uuid, Some(KillContainerOptions { signal }))
            .await?;
        self.state.set(ProcessState::Offline);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        match self
            .client
            .remove_container(
                &self.uuid,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_docker_404(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn attach_input(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(EnvError::invalid_state(
                "cannot send input: container is not attached",
            ));
        };
        writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| EnvError::Common(CommonError::Io(e)))?;
        writer
            .flush()
            .await
            .map_err(|e| EnvError::Common(CommonError::Io(e)))?;
        Ok(())
    }

    fn exit_state(&self) -> ExitState {
        *self.exit.read().expect("exit lock poisoned")
    }

    fn state(&self) -> ProcessState {
        self.state.get()
    }

    fn set_state(&self, state: ProcessState) {
        self.state.set(state);
    }

    fn uptime(&self) -> u64 {
        self.started_at
            .read()
            .expect("uptime lock poisoned")
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn resources(&self) -> Stats {
        *self.stats.read().expect("stats lock poisoned")
    }

    fn set_log_callback(&self, cb: Arc<LogCallback>) {
        *self.log_cb.write().expect("log callback poisoned") = Some(cb);
    }
}

pub(crate) fn is_docker_404(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
