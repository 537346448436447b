//! The node-wide server registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bollard::Docker;
use roost_env::docker::{DockerEnvironment, DockerSettings};
use roost_env::{Environment, ProcessState};
use roost_remote::{RawServerData, RemoteClient};
use uuid::Uuid;

use crate::activity::ActivityStore;
use crate::config::{NodeSettings, ServerConfiguration};
use crate::{CommonError, Result, Server};

/// Owns every server instance assigned to this node.
pub struct Manager {
    servers: RwLock<HashMap<Uuid, Arc<Server>>>,
    remote: Arc<dyn RemoteClient>,
    docker: Docker,
    docker_settings: DockerSettings,
    activity: Arc<ActivityStore>,
    node: NodeSettings,
}

impl Manager {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        docker: Docker,
        docker_settings: DockerSettings,
        activity: Arc<ActivityStore>,
        node: NodeSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
            remote,
            docker,
            docker_settings,
            activity,
            node,
        })
    }

    #[must_use]
    pub fn node(&self) -> &NodeSettings {
        &self.node
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
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Fetches every server from the Panel and initializes their runtimes,
    /// recovering the running state of containers that survived a daemon
    /// restart.
    pub async fn boot(self: &Arc<Self>) -> Result<()> {
        let servers = self
            .remote
            .get_servers()
            .await
            .map_err(CommonError::from)?;
        tracing::info!(total = servers.len(), "fetched servers from panel, initializing runtimes");

        for raw in servers {
            match self.init_server(raw).await {
                Ok(server) => {
                    // A daemon restart must not flip live containers
                    // offline.
                    if let Ok(true) = server.environment().is_running().await {
                        server.environment().set_state(ProcessState::Running);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to initialize server from panel data");
                }
            }
        }
        Ok(())
    }

    /// Builds a server instance from Panel data and registers it.
    pub async fn init_server(self: &Arc<Self>, raw: RawServerData) -> Result<Arc<Server>> {
        let cfg: ServerConfiguration = serde_json::from_value(raw.settings)
            .map_err(|e| CommonError::invalid_input(format!("server settings: {e}")))?;

        let spec = cfg.container_spec(&self.node, raw.process_configuration.stop.clone());
        let env: Arc<dyn Environment> = DockerEnvironment::new(
            self.docker.clone(),
            cfg.uuid.to_string(),
            spec,
            self.docker_settings.clone(),
        );

        let server = Server::new(
            cfg,
            raw.process_configuration,
            env,
            Arc::clone(&self.remote),
            Arc::clone(&self.activity),
            self.node.clone(),
        )?;

        self.servers
            .write()
            .expect("server registry poisoned")
            .insert(server.id(), Arc::clone(&server));
        Ok(server)
    }

    /// Handles a Panel creation request: fetch the configuration, register
    /// the instance, run the installer in the background, and optionally
    /// start the server once installed.
    pub async fn create_server(
        self: &Arc<Self>,
        uuid: Uuid,
        start_on_completion: bool,
    ) -> Result<Arc<Server>> {
        if self.get(uuid).is_some() {
            return Err(CommonError::already_exists(format!("server {uuid}")));
        }

        let response = self
            .remote
            .get_server_configuration(uuid)
            .await
            .map_err(CommonError::from)?;
        let server = self
            .init_server(RawServerData {
                uuid,
                settings: response.settings,
                process_configuration: response.process_configuration,
            })
            .await?;

        let docker = self.docker.clone();
        let install_target = Arc::clone(&server);
        tokio::spawn(async move {
            match install_target.install(docker, false).await {
                Ok(()) if start_on_completion => {
                    if let Err(err) = install_target
                        .handle_power_action(crate::PowerAction::Start, Some(std::time::Duration::from_secs(30)))
                        .await
                    {
                        install_target.publish_error("failed to start server after install", &err);
                    }
                }
                Ok(()) => {}
                Err(err) => {
                    install_target.publish_error("server installation failed", &err);
                }
            }
        });

        Ok(server)
    }

    #[must_use]
    pub fn get(&self, uuid: Uuid) -> Option<Arc<Server>> {
        self.servers
            .read()
            .expect("server registry poisoned")
            .get(&uuid)
            .cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Server>> {
        self.servers
            .read()
            .expect("server registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Deletes a server: cancels its context (tearing down every
    /// subordinate task), destroys the container and data directory,
    /// deregisters it, and optionally deletes its local backups.
    pub async fn delete_server(&self, uuid: Uuid, remove_backups: bool) -> Result<()> {
        let server = self
            .get(uuid)
            .ok_or_else(|| CommonError::not_found(format!("server {uuid}")))?;

        server.destroy().await?;

        if remove_backups {
            let dir = self.node.backup_dir.join(uuid.to_string());
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(server = %uuid, error = %err, "failed to remove server backups");
                }
            }
        }

        self.servers
            .write()
            .expect("server registry poisoned")
            .remove(&uuid);
        Ok(())
    }

    /// Deregisters without touching disk; used when an inbound transfer is
    /// aborted and its skeleton must vanish.
    pub fn forget(&self, uuid: Uuid) {
        self.servers
            .write()
            .expect("server registry poisoned")
            .remove(&uuid);
    }

    /// Severs every WebSocket and SFTP session the user holds on any
    /// server of this node.
    pub fn deauthorize_user(&self, user: Uuid) {
        for server in self.all() {
            server.websockets().deauthorize(user);
            server.sftp_sessions().deauthorize(user);
        }
    }
}
