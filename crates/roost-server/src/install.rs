//! Asynchronous server installation.
//!
//! Installation runs the egg's install script inside a throwaway container
//! with the server's data directory mounted at `/mnt/server`. Output is
//! mirrored to the install sink (and thus the `install output` topic) and
//! appended to the install log; the outcome is reported to the Panel either
//! way.

use std::io::Write;
use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use roost_events::topic;
use serde_json::json;

use crate::{CommonError, Result, Server};

impl Server {
    /// Runs the installation flow. The installing flag gates power actions
    /// for the duration; completion (success or failure) is always reported
    /// to the Panel and announced on the bus.
    pub async fn install(self: &Arc<Self>, docker: Docker, reinstall: bool) -> Result<()> {
        if self.is_installing() {
            return Err(CommonError::conflict("an installation is already running"));
        }
        self.set_installing(true);
        self.events().publish(
            topic::INSTALL_STARTED,
            json!({ "server_id": self.id().to_string() }),
        );

        let result = self.run_installation(&docker).await;
        let successful = result.is_ok();

        if let Err(err) = self
            .remote()
            .set_installation_status(self.id(), successful, reinstall)
            .await
        {
            tracing::warn!(server = %self.id(), error = %err, "failed to report installation status to panel");
        }

        self.set_installing(false);
        self.events().publish(
            topic::INSTALL_COMPLETED,
            json!({ "server_id": self.id().to_string(), "successful": successful }),
        );

        result
    }

    async fn run_installation(self: &Arc<Self>, docker: &Docker) -> Result<()> {
        let script = self
            .remote()
            .get_installation_script(self.id())
            .await
            .map_err(CommonError::from)?;

        if self.config().skip_egg_scripts || script.script.trim().is_empty() {
            tracing::info!(server = %self.id(), "skipping egg install script");
            return Ok(());
        }

        // Stage the script where the container can read it.
        let script_dir = self.node().tmp_dir.join(format!("install-{}", self.id()));
        tokio::fs::create_dir_all(&script_dir).await?;
        tokio::fs::write(script_dir.join("install.sh"), script.script.replace("\r\n", "\n"))
            .await?;

        let name = format!("{}_installer", self.id());
        let entrypoint = if script.entrypoint.is_empty() {
            "bash".to_string()
        } else {
            script.entrypoint.clone()
        };

        let result = self
            .run_install_container(docker, &name, &script.container_image, &entrypoint, &script_dir)
            .await;

        let _ = docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        let _ = tokio::fs::remove_dir_all(&script_dir).await;

        result
    }

    async fn run_install_container(
        self: &Arc<Self>,
        docker: &Docker,
        name: &str,
        image: &str,
        entrypoint: &str,
        script_dir: &std::path::Path,
    ) -> Result<()> {
        let cfg = self.config();
        let host_config = HostConfig {
            mounts: Some(vec![
                Mount {
                    target: Some("/mnt/server".to_string()),
                    source: Some(self.filesystem().path().to_string_lossy().into_owned()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(false),
                    ..Default::default()
                },
                Mount {
                    target: Some("/mnt/install".to_string()),
                    source: Some(script_dir.to_string_lossy().into_owned()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            network_mode: Some(self.node().network_mode.clone()),
            ..Default::default()
        };

        let mut env = cfg.environment_variables();
        env.push("SERVER_DIR=/mnt/server".to_string());

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                Config {
                    image: Some(image.to_string()),
                    env: Some(env),
                    cmd: Some(vec![
                        entrypoint.to_string(),
                        "/mnt/install/install.sh".to_string(),
                    ]),
                    working_dir: Some("/mnt/server".to_string()),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CommonError::internal(format!("docker: {e}")))?;

        docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| CommonError::internal(format!("docker: {e}")))?;

        // Stream output into the install sink and the install log.
        let log_path = self.node().install_log_path(self.id());
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log_file = std::fs::File::create(&log_path)?;
        writeln!(
            log_file,
            "Install log for server {} (image {image})",
            self.id()
        )?;

        let mut logs = docker.logs::<String>(
            name,
            Some(LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(item) = logs.next().await {
            match item {
                Ok(chunk) => {
                    let text = chunk.to_string();
                    for line in text.lines() {
                        self.sinks().install().push(line);
                        let _ = writeln!(log_file, "{line}");
                    }
                }
                Err(err) => {
                    tracing::debug!(server = %self.id(), error = %err, "install log stream ended");
                    break;
                }
            }
        }

        let mut wait = docker.wait_container(name, None::<WaitContainerOptions<String>>);
        let status = wait.next().await;
        let exit_code = match status {
            Some(Ok(body)) => body.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => {
                return Err(CommonError::internal(format!(
                    "failed waiting on install container: {err}"
                )))
            }
            None => 0,
        };

        if exit_code != 0 {
            return Err(CommonError::internal(format!(
                "install script exited with code {exit_code}"
            )));
        }
        Ok(())
    }
}
