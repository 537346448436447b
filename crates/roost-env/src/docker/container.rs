//! Container creation and stream attachment.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::{AttachContainerOptions, Config, CreateContainerOptions, LogOutput};
use bollard::models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum, PortBinding};
use futures::StreamExt;

use super::DockerEnvironment;
use crate::{ContainerSpec, Result};

use super::stream::LineSplitter;

/// Builds and creates the server container from its spec.
pub(crate) async fn create(env: &DockerEnvironment, spec: &ContainerSpec) -> Result<()> {
    let (exposed, bindings) = port_map(spec);

    let mut mounts = vec![Mount {
        target: Some("/home/container".to_string()),
        source: Some(spec.data_path.clone()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(false),
        ..Default::default()
    }];
    for extra in &spec.mounts {
        mounts.push(Mount {
            target: Some(extra.target.clone()),
            source: Some(extra.source.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(extra.read_only),
            ..Default::default()
        });
    }

    let mut tmpfs = HashMap::new();
    tmpfs.insert(
        "/tmp".to_string(),
        format!("rw,exec,nosuid,size={}M", env.settings.tmpfs_size_mb),
    );

    let (cpu_quota, cpu_period) = spec.limits.cpu_quota();

    let host_config = HostConfig {
        memory: Some(spec.limits.memory_limit_bytes()),
        memory_reservation: Some(spec.limits.memory * 1024 * 1024),
        memory_swap: Some(spec.limits.memory_swap_bytes()),
        cpu_quota,
        cpu_period,
        cpu_shares: Some(1024),
        cpuset_cpus: if spec.limits.threads.is_empty() {
            None
        } else {
            Some(spec.limits.threads.clone())
        },
        blkio_weight: Some(spec.limits.io as u16),
        oom_kill_disable: Some(spec.limits.oom_disabled),
        pids_limit: Some(512),
        mounts: Some(mounts),
        tmpfs: Some(tmpfs),
        port_bindings: Some(bindings),
        dns: Some(env.settings.dns.clone()),
        network_mode: Some(if spec.network_mode.is_empty() {
            env.settings.network_name.clone()
        } else {
            spec.network_mode.clone()
        }),
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(HashMap::from([
                ("max-size".to_string(), env.settings.log_max_size.clone()),
                ("max-file".to_string(), env.settings.log_max_files.clone()),
            ])),
        }),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        cap_drop: Some(vec![
            "setpcap".to_string(),
            "mknod".to_string(),
            "audit_write".to_string(),
            "net_raw".to_string(),
            "dac_override".to_string(),
            "fowner".to_string(),
            "fsetid".to_string(),
            "net_bind_service".to_string(),
        ]),
        ..Default::default()
    };

    let config = Config {
        hostname: Some(spec.uuid.clone()),
        domainname: None,
        user: if env.settings.container_user.is_empty() {
            None
        } else {
            Some(env.settings.container_user.clone())
        },
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        tty: Some(true),
        exposed_ports: Some(exposed),
        env: Some(spec.env.clone()),
        cmd: Some(split_invocation(&spec.invocation)),
        image: Some(spec.image.clone()),
        working_dir: Some("/home/container".to_string()),
        labels: Some(HashMap::from([(
            "Service".to_string(),
            "Roost".to_string(),
        )])),
        host_config: Some(host_config),
        ..Default::default()
    };

    env.client
        .create_container(
            Some(CreateContainerOptions {
                name: spec.uuid.clone(),
                platform: None,
            }),
            config,
        )
        .await?;
    Ok(())
}

/// Attaches stdin/stdout/stderr and spawns the output consumer. The
/// consumer pushes complete lines to the log callback and, when the stream
/// ends, records the exit state and flips the process offline.
pub(crate) async fn attach(env: &Arc<DockerEnvironment>) -> Result<()> {
    let results = env
        .client
        .attach_container(
            &env.uuid,
            Some(AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(false),
                ..Default::default()
            }),
        )
        .await?;

    *env.stdin.lock().await = Some(results.input);

    let consumer = Arc::clone(env);
    let mut output = results.output;
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        while let Some(item) = output.next().await {
            match item {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    splitter.push(&message, |line| consumer.console_line(line));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(err) => {
                    tracing::debug!(server = %consumer.uuid, error = %err, "container output stream error");
                    break;
                }
            }
        }
        if let Some(line) = splitter.take_remainder() {
            consumer.console_line(&line);
        }
        // Stream EOF means the container is gone.
        consumer.on_container_exit().await;
    });

    Ok(())
}

fn port_map(
    spec: &ContainerSpec,
) -> (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
) {
    let mut exposed = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (ip, ports) in &spec.allocations.mappings {
        for port in ports {
            for proto in ["tcp", "udp"] {
                let key = format!("{port}/{proto}");
                exposed.insert(key.clone(), HashMap::new());
                bindings.entry(key).or_insert_with(|| Some(Vec::new())).get_or_insert_with(Vec::new).push(
                    PortBinding {
                        host_ip: Some(ip.clone()),
                        host_port: Some(port.to_string()),
                    },
                );
            }
        }
    }
    (exposed, bindings)
}

/// Splits the processed invocation into an argv the runtime accepts,
/// honoring single and double quotes.
fn split_invocation(invocation: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in invocation.chars() {
        match (ch, quote) {
            ('"' | '\'', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            (c, None) if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::split_invocation;

    #[test]
    fn splits_plain_arguments() {
        assert_eq!(
            split_invocation("java -Xms128M -jar server.jar"),
            vec!["java", "-Xms128M", "-jar", "server.jar"]
        );
    }

    #[test]
    fn honors_quotes() {
        assert_eq!(
            split_invocation("./start --name \"My Server\" --flag 'a b'"),
            vec!["./start", "--name", "My Server", "--flag", "a b"]
        );
    }
}
