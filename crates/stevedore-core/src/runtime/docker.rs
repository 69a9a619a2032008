use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::{HealthStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Bind, ContainerRuntime, HealthStatus, LaunchSpec, LogChunk, RunningContainer};
use crate::error::{Error, Result};

/// Docker Engine implementation of [`ContainerRuntime`] via bollard.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the platform's default socket or `DOCKER_HOST`.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Container(format!("connecting to docker: {e}")))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn container_name(spec_name: &str) -> String {
    let mut base: String = spec_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    if base.is_empty() {
        base = "step".to_string();
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{base}-{}", &suffix[..8])
}

/// Parse a `"host:container"` port declaration.
fn parse_port(decl: &str) -> Result<(u16, u16)> {
    let (host, container) = decl
        .split_once(':')
        .ok_or_else(|| Error::Validation(format!("port '{decl}' is not 'host:container'")))?;
    let host: u16 = host
        .parse()
        .map_err(|_| Error::Validation(format!("invalid host port in '{decl}'")))?;
    let container: u16 = container
        .parse()
        .map_err(|_| Error::Validation(format!("invalid container port in '{decl}'")))?;
    Ok((host, container))
}

fn bind_string(bind: &Bind) -> String {
    let mut s = format!("{}:{}", bind.host.display(), bind.container);
    if bind.read_only {
        s.push_str(":ro");
    }
    s
}

fn build_config(launch: &LaunchSpec) -> Result<Config<String>> {
    let spec = &launch.spec;

    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let mut binds: Vec<String> = spec
        .volumes
        .iter()
        .map(|(host, container)| format!("{host}:{container}"))
        .collect();
    binds.extend(launch.extra_binds.iter().map(bind_string));

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for decl in &spec.ports {
        let (host, container) = parse_port(decl)?;
        let key = format!("{container}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host.to_string()),
            }]),
        );
    }

    let (nano_cpus, memory) = match &launch.resources {
        Some(limits) => (limits.nano_cpus()?, limits.memory_bytes()?),
        None => (None, None),
    };

    Ok(Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
        entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
        env: (!env.is_empty()).then_some(env),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            nano_cpus,
            memory,
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, launch: &LaunchSpec) -> Result<RunningContainer> {
        let config = build_config(launch)?;
        let name = container_name(if launch.spec.name.is_empty() {
            &launch.spec.image
        } else {
            &launch.spec.name
        });

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::Container(format!("creating container '{name}': {e}")))?;

        let id = created.id;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("starting container '{name}': {e}")))?;

        // Inspect to resolve ephemeral host ports.
        let inspected = self
            .docker
            .inspect_container(&id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Container(format!("inspecting container '{name}': {e}")))?;

        let mut host_ports = HashMap::new();
        if let Some(ports) = inspected.network_settings.and_then(|ns| ns.ports) {
            for (exposed, bindings) in ports {
                let Some(container_port) = exposed
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                else {
                    continue;
                };
                let host_port = bindings
                    .iter()
                    .flatten()
                    .filter_map(|b| b.host_port.as_deref())
                    .find_map(|p| p.parse::<u16>().ok());
                if let Some(host_port) = host_port {
                    host_ports.insert(container_port, host_port);
                }
            }
        }

        debug!(container = %id, name, ?host_ports, "container started");
        Ok(RunningContainer { id, host_ports })
    }

    async fn wait_exit(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Bollard reports non-zero exits through this error variant.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Container(format!("waiting for container: {e}"))),
            None => Err(Error::Container(
                "wait stream ended without an exit status".into(),
            )),
        }
    }

    async fn logs(&self, id: &str, follow: bool) -> Result<BoxStream<'static, Result<LogChunk>>> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(LogChunk::Stdout(
                        String::from_utf8_lossy(&message).into_owned(),
                    ))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk::Stderr(
                        String::from_utf8_lossy(&message).into_owned(),
                    ))),
                    Ok(LogOutput::Console { message }) => Some(Ok(LogChunk::Stdout(
                        String::from_utf8_lossy(&message).into_owned(),
                    ))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(Error::Container(format!("streaming logs: {e}")))),
                }
            });

        Ok(stream.boxed())
    }

    async fn health(&self, id: &str) -> Result<HealthStatus> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Container(format!("inspecting container: {e}")))?;

        let status = inspected
            .state
            .and_then(|s| s.health)
            .and_then(|h| h.status);

        Ok(match status {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {
                HealthStatus::None
            }
        })
    }

    async fn stop_and_remove(&self, id: &str, force: bool) -> Result<()> {
        if force {
            if let Err(e) = self
                .docker
                .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await
            {
                // Already exited is fine.
                debug!(container = %id, error = %e, "kill before remove failed");
            }
        }

        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                warn!(container = %id, error = %e, "failed to remove container");
                Err(Error::Container(format!("removing container: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerSpec, ResourceLimits};

    #[test]
    fn port_declarations_parse() {
        assert_eq!(parse_port("8080:80").unwrap(), (8080, 80));
        assert_eq!(parse_port("0:5432").unwrap(), (0, 5432));
        assert!(parse_port("8080").is_err());
        assert!(parse_port("x:80").is_err());
    }

    #[test]
    fn container_names_are_sanitised() {
        let name = container_name("my step/with spaces");
        assert!(name.starts_with("mystepwithspaces-"));
        let fallback = container_name("///");
        assert!(fallback.starts_with("step-"));
    }

    #[test]
    fn config_carries_spec_fields() {
        let mut spec = ContainerSpec::new("alpine:3");
        spec.command = vec!["echo".into(), "hi".into()];
        spec.env.insert("KEY".into(), "value".into());
        spec.ports = vec!["0:80".into()];

        let mut launch = LaunchSpec::new(spec);
        launch.resources = Some(ResourceLimits {
            cpu_limit: Some("500m".into()),
            memory_limit: Some("64Mi".into()),
            ..Default::default()
        });
        launch.extra_binds.push(Bind {
            host: "/tmp/in".into(),
            container: "/in".into(),
            read_only: true,
        });

        let config = build_config(&launch).unwrap();
        assert_eq!(config.image.as_deref(), Some("alpine:3"));
        assert_eq!(config.cmd.as_ref().unwrap().len(), 2);
        assert_eq!(config.env.as_ref().unwrap()[0], "KEY=value");

        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.nano_cpus, Some(500_000_000));
        assert_eq!(host_config.memory, Some(64 * 1024 * 1024));
        assert!(host_config
            .binds
            .as_ref()
            .unwrap()
            .contains(&"/tmp/in:/in:ro".to_string()));
        assert!(host_config
            .port_bindings
            .as_ref()
            .unwrap()
            .contains_key("80/tcp"));
    }
}
