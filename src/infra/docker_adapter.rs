use crate::domain::{
    BuildLogFormat, BuildOutput, BuildRequest, Container, ContainerEngine, ContainerHealthStatus,
    ContainerState, EngineError, ExecOutput, Mount, RegistryAuth, RestartPolicy, Service,
    TransferStatus,
};
use crate::infra::archive::DOCKERFILE_NAME;
use crate::infra::buildx;
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions, TagImageOptions};
use bollard::models::{
    ContainerStateStatusEnum, HealthConfig, HealthStatusEnum, HostConfig, MountTypeEnum,
    PortBinding, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::RemoveVolumeOptions;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::debug;

/// Seconds the daemon waits before killing a container on stop/restart.
const STOP_GRACE_SECS: i64 = 10;

fn engine_err(e: DockerError) -> EngineError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerError::IOError { err } => EngineError::Io(err),
        other => EngineError::Daemon(other.to_string()),
    }
}

/// [`ContainerEngine`] over the Docker Engine API. Builds go through the
/// legacy builder unless `buildkit` is set, in which case they are delegated
/// to `docker buildx`.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    buildkit: bool,
}

impl DockerEngine {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    pub fn connect(buildkit: bool) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(engine_err)?;
        Ok(Self { docker, buildkit })
    }

    /// Fails when the daemon does not answer.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(engine_err)?;
        Ok(())
    }

    /// The legacy builder has no secret mounts, so secrets travel as build
    /// args here.
    fn classic_build(&self, request: BuildRequest) -> BuildOutput<'_> {
        if !request.secrets.is_empty() {
            debug!("legacy build of {} receives secrets as build args", request.image);
        }
        let buildargs: HashMap<String, String> = request
            .args
            .iter()
            .chain(&request.secrets)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let options = BuildImageOptions {
            dockerfile: DOCKERFILE_NAME.to_string(),
            t: request.image.clone(),
            target: request.target.clone().unwrap_or_default(),
            buildargs,
            rm: true,
            ..Default::default()
        };

        let records = self
            .docker
            .build_image(options, None, Some(request.context))
            .map(|item| {
                let info = item.map_err(engine_err)?;
                serde_json::to_vec(&info).map_err(|e| EngineError::Daemon(e.to_string()))
            })
            .boxed();

        BuildOutput {
            format: BuildLogFormat::Classic,
            records,
        }
    }
}

fn container_config(service: &Service) -> Config<String> {
    let container = &service.container;
    let host = &service.host;

    let exposed_ports = container
        .exposed_ports
        .iter()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    let port_bindings = host
        .port_bindings
        .iter()
        .map(|binding| {
            (
                binding.container_key(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(binding.host_port.to_string()),
                }]),
            )
        })
        .collect();

    let mounts = host
        .mounts
        .iter()
        .map(|mount| match mount {
            Mount::Volume { name, target } => bollard::models::Mount {
                target: Some(target.clone()),
                source: Some(name.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            },
            Mount::Bind { source, target } => bollard::models::Mount {
                target: Some(target.clone()),
                source: Some(source.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            },
        })
        .collect();

    let restart = match host.restart_policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    };

    let healthcheck = container.healthcheck.as_ref().map(|check| HealthConfig {
        test: Some(check.test.clone()),
        interval: Some(check.interval_duration().as_nanos() as i64),
        timeout: Some(check.timeout_duration().as_nanos() as i64),
        retries: Some(i64::from(check.retries)),
        ..Default::default()
    });

    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

    Config {
        image: Some(service.image.clone()),
        hostname: Some(service.name.clone()),
        env: Some(container.env_pairs()),
        exposed_ports: Some(exposed_ports),
        entrypoint: non_empty(&container.entrypoint),
        cmd: non_empty(&container.command),
        healthcheck,
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(restart),
                maximum_retry_count: None,
            }),
            network_mode: (!host.network.is_empty()).then(|| host.network.clone()),
            mounts: Some(mounts),
            cap_add: non_empty(&container.cap_add),
            security_opt: non_empty(&host.security_opt),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_from_inspect(
    name: &str,
    response: bollard::models::ContainerInspectResponse,
) -> Container {
    let state = response.state.unwrap_or_default();
    let running = matches!(
        state.status,
        Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING)
    ) || state.running == Some(true);

    let health = match state.health.and_then(|h| h.status) {
        Some(HealthStatusEnum::HEALTHY) => ContainerHealthStatus::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => ContainerHealthStatus::Unhealthy,
        Some(HealthStatusEnum::STARTING) => ContainerHealthStatus::Starting,
        Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {
            ContainerHealthStatus::NotApplicable
        }
    };

    let mut container = Container::new(
        name,
        if running {
            ContainerState::Running
        } else {
            ContainerState::Stopped
        },
    );
    container.health = health;
    container
}

fn split_tag(image: &str) -> (&str, &str) {
    // a colon after the last slash separates the tag, otherwise it is a port
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match engine_err(e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    fn build_image(&self, request: BuildRequest) -> Result<BuildOutput<'_>, EngineError> {
        if self.buildkit {
            buildx::build(request)
        } else {
            Ok(self.classic_build(request))
        }
    }

    fn pull_image(&self, image: &str) -> BoxStream<'_, Result<TransferStatus, EngineError>> {
        let (repo, tag) = split_tag(image);
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .map_ok(|info| TransferStatus {
                id: info.id,
                status: info.status,
                current: info.progress_detail.as_ref().and_then(|p| p.current),
                total: info.progress_detail.as_ref().and_then(|p| p.total),
                error: info.error,
            })
            .map_err(engine_err)
            .boxed()
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<(), EngineError> {
        let (repo, tag) = split_tag(target);
        debug!("tagging {source} as {repo}:{tag}");
        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await
            .map_err(engine_err)
    }

    fn push_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> BoxStream<'_, Result<TransferStatus, EngineError>> {
        let (repo, tag) = split_tag(image);
        let credentials = DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.server.clone()),
            ..Default::default()
        };

        self.docker
            .push_image(
                repo,
                Some(PushImageOptions {
                    tag: tag.to_string(),
                }),
                Some(credentials),
            )
            .map_ok(|info| TransferStatus {
                id: None,
                status: info.status,
                current: info.progress_detail.as_ref().and_then(|p| p.current),
                total: info.progress_detail.as_ref().and_then(|p| p.total),
                error: info.error,
            })
            .map_err(engine_err)
            .boxed()
    }

    async fn ensure_network(&self, name: &str) -> Result<(), EngineError> {
        let existing = self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await;
        match existing.map_err(engine_err) {
            Ok(_) => return Ok(()),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        debug!("creating network {name}");
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(engine_err)?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.docker.remove_network(name).await.map_err(engine_err)
    }

    async fn inspect_container(&self, name: &str) -> Result<Container, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(container_from_inspect(name, response)),
            Err(e) => match engine_err(e) {
                EngineError::NotFound(_) => Ok(Container::not_created(name)),
                other => Err(other),
            },
        }
    }

    async fn create_container(&self, service: &Service) -> Result<(), EngineError> {
        let options = CreateContainerOptions {
            name: service.name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), container_config(service))
            .await
            .map_err(engine_err)?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_err)
    }

    async fn stop_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(engine_err)
    }

    async fn restart_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .restart_container(
                name,
                Some(RestartContainerOptions {
                    t: STOP_GRACE_SECS as isize,
                }),
            )
            .await
            .map_err(engine_err)
    }

    async fn remove_container(&self, name: &str, remove_volumes: bool) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    v: remove_volumes,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_err)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(engine_err)
    }

    async fn wait_container(&self, name: &str) -> Result<i64, EngineError> {
        let mut responses = self.docker.wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running".to_string(),
            }),
        );

        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // non-zero exits surface as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(engine_err(e)),
            None => Err(EngineError::Daemon(format!(
                "wait on {name} ended without a status"
            ))),
        }
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, EngineError> {
        let created = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_err)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(engine_err)?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk.map_err(engine_err)?.to_string());
            }
        }

        let inspected = self.docker.inspect_exec(&created.id).await.map_err(engine_err)?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code,
            output,
        })
    }
}
