//! Bollard-backed Docker driver.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;

use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSummary, CreateOutcome, CreateRequest,
    HealthcheckSpec, Result, RuntimeError,
};

/// Per-call timeout for Docker API requests.
const DOCKER_TIMEOUT_SECS: u64 = 5;

/// Docker driver over the local unix socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon at the given socket path.
    pub fn connect(socket: &str) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            socket,
            DOCKER_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| RuntimeError::Connection {
            reason: e.to_string(),
        })?;
        Ok(Self { docker })
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

fn api_error(operation: &'static str, err: bollard::errors::Error) -> RuntimeError {
    RuntimeError::Api {
        operation,
        reason: err.to_string(),
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| api_error("list", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| api_error("inspect", e))?;

        let config = response.config.unwrap_or_default();
        let healthcheck = config.healthcheck.map(|h| HealthcheckSpec {
            interval_ns: h.interval.unwrap_or_default(),
            timeout_ns: h.timeout.unwrap_or_default(),
            retries: h.retries.unwrap_or_default(),
        });

        // Network order is a map upstream; sort by network name so address
        // fallback is deterministic.
        let mut networks: Vec<(String, String)> = response
            .network_settings
            .and_then(|ns| ns.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
            .collect();
        networks.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(ContainerDetails {
            id: response.id.unwrap_or_default(),
            name: response.name.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            network_ips: networks.into_iter().map(|(_, ip)| ip).collect(),
            healthcheck,
        })
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(api_error("inspect", e)),
        }
    }

    async fn start(&self, id_or_name: &str) -> Result<()> {
        match self
            .docker
            .start_container(id_or_name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(api_error("start", e)),
        }
    }

    async fn create(&self, request: &CreateRequest) -> Result<CreateOutcome> {
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };

        let host_config = HostConfig {
            network_mode: Some(request.network_mode.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name(&request.restart_policy)),
                maximum_retry_count: None,
            }),
            cap_add: (!request.cap_add.is_empty()).then(|| request.cap_add.clone()),
            security_opt: (!request.security_opt.is_empty())
                .then(|| request.security_opt.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image.clone()),
            entrypoint: Some(request.entrypoint.clone()),
            cmd: Some(request.cmd.clone()),
            env: Some(request.env.clone()),
            labels: Some(request.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(response) => Ok(CreateOutcome::Created(response.id)),
            // 409: name already taken; the caller ensures it is running.
            Err(e) if status_code(&e) == Some(409) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(api_error("create", e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| api_error("remove", e))
    }
}
