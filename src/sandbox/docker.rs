//! Docker Engine API isolation provider.
//!
//! One container per execution: no network, memory/swap ceiling, CPU
//! quota, bounded pid count, all capabilities dropped, no privilege
//! escalation, read-only root filesystem (relaxed only when a scratch
//! directory is bind-mounted for plot artifacts). The candidate runs as a
//! single non-interactive `python -c` invocation; stdout and stderr come
//! back combined on the log stream.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use super::{ContextHandle, ContextSpec, IsolationProvider, SandboxError};

/// Prefix for container names, so leaked contexts are identifiable.
const CONTAINER_PREFIX: &str = "fluux-interp";

/// Mount point of the scratch directory inside the container.
const WORKSPACE_DIR: &str = "/workspace";

pub struct DockerProvider {
    docker: Docker,
}

impl DockerProvider {
    /// Connects to the local Docker daemon (socket or named pipe).
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(provider_err)?;
        Ok(Self { docker })
    }
}

fn provider_err(e: bollard::errors::Error) -> SandboxError {
    SandboxError::Provider(e.to_string())
}

#[async_trait]
impl IsolationProvider for DockerProvider {
    async fn create(&self, spec: &ContextSpec) -> Result<ContextHandle, SandboxError> {
        let name = format!("{CONTAINER_PREFIX}-{}", spec.execution_id);

        let binds = spec
            .scratch_dir
            .as_ref()
            .map(|dir| vec![format!("{}:{WORKSPACE_DIR}:rw", dir.display())]);

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes as i64),
            memory_swap: Some(spec.limits.memory_bytes as i64),
            nano_cpus: Some((spec.limits.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.limits.pids as i64),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(spec.scratch_dir.is_none()),
            binds,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "python".to_string(),
                "-c".to_string(),
                spec.code.clone(),
            ]),
            working_dir: spec
                .scratch_dir
                .as_ref()
                .map(|_| WORKSPACE_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!("Creating container {name} (image {})", spec.image);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(provider_err)?;

        Ok(ContextHandle { id: name })
    }

    async fn start(&self, ctx: &ContextHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container(&ctx.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(provider_err)
    }

    async fn stream_output(
        &self,
        ctx: &ContextHandle,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, SandboxError>>, SandboxError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&ctx.id, Some(options))
            .map(|item| {
                item.map(|log| log.into_bytes().to_vec())
                    .map_err(provider_err)
            })
            .boxed();

        Ok(stream)
    }

    async fn stop(&self, ctx: &ContextHandle) -> Result<(), SandboxError> {
        self.docker
            .stop_container(&ctx.id, Some(StopContainerOptions { t: 0 }))
            .await
            .map_err(provider_err)
    }

    async fn remove(&self, ctx: &ContextHandle) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                &ctx.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(provider_err)
    }
}
