use crate::sandbox::resolve::SandboxDockerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::stream::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

pub const LABEL_SANDBOX: &str = "rustyclaw.sandbox";
pub const LABEL_SESSION_KEY: &str = "rustyclaw.session_key";
pub const LABEL_CREATED_AT: &str = "rustyclaw.created_at_ms";
pub const LABEL_CONFIG_HASH: &str = "rustyclaw.config_hash";

/// Result of command execution in container
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Observed state of a named container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub exists: bool,
    pub running: bool,
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub docker: SandboxDockerConfig,
    /// Workspace mounts, placed ahead of the configured binds
    pub workspace_binds: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Operations the sandbox lifecycle needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the container exists and whether it is running
    async fn container_state(&self, name: &str) -> Result<ContainerState>;

    /// Start an existing, stopped container
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Force-remove a container; an absent container is not an error
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Image reference the container was created from
    async fn inspect_image(&self, name: &str) -> Result<Option<String>>;

    /// Create (but do not start) a container
    async fn create_container(&self, spec: &ContainerSpec) -> Result<()>;

    /// Run a command inside a running container
    async fn exec(&self, name: &str, command: &[&str]) -> Result<ExecResult>;
}

/// Translate a container spec into the Docker create request. Every field
/// of [`SandboxDockerConfig`] maps onto a create parameter here.
pub fn build_create_config(spec: &ContainerSpec) -> Result<Config<String>> {
    let docker = &spec.docker;

    let env: Vec<String> = docker
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let tmpfs: HashMap<String, String> = docker
        .tmpfs
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((path, options)) => (path.to_string(), options.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect();

    let binds: Vec<String> = spec
        .workspace_binds
        .iter()
        .chain(docker.binds.iter())
        .cloned()
        .collect();

    let memory = docker
        .memory
        .as_ref()
        .map(|m| m.to_bytes())
        .transpose()
        .context("Invalid docker.memory")?;
    let memory_swap = docker
        .memory_swap
        .as_ref()
        .map(|m| m.to_bytes())
        .transpose()
        .context("Invalid docker.memory_swap")?;

    let mut ulimits = Vec::with_capacity(docker.ulimits.len());
    for (name, value) in &docker.ulimits {
        let (soft, hard) = value.to_soft_hard(name)?;
        ulimits.push(ResourcesUlimits {
            name: Some(name.clone()),
            soft: Some(soft),
            hard: Some(hard),
        });
    }

    let mut security_opt = vec![];
    if let Some(profile) = &docker.seccomp_profile {
        security_opt.push(format!("seccomp={}", profile));
    }
    if let Some(profile) = &docker.apparmor_profile {
        security_opt.push(format!("apparmor={}", profile));
    }

    let host_config = HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        network_mode: Some(docker.network.clone()),
        readonly_rootfs: Some(docker.read_only_root),
        tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
        cap_drop: (!docker.cap_drop.is_empty()).then(|| docker.cap_drop.clone()),
        pids_limit: docker.pids_limit,
        memory,
        memory_swap,
        nano_cpus: docker.cpus.map(|cpus| (cpus * 1_000_000_000.0).round() as i64),
        ulimits: (!ulimits.is_empty()).then_some(ulimits),
        security_opt: (!security_opt.is_empty()).then_some(security_opt),
        dns: docker.dns.clone(),
        extra_hosts: docker.extra_hosts.clone(),
        ..Default::default()
    };

    Ok(Config {
        image: Some(docker.image.clone()),
        user: docker.user.clone(),
        env: Some(env),
        working_dir: Some(docker.workdir.clone()),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Docker client wrapper with RustyClaw-specific helpers
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Create a new Docker client
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// Pull an image from registry if not present
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!("Image already exists: {}", image);
            return Ok(());
        }

        info!("Pulling Docker image: {}", image);

        let create_image_options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self
            .client
            .create_image(Some(create_image_options), None, None);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull image {}", image))?;
        }

        info!("Successfully pulled Docker image: {}", image);
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn container_state(&self, name: &str) -> Result<ContainerState> {
        let options = InspectContainerOptions { size: false };
        match self.client.inspect_container(name, Some(options)).await {
            Ok(response) => Ok(ContainerState {
                exists: true,
                running: response
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
            }),
            Err(e) if is_not_found(&e) => Ok(ContainerState::default()),
            Err(e) => Err(anyhow::anyhow!("Failed to inspect container {}: {}", name, e)),
        }
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let options: Option<StartContainerOptions<String>> = None;
        self.client
            .start_container(name, options)
            .await
            .with_context(|| format!("Failed to start container {}", name))?;

        info!("Started container: {}", name);
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => {
                info!("Removed container: {}", name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!("Container already absent: {}", name);
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container {}: {}", name, e)),
        }
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", name))?;

        Ok(response.config.and_then(|config| config.image))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        let container_config = build_create_config(spec)?;
        self.pull_image(&spec.docker.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;

        info!("Created container: {} (id: {})", spec.name, response.id);
        Ok(())
    }

    async fn exec(&self, name: &str, command: &[&str]) -> Result<ExecResult> {
        let exec_options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec_id = self
            .client
            .create_exec(name, exec_options)
            .await
            .context("Failed to create exec instance")?;

        let output = self
            .client
            .start_exec(&exec_id.id, None)
            .await
            .context("Failed to start exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect_result = self
            .client
            .inspect_exec(&exec_id.id)
            .await
            .context("Failed to inspect exec")?;

        let exit_code = inspect_result.exit_code.unwrap_or(-1);

        debug!(
            "Command executed in container {}: exit_code={}, stdout_len={}, stderr_len={}",
            name,
            exit_code,
            stdout.len(),
            stderr.len()
        );

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
        })
    }
}
