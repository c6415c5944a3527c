mod container;
mod docker;
mod error;
mod identity;
mod limits;
mod pruning;
mod registry;
mod resolve;
mod security;
mod workspace;

pub use container::{compute_config_hash, ContainerManager, RecreateFilter, SandboxContainerInfo};
pub use docker::{
    build_create_config, ContainerRuntime, ContainerSpec, ContainerState, DockerRuntime,
    ExecResult, LABEL_CONFIG_HASH, LABEL_CREATED_AT, LABEL_SANDBOX, LABEL_SESSION_KEY,
};
pub use error::SandboxError;
pub use identity::{
    container_name, is_main_session_key, parse_agent_session_key, resolve_agent_id,
    resolve_sandbox_scope_key, slugify_session_key, ParsedSessionKey, DEFAULT_AGENT_ID,
    MAIN_SESSION_KEY, SHARED_SCOPE_KEY,
};
pub use limits::{MemoryLimit, UlimitValue};
pub use pruning::{should_prune, PruneReport, Pruner, DEFAULT_PRUNE_COOLDOWN};
pub use registry::{merge_entry, SandboxRegistry, SandboxRegistryData, SandboxRegistryEntry};
pub use resolve::{
    resolve_sandbox_config_for_agent, resolve_sandbox_docker_config, resolve_sandbox_prune_config,
    resolve_sandbox_scope, SandboxConfig, SandboxDockerConfig, SandboxPruneConfig,
    DEFAULT_CONTAINER_PREFIX, DEFAULT_SANDBOX_IMAGE,
};
pub use security::{SandboxMode, SandboxScope, SecurityPolicy, WorkspaceAccess};
pub use workspace::{resolve_sandbox_workspace_dir, SandboxWorkspace, AGENT_MOUNT_PATH};

use crate::config::Config;
use crate::tools::policy::{
    resolve_sandbox_tool_policy_for_agent, SandboxToolPolicy, SandboxToolPolicyResolved,
};
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};

/// Everything a sandboxed run needs to know about its container
#[derive(Debug, Clone, Serialize)]
pub struct SandboxContext {
    pub session_key: String,
    pub agent_id: Option<String>,
    pub scope_key: String,
    pub container_name: String,
    pub container_workdir: String,
    /// Host directory mounted at the container workdir
    pub workspace_dir: PathBuf,
    pub workspace_access: WorkspaceAccess,
    pub docker: SandboxDockerConfig,
    pub tools: SandboxToolPolicy,
}

/// Main sandbox manager API
pub struct SandboxManager {
    config: Arc<Config>,
    container_manager: Arc<ContainerManager>,
    pruner: Arc<Pruner>,
}

impl SandboxManager {
    /// Create a sandbox manager backed by the local Docker daemon
    pub fn new(config: Config) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::new()?);
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a sandbox manager over any container runtime
    pub fn with_runtime(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let registry = Arc::new(SandboxRegistry::in_state_dir(config.state_dir()));
        let container_manager = Arc::new(ContainerManager::new(runtime, registry));
        let pruner = Arc::new(Pruner::new(container_manager.clone()));

        info!(
            "Sandbox manager initialized: mode={}, scope={}, registry={}",
            config.sandbox.mode.unwrap_or_default(),
            resolve_sandbox_scope(config.sandbox.scope, config.sandbox.per_session),
            container_manager.registry().path().display()
        );

        Self {
            config: Arc::new(config),
            container_manager,
            pruner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn container_manager(&self) -> &Arc<ContainerManager> {
        &self.container_manager
    }

    pub fn pruner(&self) -> &Arc<Pruner> {
        &self.pruner
    }

    /// Effective sandbox config for an agent (global layer when `None`)
    pub fn resolve_config(&self, agent_id: Option<&str>) -> SandboxConfig {
        resolve_sandbox_config_for_agent(&self.config, agent_id)
    }

    pub fn resolve_tool_policy(&self, agent_id: Option<&str>) -> SandboxToolPolicyResolved {
        resolve_sandbox_tool_policy_for_agent(&self.config, agent_id)
    }

    /// Provision (or reuse) the sandbox for a run. Returns `None` when the
    /// run is not sandboxed under the agent's mode. Provisioning failures
    /// surface as [`SandboxError::Unavailable`].
    pub async fn resolve_context(
        &self,
        session_key: &str,
        agent_id: Option<&str>,
        is_main: Option<bool>,
    ) -> Result<Option<SandboxContext>> {
        let session_key = session_key.trim();
        let agent_id = agent_id
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty())
            .or_else(|| resolve_agent_id(session_key));
        let cfg = self.resolve_config(agent_id.as_deref());

        let policy = SecurityPolicy { mode: cfg.mode };
        let is_main = is_main.unwrap_or_else(|| is_main_session_key(session_key));
        if !policy.should_sandbox(is_main) {
            debug!("Session {} runs unsandboxed (mode: {})", session_key, cfg.mode);
            return Ok(None);
        }

        self.pruner.maybe_prune(&self.config).await;

        let scope_key = resolve_sandbox_scope_key(cfg.scope, session_key, agent_id.as_deref());
        let name = container_name(&cfg.docker.container_prefix, cfg.scope, &scope_key);
        let workspace = SandboxWorkspace::resolve(&cfg, &scope_key);

        workspace
            .ensure()
            .await
            .map_err(|e| SandboxError::unavailable(&name, &e))?;

        let container_name = self
            .container_manager
            .ensure_sandbox_container(&cfg, &scope_key, &workspace)
            .await
            .map_err(|e| SandboxError::unavailable(&name, &e))?;

        Ok(Some(SandboxContext {
            session_key: session_key.to_string(),
            agent_id,
            scope_key,
            container_name,
            container_workdir: workspace.container_workdir.clone(),
            workspace_dir: workspace.mounted_dir().to_path_buf(),
            workspace_access: workspace.access,
            docker: cfg.docker,
            tools: cfg.tools,
        }))
    }

    /// Execute a command inside a resolved sandbox
    pub async fn execute(&self, ctx: &SandboxContext, command: &[&str]) -> Result<ExecResult> {
        self.container_manager
            .execute_in_container(&ctx.container_name, command)
            .await
    }

    /// List all registered sandbox containers
    pub async fn list_containers(&self) -> Vec<SandboxContainerInfo> {
        self.container_manager
            .list_sandbox_containers(&self.config)
            .await
    }

    /// Manually remove a specific container
    pub async fn remove_container(&self, container_name: &str) -> Result<()> {
        self.container_manager
            .remove_sandbox_container(container_name)
            .await
    }

    pub async fn recreate(&self, filter: &RecreateFilter) -> Result<Vec<String>> {
        self.container_manager
            .recreate_sandbox_containers(filter)
            .await
    }

    pub async fn maybe_prune(&self) -> Option<PruneReport> {
        self.pruner.maybe_prune(&self.config).await
    }

    pub async fn prune_now(&self) -> Result<PruneReport> {
        self.pruner.prune_once(&self.config).await
    }

    /// Start the background prune ticker. `None` when the check interval is 0.
    pub fn start_periodic_pruning(&self) -> Option<JoinHandle<()>> {
        let prune = self.resolve_config(None).prune;
        if prune.check_interval_minutes == 0 {
            info!("Sandbox pruning service disabled");
            return None;
        }

        info!(
            "Sandbox pruning service started (idle_hours={}, max_age_days={}, every {}m)",
            prune.idle_hours, prune.max_age_days, prune.check_interval_minutes
        );
        Some(self.pruner.clone().spawn_periodic(
            self.config.clone(),
            Duration::from_secs(prune.check_interval_minutes * 60),
        ))
    }

    /// Get information about the sandbox configuration for an agent
    pub fn get_config_info(&self, agent_id: Option<&str>) -> String {
        let cfg = self.resolve_config(agent_id);
        let policy = SecurityPolicy { mode: cfg.mode };
        let docker = &cfg.docker;

        let mut lines = vec![
            format!(
                "Sandbox Configuration ({}):",
                agent_id.unwrap_or("global")
            ),
            format!("  Mode: {}", cfg.mode),
            format!("  Policy: {}", policy.describe()),
            format!("  Scope: {}", cfg.scope),
            format!("  Workspace access: {}", cfg.workspace_access),
            format!("  Workspace root: {}", cfg.workspace_root.display()),
            format!("  Agent workspace: {}", cfg.agent_workspace.display()),
            format!("  Image: {}", docker.image),
            format!("  Container prefix: {}", docker.container_prefix),
            format!("  Workdir: {}", docker.workdir),
            format!("  Network: {}", docker.network),
            format!("  Read-only root: {}", docker.read_only_root),
        ];
        if !docker.binds.is_empty() {
            lines.push(format!("  Binds: {}", docker.binds.join(", ")));
        }
        lines.push(format!(
            "  Prune: idle {}h, max age {}d, check every {}m",
            cfg.prune.idle_hours, cfg.prune.max_age_days, cfg.prune.check_interval_minutes
        ));
        lines.push(String::new());
        lines.push(self.resolve_tool_policy(agent_id).describe());

        lines.join("\n")
    }
}
