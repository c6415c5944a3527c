use crate::config::Config;
use crate::sandbox::docker::{
    ContainerRuntime, ContainerSpec, ContainerState, ExecResult, LABEL_CONFIG_HASH,
    LABEL_CREATED_AT, LABEL_SANDBOX, LABEL_SESSION_KEY,
};
use crate::sandbox::identity::{container_name, resolve_agent_id};
use crate::sandbox::registry::{SandboxRegistry, SandboxRegistryEntry};
use crate::sandbox::resolve::{resolve_sandbox_config_for_agent, SandboxConfig, SandboxDockerConfig};
use crate::sandbox::security::WorkspaceAccess;
use crate::sandbox::workspace::SandboxWorkspace;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// A container used this recently is never recreated underneath a running tool
const HOT_CONTAINER_WINDOW_MS: i64 = 5 * 60 * 1000;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Registry entry plus live runtime state
#[derive(Debug, Clone, Serialize)]
pub struct SandboxContainerInfo {
    #[serde(flatten)]
    pub entry: SandboxRegistryEntry,
    pub running: bool,
    /// Image the container actually runs (the recorded image if inspection failed)
    pub actual_image: String,
    /// Image currently configured for the owning agent
    pub configured_image: String,
    pub image_match: bool,
}

/// Which registry entries a recreate applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecreateFilter {
    All,
    Session(String),
    Agent(String),
}

impl RecreateFilter {
    pub fn matches(&self, entry: &SandboxRegistryEntry) -> bool {
        match self {
            RecreateFilter::All => true,
            RecreateFilter::Session(key) => entry.session_key == *key,
            RecreateFilter::Agent(agent_id) => {
                resolve_agent_id(&entry.session_key).as_deref()
                    == Some(agent_id.trim().to_lowercase().as_str())
            }
        }
    }
}

#[derive(Serialize)]
struct ConfigHashInput<'a> {
    docker: &'a SandboxDockerConfig,
    workspace_access: WorkspaceAccess,
    workspace_dir: String,
    agent_workspace_dir: String,
}

/// Fingerprint of everything that shapes a container at creation time
pub fn compute_config_hash(docker: &SandboxDockerConfig, workspace: &SandboxWorkspace) -> String {
    let input = ConfigHashInput {
        docker,
        workspace_access: workspace.access,
        workspace_dir: workspace.sandbox_dir.display().to_string(),
        agent_workspace_dir: workspace.agent_dir.display().to_string(),
    };
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

type LockMap = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Held lock on one container name
struct ContainerLock<'a> {
    locks: &'a LockMap,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ContainerLock<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

/// Manages container lifecycle and the registry that tracks it
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SandboxRegistry>,
    locks: LockMap,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, registry: Arc<SandboxRegistry>) -> Self {
        Self {
            runtime,
            registry,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Per-container lock serializing provisioning and removal. The map entry
    /// is dropped again once nobody holds or waits on it.
    async fn lock_container(&self, name: &str) -> ContainerLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;

        ContainerLock {
            locks: &self.locks,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start the container if it exists but is stopped. A missing container
    /// is left alone; creating it is [`ensure_sandbox_container`](Self::ensure_sandbox_container)'s job.
    pub async fn ensure_docker_container_is_running(&self, name: &str) -> Result<()> {
        let state = self.runtime.container_state(name).await?;
        if state.exists && !state.running {
            self.runtime.start_container(name).await?;
        }
        Ok(())
    }

    /// Make sure the container for `scope_key` exists, matches the current
    /// config, and is running. Returns the container name.
    pub async fn ensure_sandbox_container(
        &self,
        cfg: &SandboxConfig,
        scope_key: &str,
        workspace: &SandboxWorkspace,
    ) -> Result<String> {
        let name = container_name(&cfg.docker.container_prefix, cfg.scope, scope_key);
        let _lock = self.lock_container(&name).await;

        let expected_hash = compute_config_hash(&cfg.docker, workspace);
        let now = now_ms();
        let mut state = self.runtime.container_state(&name).await?;
        let mut recorded_hash = Some(expected_hash.clone());

        if state.exists {
            let entry = self.registry.get(&name).await;
            let current_hash = entry.as_ref().and_then(|e| e.config_hash.clone());

            if current_hash.as_deref() != Some(expected_hash.as_str()) {
                let hot = state.running
                    && entry
                        .as_ref()
                        .map_or(true, |e| now - e.last_used_at_ms < HOT_CONTAINER_WINDOW_MS);

                if hot {
                    warn!(
                        "Sandbox config changed for {} but it was used in the last 5 minutes; keeping it until it goes idle",
                        name
                    );
                    recorded_hash = current_hash;
                } else {
                    info!("Sandbox config changed for {}, recreating container", name);
                    self.runtime
                        .remove_container(&name)
                        .await
                        .with_context(|| format!("Failed to remove stale container {}", name))?;
                    state = ContainerState::default();
                }
            }
        }

        if !state.exists {
            self.create_container(cfg, scope_key, workspace, &name, &expected_hash, now)
                .await?;
            // A new container starts a new record, not a merge into the old one
            if let Err(e) = self.registry.remove(&name).await {
                warn!("Failed to clear stale registry entry for {}: {:#}", name, e);
            }
        } else if !state.running {
            self.runtime.start_container(&name).await?;
        } else {
            debug!("Reusing running sandbox container {}", name);
        }

        let entry = SandboxRegistryEntry {
            container_name: name.clone(),
            session_key: scope_key.to_string(),
            created_at_ms: now,
            last_used_at_ms: now,
            image: cfg.docker.image.clone(),
            config_hash: recorded_hash,
        };
        if let Err(e) = self.registry.update(entry).await {
            warn!("Failed to record sandbox container {}: {:#}", name, e);
        }

        Ok(name)
    }

    async fn create_container(
        &self,
        cfg: &SandboxConfig,
        scope_key: &str,
        workspace: &SandboxWorkspace,
        name: &str,
        config_hash: &str,
        now: i64,
    ) -> Result<()> {
        let spec = ContainerSpec {
            name: name.to_string(),
            docker: cfg.docker.clone(),
            workspace_binds: workspace.binds(),
            labels: HashMap::from([
                (LABEL_SANDBOX.to_string(), "1".to_string()),
                (LABEL_SESSION_KEY.to_string(), scope_key.to_string()),
                (LABEL_CREATED_AT.to_string(), now.to_string()),
                (LABEL_CONFIG_HASH.to_string(), config_hash.to_string()),
            ]),
        };

        self.runtime.create_container(&spec).await?;
        self.runtime.start_container(name).await?;

        if let Some(setup_cmd) = &cfg.docker.setup_command {
            info!("Running setup command in container {}: {}", name, setup_cmd);
            let outcome = self.runtime.exec(name, &["sh", "-lc", setup_cmd]).await;
            let failure = match outcome {
                Ok(result) if result.exit_code == 0 => None,
                Ok(result) => Some(anyhow::anyhow!(
                    "Setup command failed with exit code {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                )),
                Err(e) => Some(e.context("Failed to run setup command")),
            };

            if let Some(err) = failure {
                // Leave nothing half-provisioned behind
                if let Err(e) = self.runtime.remove_container(name).await {
                    warn!("Failed to remove container {} after setup failure: {:#}", name, e);
                }
                return Err(err);
            }
        }

        info!(
            "Created and configured sandbox container: {} (image: {})",
            name, cfg.docker.image
        );
        Ok(())
    }

    /// All registered containers with live state and image drift
    pub async fn list_sandbox_containers(&self, cfg: &Config) -> Vec<SandboxContainerInfo> {
        let registry = self.registry.read().await;
        let mut containers = Vec::with_capacity(registry.entries.len());

        for entry in registry.entries {
            let state = match self.runtime.container_state(&entry.container_name).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "Failed to query container {}: {:#}",
                        entry.container_name, e
                    );
                    ContainerState::default()
                }
            };

            let actual_image = if state.exists {
                match self.runtime.inspect_image(&entry.container_name).await {
                    Ok(Some(image)) => image,
                    Ok(None) => entry.image.clone(),
                    Err(e) => {
                        debug!(
                            "Falling back to recorded image for {}: {:#}",
                            entry.container_name, e
                        );
                        entry.image.clone()
                    }
                }
            } else {
                entry.image.clone()
            };

            let agent_id = resolve_agent_id(&entry.session_key);
            let configured_image =
                resolve_sandbox_config_for_agent(cfg, agent_id.as_deref()).docker.image;

            containers.push(SandboxContainerInfo {
                image_match: actual_image == configured_image,
                running: state.running,
                actual_image,
                configured_image,
                entry,
            });
        }

        containers
    }

    /// Force-remove a container and always drop its registry entry, even if
    /// the runtime call fails (e.g. the container is already gone).
    pub async fn remove_sandbox_container(&self, name: &str) -> Result<()> {
        let _lock = self.lock_container(name).await;
        self.remove_locked(name).await
    }

    /// Remove a container only if `should_remove` holds for its current
    /// registry entry, checked under the container lock. Returns whether it
    /// was removed.
    pub async fn remove_sandbox_container_if<F>(&self, name: &str, should_remove: F) -> Result<bool>
    where
        F: FnOnce(Option<&SandboxRegistryEntry>) -> bool,
    {
        let _lock = self.lock_container(name).await;

        let current = self.registry.get(name).await;
        if !should_remove(current.as_ref()) {
            return Ok(false);
        }

        self.remove_locked(name).await?;
        Ok(true)
    }

    async fn remove_locked(&self, name: &str) -> Result<()> {
        if let Err(e) = self.runtime.remove_container(name).await {
            warn!("Failed to remove sandbox container {}: {:#}", name, e);
        }

        self.registry
            .remove(name)
            .await
            .with_context(|| format!("Failed to drop {} from the sandbox registry", name))?;

        info!("Removed sandbox container: {}", name);
        Ok(())
    }

    /// Remove every registered container matching `filter`; they are created
    /// again on next use. Returns the removed names.
    pub async fn recreate_sandbox_containers(&self, filter: &RecreateFilter) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .registry
            .read()
            .await
            .entries
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .map(|entry| entry.container_name)
            .collect();

        for name in &names {
            self.remove_sandbox_container(name).await?;
        }

        Ok(names)
    }

    /// Execute a command in a container, starting it first if it was stopped
    pub async fn execute_in_container(&self, name: &str, command: &[&str]) -> Result<ExecResult> {
        self.ensure_docker_container_is_running(name).await?;
        self.runtime.exec(name, command).await
    }
}
