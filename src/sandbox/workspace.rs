use crate::sandbox::identity::slugify_session_key;
use crate::sandbox::resolve::SandboxConfig;
use crate::sandbox::security::{SandboxScope, WorkspaceAccess};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Where the agent workspace appears inside the container for `ro` access
pub const AGENT_MOUNT_PATH: &str = "/agent";

/// Host and container paths backing one sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxWorkspace {
    /// Per-identity sandbox directory under the workspace root
    pub sandbox_dir: PathBuf,
    /// The agent's own workspace
    pub agent_dir: PathBuf,
    pub access: WorkspaceAccess,
    pub container_workdir: String,
}

/// Sandbox directory for a scope key; the root itself for shared scope
pub fn resolve_sandbox_workspace_dir(root: &Path, scope: SandboxScope, scope_key: &str) -> PathBuf {
    match scope {
        SandboxScope::Shared => root.to_path_buf(),
        _ => root.join(slugify_session_key(scope_key)),
    }
}

impl SandboxWorkspace {
    pub fn resolve(cfg: &SandboxConfig, scope_key: &str) -> Self {
        Self {
            sandbox_dir: resolve_sandbox_workspace_dir(&cfg.workspace_root, cfg.scope, scope_key),
            agent_dir: cfg.agent_workspace.clone(),
            access: cfg.workspace_access,
            container_workdir: cfg.docker.workdir.clone(),
        }
    }

    /// Host directory mounted at the container workdir
    pub fn mounted_dir(&self) -> &Path {
        match self.access {
            WorkspaceAccess::ReadWrite => &self.agent_dir,
            WorkspaceAccess::None | WorkspaceAccess::ReadOnly => &self.sandbox_dir,
        }
    }

    /// Create the host directories the mounts refer to
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.mounted_dir())
            .await
            .with_context(|| {
                format!(
                    "Failed to create sandbox workspace directory: {}",
                    self.mounted_dir().display()
                )
            })?;

        if self.access == WorkspaceAccess::ReadOnly {
            tokio::fs::create_dir_all(&self.agent_dir)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create agent workspace directory: {}",
                        self.agent_dir.display()
                    )
                })?;
        }

        Ok(())
    }

    /// Bind mount specs for the container
    pub fn binds(&self) -> Vec<String> {
        let mut binds = vec![format!(
            "{}:{}:rw",
            self.mounted_dir().display(),
            self.container_workdir
        )];

        if self.access == WorkspaceAccess::ReadOnly {
            binds.push(format!("{}:{}:ro", self.agent_dir.display(), AGENT_MOUNT_PATH));
        }

        binds
    }
}
