use crate::sandbox::{MemoryLimit, SandboxMode, SandboxScope, UlimitValue, WorkspaceAccess};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory holding persisted state (registry, sandbox workspaces)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    /// Global sandbox layer
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Per-agent overrides keyed by agent id
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// One layer of sandbox settings. Every field is optional so that a layer
/// only contributes what it actually sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SandboxMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SandboxScope>,
    /// Legacy switch: `true` maps to session scope, `false` to shared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_access: Option<WorkspaceAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<SandboxDockerSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune: Option<SandboxPruneSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxDockerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_root: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_drop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<MemoryLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ulimits: Option<BTreeMap<String, UlimitValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_hosts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxPruneSettings {
    /// Remove containers idle for this many hours (0 disables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_hours: Option<u64>,
    /// Remove containers older than this many days (0 disables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u64>,
    /// Interval for the optional periodic prune task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_interval_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub sandbox: SandboxToolsSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxToolsSection {
    #[serde(default)]
    pub tools: ToolPolicyConfig,
}

/// Raw allow/deny lists as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolPolicyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The agent's own workspace directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSettings>,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Resolved state directory: config value, else `~/.rustyclaw`
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_state_dir(),
        }
    }

    /// Look up an agent record, ignoring case in the id
    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id).or_else(|| {
            self.agents
                .iter()
                .find(|(id, _)| id.eq_ignore_ascii_case(agent_id))
                .map(|(_, agent)| agent)
        })
    }
}

// Default functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".rustyclaw"))
        .unwrap_or_else(|| PathBuf::from(".rustyclaw"))
}
