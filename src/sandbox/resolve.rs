use crate::config::{Config, SandboxDockerSettings, SandboxPruneSettings, SandboxSettings};
use crate::sandbox::limits::{MemoryLimit, UlimitValue};
use crate::sandbox::security::{SandboxMode, SandboxScope, WorkspaceAccess};
use crate::tools::policy::{resolve_sandbox_tool_policy_for_agent, SandboxToolPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_SANDBOX_IMAGE: &str = "debian:bookworm-slim";
pub const DEFAULT_CONTAINER_PREFIX: &str = "rustyclaw-sbx-";
pub const DEFAULT_WORKDIR: &str = "/workspace";
pub const DEFAULT_NETWORK: &str = "none";
pub const DEFAULT_IDLE_HOURS: u64 = 24;
pub const DEFAULT_MAX_AGE_DAYS: u64 = 7;
pub const DEFAULT_CHECK_INTERVAL_MINUTES: u64 = 60;

fn default_tmpfs() -> Vec<String> {
    ["/tmp", "/var/tmp", "/run"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cap_drop() -> Vec<String> {
    vec!["ALL".to_string()]
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())])
}

/// Fully resolved container parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxDockerConfig {
    pub image: String,
    pub container_prefix: String,
    pub workdir: String,
    pub read_only_root: bool,
    pub tmpfs: Vec<String>,
    pub network: String,
    pub user: Option<String>,
    pub cap_drop: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub setup_command: Option<String>,
    pub pids_limit: Option<i64>,
    pub memory: Option<MemoryLimit>,
    pub memory_swap: Option<MemoryLimit>,
    pub cpus: Option<f64>,
    pub ulimits: BTreeMap<String, UlimitValue>,
    pub seccomp_profile: Option<String>,
    pub apparmor_profile: Option<String>,
    pub dns: Option<Vec<String>>,
    pub extra_hosts: Option<Vec<String>>,
    pub binds: Vec<String>,
}

impl Default for SandboxDockerConfig {
    fn default() -> Self {
        resolve_sandbox_docker_config(SandboxScope::default(), None, None)
    }
}

/// Prune thresholds; `0` disables a dimension
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxPruneConfig {
    pub idle_hours: u64,
    pub max_age_days: u64,
    pub check_interval_minutes: u64,
}

impl Default for SandboxPruneConfig {
    fn default() -> Self {
        resolve_sandbox_prune_config(SandboxScope::default(), None, None)
    }
}

/// Effective sandbox configuration for one agent run
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    pub workspace_access: WorkspaceAccess,
    pub workspace_root: PathBuf,
    /// The agent's own workspace, mounted for `ro`/`rw` access
    pub agent_workspace: PathBuf,
    pub docker: SandboxDockerConfig,
    pub tools: SandboxToolPolicy,
    pub prune: SandboxPruneConfig,
}

/// Explicit scope wins, then the legacy `per_session` flag, then `agent`.
pub fn resolve_sandbox_scope(
    explicit_scope: Option<SandboxScope>,
    per_session: Option<bool>,
) -> SandboxScope {
    match (explicit_scope, per_session) {
        (Some(scope), _) => scope,
        (None, Some(true)) => SandboxScope::Session,
        (None, Some(false)) => SandboxScope::Shared,
        (None, None) => SandboxScope::Agent,
    }
}

/// Merge docker settings. Agent settings are ignored for shared scope.
pub fn resolve_sandbox_docker_config(
    scope: SandboxScope,
    global: Option<&SandboxDockerSettings>,
    agent: Option<&SandboxDockerSettings>,
) -> SandboxDockerConfig {
    let agent = if scope == SandboxScope::Shared {
        None
    } else {
        agent
    };

    // agent -> global, per field
    macro_rules! pick {
        ($field:ident) => {
            agent
                .and_then(|a| a.$field.clone())
                .or_else(|| global.and_then(|g| g.$field.clone()))
        };
    }

    let global_env = global.and_then(|g| g.env.clone());
    let env = match agent.and_then(|a| a.env.as_ref()) {
        Some(agent_env) => {
            let mut env = global_env.unwrap_or_else(default_env);
            env.extend(agent_env.iter().map(|(k, v)| (k.clone(), v.clone())));
            env
        }
        None => global_env.unwrap_or_else(default_env),
    };

    let global_ulimits = global.and_then(|g| g.ulimits.clone()).unwrap_or_default();
    let ulimits = match agent.and_then(|a| a.ulimits.as_ref()) {
        Some(agent_ulimits) => {
            let mut ulimits = global_ulimits;
            ulimits.extend(agent_ulimits.iter().map(|(k, v)| (k.clone(), v.clone())));
            ulimits
        }
        None => global_ulimits,
    };

    let binds = global
        .and_then(|g| g.binds.clone())
        .unwrap_or_default()
        .into_iter()
        .chain(agent.and_then(|a| a.binds.clone()).unwrap_or_default())
        .collect();

    SandboxDockerConfig {
        image: pick!(image).unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string()),
        container_prefix: pick!(container_prefix)
            .unwrap_or_else(|| DEFAULT_CONTAINER_PREFIX.to_string()),
        workdir: pick!(workdir).unwrap_or_else(|| DEFAULT_WORKDIR.to_string()),
        read_only_root: pick!(read_only_root).unwrap_or(true),
        tmpfs: pick!(tmpfs).unwrap_or_else(default_tmpfs),
        network: pick!(network).unwrap_or_else(|| DEFAULT_NETWORK.to_string()),
        user: pick!(user),
        cap_drop: pick!(cap_drop).unwrap_or_else(default_cap_drop),
        env,
        setup_command: pick!(setup_command),
        pids_limit: pick!(pids_limit),
        memory: pick!(memory),
        memory_swap: pick!(memory_swap),
        cpus: pick!(cpus),
        ulimits,
        seccomp_profile: pick!(seccomp_profile),
        apparmor_profile: pick!(apparmor_profile),
        dns: pick!(dns),
        extra_hosts: pick!(extra_hosts),
        binds,
    }
}

/// Each threshold resolves independently: agent -> global -> default.
pub fn resolve_sandbox_prune_config(
    scope: SandboxScope,
    global: Option<&SandboxPruneSettings>,
    agent: Option<&SandboxPruneSettings>,
) -> SandboxPruneConfig {
    let agent = if scope == SandboxScope::Shared {
        None
    } else {
        agent
    };

    SandboxPruneConfig {
        idle_hours: agent
            .and_then(|a| a.idle_hours)
            .or_else(|| global.and_then(|g| g.idle_hours))
            .unwrap_or(DEFAULT_IDLE_HOURS),
        max_age_days: agent
            .and_then(|a| a.max_age_days)
            .or_else(|| global.and_then(|g| g.max_age_days))
            .unwrap_or(DEFAULT_MAX_AGE_DAYS),
        check_interval_minutes: agent
            .and_then(|a| a.check_interval_minutes)
            .or_else(|| global.and_then(|g| g.check_interval_minutes))
            .unwrap_or(DEFAULT_CHECK_INTERVAL_MINUTES),
    }
}

/// Effective sandbox configuration for `agent_id` (global layer only when
/// `None` or unknown).
pub fn resolve_sandbox_config_for_agent(cfg: &Config, agent_id: Option<&str>) -> SandboxConfig {
    let global: &SandboxSettings = &cfg.sandbox;
    let agent_record = agent_id.and_then(|id| cfg.agent(id));
    let agent: Option<&SandboxSettings> = agent_record.and_then(|a| a.sandbox.as_ref());

    // Scope first: it decides whether agent docker/prune settings count.
    let scope = resolve_sandbox_scope(
        agent.and_then(|a| a.scope).or(global.scope),
        agent.and_then(|a| a.per_session).or(global.per_session),
    );

    // A shared container has one definition, so nothing that shapes its
    // mounts may come from the agent.
    let shaping = if scope == SandboxScope::Shared { None } else { agent };
    let agent_workspace_dir = if scope == SandboxScope::Shared {
        None
    } else {
        agent_record.and_then(|a| a.workspace.clone())
    };

    let state_dir = cfg.state_dir();
    let workspace_root = shaping
        .and_then(|a| a.workspace_root.clone())
        .or_else(|| global.workspace_root.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("sandboxes"));
    let agent_workspace = agent_workspace_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("workspace"));

    SandboxConfig {
        mode: agent.and_then(|a| a.mode).or(global.mode).unwrap_or_default(),
        scope,
        workspace_access: shaping
            .and_then(|a| a.workspace_access)
            .or(global.workspace_access)
            .unwrap_or_default(),
        workspace_root,
        agent_workspace,
        docker: resolve_sandbox_docker_config(
            scope,
            global.docker.as_ref(),
            agent.and_then(|a| a.docker.as_ref()),
        ),
        tools: resolve_sandbox_tool_policy_for_agent(cfg, agent_id).into(),
        prune: resolve_sandbox_prune_config(
            scope,
            global.prune.as_ref(),
            agent.and_then(|a| a.prune.as_ref()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn docker(image: &str, binds: &[&str]) -> SandboxDockerSettings {
        SandboxDockerSettings {
            image: Some(image.to_string()),
            binds: Some(binds.iter().map(|b| b.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn test_scope_resolution() {
        assert_eq!(
            resolve_sandbox_scope(Some(SandboxScope::Shared), Some(true)),
            SandboxScope::Shared
        );
        assert_eq!(resolve_sandbox_scope(None, Some(true)), SandboxScope::Session);
        assert_eq!(resolve_sandbox_scope(None, Some(false)), SandboxScope::Shared);
        assert_eq!(resolve_sandbox_scope(None, None), SandboxScope::Agent);
    }

    #[test]
    fn test_docker_defaults() {
        let resolved = resolve_sandbox_docker_config(SandboxScope::Agent, None, None);
        assert_eq!(resolved.image, DEFAULT_SANDBOX_IMAGE);
        assert_eq!(resolved.container_prefix, DEFAULT_CONTAINER_PREFIX);
        assert_eq!(resolved.workdir, "/workspace");
        assert!(resolved.read_only_root);
        assert_eq!(resolved.network, "none");
        assert_eq!(resolved.cap_drop, vec!["ALL"]);
        assert_eq!(resolved.tmpfs, vec!["/tmp", "/var/tmp", "/run"]);
        assert_eq!(resolved.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert!(resolved.binds.is_empty());
        assert!(resolved.ulimits.is_empty());
    }

    #[test]
    fn test_agent_scope_merges_and_concatenates_binds() {
        let global = docker("img:stable", &["/a:/a"]);
        let agent = docker("img:custom", &["/b:/b"]);

        let resolved =
            resolve_sandbox_docker_config(SandboxScope::Agent, Some(&global), Some(&agent));
        assert_eq!(resolved.image, "img:custom");
        assert_eq!(resolved.binds, vec!["/a:/a", "/b:/b"]);

        let shared =
            resolve_sandbox_docker_config(SandboxScope::Shared, Some(&global), Some(&agent));
        assert_eq!(shared.image, "img:stable");
        assert_eq!(shared.binds, vec!["/a:/a"]);
    }

    #[test]
    fn test_shared_scope_ignores_agent_only_fields() {
        let agent = SandboxDockerSettings {
            user: Some("1000:1000".to_string()),
            network: Some("bridge".to_string()),
            read_only_root: Some(false),
            pids_limit: Some(64),
            env: Some(BTreeMap::from([("FOO".to_string(), "bar".to_string())])),
            ulimits: Some(BTreeMap::from([("nproc".to_string(), UlimitValue::Limit(10))])),
            binds: Some(vec!["/x:/x".to_string()]),
            seccomp_profile: Some("strict.json".to_string()),
            ..Default::default()
        };

        let resolved = resolve_sandbox_docker_config(SandboxScope::Shared, None, Some(&agent));
        assert_eq!(resolved, SandboxDockerConfig::default());
    }

    #[test]
    fn test_precedence_agent_over_global_over_default() {
        let global = SandboxDockerSettings {
            network: Some("bridge".to_string()),
            user: Some("1000".to_string()),
            cpus: Some(1.0),
            ..Default::default()
        };
        let agent = SandboxDockerSettings {
            user: Some("2000".to_string()),
            ..Default::default()
        };

        let resolved =
            resolve_sandbox_docker_config(SandboxScope::Session, Some(&global), Some(&agent));
        assert_eq!(resolved.user.as_deref(), Some("2000"));
        assert_eq!(resolved.network, "bridge");
        assert_eq!(resolved.cpus, Some(1.0));
        assert_eq!(resolved.workdir, DEFAULT_WORKDIR);
    }

    #[test]
    fn test_env_and_ulimits_shallow_merge() {
        let global = SandboxDockerSettings {
            env: Some(BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "1".to_string()),
            ])),
            ulimits: Some(BTreeMap::from([
                ("nofile".to_string(), UlimitValue::Limit(100)),
                ("nproc".to_string(), UlimitValue::Limit(50)),
            ])),
            ..Default::default()
        };
        let agent = SandboxDockerSettings {
            env: Some(BTreeMap::from([("B".to_string(), "2".to_string())])),
            ulimits: Some(BTreeMap::from([(
                "nofile".to_string(),
                UlimitValue::Limit(200),
            )])),
            ..Default::default()
        };

        let resolved =
            resolve_sandbox_docker_config(SandboxScope::Agent, Some(&global), Some(&agent));
        assert_eq!(resolved.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(resolved.env.get("B").map(String::as_str), Some("2"));
        assert!(!resolved.env.contains_key("LANG"));
        assert_eq!(resolved.ulimits.get("nofile"), Some(&UlimitValue::Limit(200)));
        assert_eq!(resolved.ulimits.get("nproc"), Some(&UlimitValue::Limit(50)));
    }

    #[test]
    fn test_agent_env_over_baseline() {
        let agent = SandboxDockerSettings {
            env: Some(BTreeMap::from([("FOO".to_string(), "bar".to_string())])),
            ..Default::default()
        };
        let resolved = resolve_sandbox_docker_config(SandboxScope::Agent, None, Some(&agent));
        assert_eq!(resolved.env.len(), 2);
        assert_eq!(resolved.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn test_prune_resolves_each_threshold() {
        let global = SandboxPruneSettings {
            idle_hours: Some(12),
            max_age_days: Some(3),
            ..Default::default()
        };
        let agent = SandboxPruneSettings {
            idle_hours: Some(0),
            ..Default::default()
        };

        let resolved =
            resolve_sandbox_prune_config(SandboxScope::Agent, Some(&global), Some(&agent));
        assert_eq!(resolved.idle_hours, 0);
        assert_eq!(resolved.max_age_days, 3);

        let shared =
            resolve_sandbox_prune_config(SandboxScope::Shared, Some(&global), Some(&agent));
        assert_eq!(shared.idle_hours, 12);

        let defaults = resolve_sandbox_prune_config(SandboxScope::Agent, None, None);
        assert_eq!(defaults.idle_hours, DEFAULT_IDLE_HOURS);
        assert_eq!(defaults.max_age_days, DEFAULT_MAX_AGE_DAYS);
    }

    #[test]
    fn test_config_for_agent() {
        let mut cfg = Config {
            state_dir: Some("/srv/rc".to_string()),
            ..Default::default()
        };
        cfg.sandbox.mode = Some(SandboxMode::NonMain);
        cfg.sandbox.docker = Some(docker("img:stable", &[]));
        cfg.agents.insert(
            "coder".to_string(),
            AgentConfig {
                workspace: Some("/home/coder".to_string()),
                sandbox: Some(SandboxSettings {
                    mode: Some(SandboxMode::All),
                    per_session: Some(true),
                    workspace_access: Some(WorkspaceAccess::ReadOnly),
                    docker: Some(docker("img:coder", &[])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let coder = resolve_sandbox_config_for_agent(&cfg, Some("coder"));
        assert_eq!(coder.mode, SandboxMode::All);
        assert_eq!(coder.scope, SandboxScope::Session);
        assert_eq!(coder.workspace_access, WorkspaceAccess::ReadOnly);
        assert_eq!(coder.workspace_root, PathBuf::from("/srv/rc/sandboxes"));
        assert_eq!(coder.agent_workspace, PathBuf::from("/home/coder"));
        assert_eq!(coder.docker.image, "img:coder");

        let unknown = resolve_sandbox_config_for_agent(&cfg, Some("nobody"));
        assert_eq!(unknown.mode, SandboxMode::NonMain);
        assert_eq!(unknown.scope, SandboxScope::Agent);
        assert_eq!(unknown.workspace_access, WorkspaceAccess::None);
        assert_eq!(unknown.docker.image, "img:stable");
        assert_eq!(unknown.agent_workspace, PathBuf::from("/srv/rc/workspace"));

        let none = resolve_sandbox_config_for_agent(&cfg, None);
        assert_eq!(none, unknown);
    }

    #[test]
    fn test_shared_scope_workspace_comes_from_global_layer() {
        let mut cfg = Config {
            state_dir: Some("/srv/rc".to_string()),
            ..Default::default()
        };
        cfg.sandbox.scope = Some(SandboxScope::Shared);
        cfg.sandbox.workspace_access = Some(WorkspaceAccess::ReadOnly);
        for (id, dir) in [("a", "/home/a"), ("b", "/home/b")] {
            cfg.agents.insert(
                id.to_string(),
                AgentConfig {
                    workspace: Some(dir.to_string()),
                    sandbox: Some(SandboxSettings {
                        workspace_access: Some(WorkspaceAccess::ReadWrite),
                        workspace_root: Some(format!("{}/sandboxes", dir)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            );
        }

        let a = resolve_sandbox_config_for_agent(&cfg, Some("a"));
        let b = resolve_sandbox_config_for_agent(&cfg, Some("b"));
        for resolved in [&a, &b] {
            assert_eq!(resolved.scope, SandboxScope::Shared);
            assert_eq!(resolved.workspace_access, WorkspaceAccess::ReadOnly);
            assert_eq!(resolved.workspace_root, PathBuf::from("/srv/rc/sandboxes"));
            assert_eq!(resolved.agent_workspace, PathBuf::from("/srv/rc/workspace"));
        }
        assert_eq!(a.docker, b.docker);
    }
}
