use super::Config;
use crate::sandbox::{resolve_sandbox_scope, SandboxScope};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Environment variable overriding `state_dir`
pub const STATE_DIR_ENV: &str = "RUSTYCLAW_STATE_DIR";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.config_path = Some(path.to_path_buf());

    Ok(config)
}

/// Parse, substitute and validate a YAML config document
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;

    // Perform environment variable substitution
    let config = substitute_env_vars(config)?;

    // Validate configuration
    validate_config(&config)?;

    Ok(config)
}

pub fn save_config(config: &Config) -> Result<()> {
    let path = config
        .config_path
        .as_ref()
        .context("Config has no file path to save to")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(config).context("Failed to serialize config")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

fn substitute_env_vars(mut config: Config) -> Result<Config> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            config.state_dir = Some(dir);
        }
    }

    if let Some(dir) = &config.state_dir {
        if dir.starts_with("${") && dir.ends_with('}') {
            let var_name = &dir[2..dir.len() - 1];
            config.state_dir = std::env::var(var_name).ok();
        }
    }

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if matches!(&config.state_dir, Some(dir) if dir.trim().is_empty()) {
        anyhow::bail!("state_dir must not be empty");
    }

    validate_sandbox_layer("sandbox", &config.sandbox)?;

    for (agent_id, agent) in &config.agents {
        if agent_id.trim().is_empty() {
            anyhow::bail!("Agent ids must not be empty");
        }
        if let Some(sandbox) = &agent.sandbox {
            validate_sandbox_layer(&format!("agents.{}.sandbox", agent_id), sandbox)?;
            warn_duplicate_binds(config, agent_id, sandbox);
        }
    }

    Ok(())
}

fn validate_sandbox_layer(path: &str, layer: &super::SandboxSettings) -> Result<()> {
    if matches!(&layer.workspace_root, Some(root) if root.trim().is_empty()) {
        anyhow::bail!("{}.workspace_root must not be empty", path);
    }

    let Some(docker) = &layer.docker else {
        return Ok(());
    };

    if let Some(cpus) = docker.cpus {
        if cpus.is_nan() || cpus <= 0.0 {
            anyhow::bail!("{}.docker.cpus must be positive, got {}", path, cpus);
        }
    }

    for (field, value) in [("memory", &docker.memory), ("memory_swap", &docker.memory_swap)] {
        if let Some(limit) = value {
            limit
                .to_bytes()
                .with_context(|| format!("Invalid {}.docker.{}", path, field))?;
        }
    }

    if let Some(ulimits) = &docker.ulimits {
        for (name, value) in ulimits {
            value
                .to_soft_hard(name)
                .with_context(|| format!("Invalid {}.docker.ulimits", path))?;
        }
    }

    Ok(())
}

/// Binds from both layers are concatenated as-is; overlapping targets are
/// only reported.
fn warn_duplicate_binds(config: &Config, agent_id: &str, agent: &super::SandboxSettings) {
    let scope = resolve_sandbox_scope(
        agent.scope.or(config.sandbox.scope),
        agent.per_session.or(config.sandbox.per_session),
    );
    if scope == SandboxScope::Shared {
        return;
    }

    let global_binds = config
        .sandbox
        .docker
        .as_ref()
        .and_then(|d| d.binds.clone())
        .unwrap_or_default();
    let agent_binds = agent
        .docker
        .as_ref()
        .and_then(|d| d.binds.clone())
        .unwrap_or_default();

    let mut targets = HashSet::new();
    for bind in global_binds.iter().chain(agent_binds.iter()) {
        let target = bind.split(':').nth(1).unwrap_or(bind);
        if !targets.insert(target.to_string()) {
            warn!(
                "Agent '{}' mounts '{}' more than once; the container runtime decides which bind wins",
                agent_id, target
            );
        }
    }
}
