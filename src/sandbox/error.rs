use thiserror::Error;

/// Sandbox failures callers are expected to match on
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No working container could be provisioned for the run
    #[error("sandbox unavailable for container '{container}': {reason}")]
    Unavailable { container: String, reason: String },

    #[error("invalid memory limit '{0}' (expected bytes or a value like 512m, 1g, -1)")]
    InvalidMemory(String),

    #[error("invalid ulimit '{name}': {value}")]
    InvalidUlimit { name: String, value: String },
}

impl SandboxError {
    pub fn unavailable(container: &str, err: &anyhow::Error) -> Self {
        SandboxError::Unavailable {
            container: container.to_string(),
            reason: format!("{:#}", err),
        }
    }
}
