use crate::sandbox::identity::is_main_session_key;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sandbox execution modes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    /// No sandboxing, direct host execution
    #[default]
    Off,
    /// Only non-main sessions sandboxed
    NonMain,
    /// All sessions sandboxed
    All,
}

/// Identity granularity for container reuse
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxScope {
    /// One container per session key
    Session,
    /// One container per agent, shared by its sessions
    #[default]
    Agent,
    /// Single shared container for all agents
    Shared,
}

/// Workspace access modes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum WorkspaceAccess {
    /// Isolated workspace per container
    #[default]
    #[serde(rename = "none")]
    None,
    /// Read-only agent workspace mount
    #[serde(rename = "ro")]
    ReadOnly,
    /// Read-write agent workspace mount
    #[serde(rename = "rw")]
    ReadWrite,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxMode::Off => f.write_str("off"),
            SandboxMode::NonMain => f.write_str("non-main"),
            SandboxMode::All => f.write_str("all"),
        }
    }
}

impl fmt::Display for SandboxScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxScope::Session => f.write_str("session"),
            SandboxScope::Agent => f.write_str("agent"),
            SandboxScope::Shared => f.write_str("shared"),
        }
    }
}

impl fmt::Display for WorkspaceAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceAccess::None => f.write_str("none"),
            WorkspaceAccess::ReadOnly => f.write_str("ro"),
            WorkspaceAccess::ReadWrite => f.write_str("rw"),
        }
    }
}

/// Security policy for sandbox execution
pub struct SecurityPolicy {
    pub mode: SandboxMode,
}

impl SecurityPolicy {
    /// Check if a session should be sandboxed
    pub fn should_sandbox(&self, is_main_session: bool) -> bool {
        match self.mode {
            SandboxMode::Off => false,
            SandboxMode::NonMain => !is_main_session,
            SandboxMode::All => true,
        }
    }

    /// Same as [`should_sandbox`](Self::should_sandbox), deciding "main" from the key
    pub fn should_sandbox_session_key(&self, session_key: &str) -> bool {
        self.should_sandbox(is_main_session_key(session_key))
    }

    /// Get a human-readable description of the mode
    pub fn describe(&self) -> &'static str {
        match self.mode {
            SandboxMode::Off => "Sandboxing disabled - all code runs on host",
            SandboxMode::NonMain => {
                "Non-main sessions run in sandbox, main session runs on host"
            }
            SandboxMode::All => "All sessions run in sandbox",
        }
    }
}
