use crate::config::Config;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Tools available inside a sandbox when no layer restricts them
pub const DEFAULT_TOOL_ALLOW: &[&str] = &[];

/// Gateway messaging tools never reachable from inside a sandbox by default
pub const DEFAULT_TOOL_DENY: &[&str] = &[
    "send_whatsapp",
    "list_whatsapp_groups",
    "list_whatsapp_accounts",
];

/// Which config layer supplied a list
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicyLayer {
    Agent,
    Global,
    Default,
}

impl fmt::Display for ToolPolicyLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolPolicyLayer::Agent => f.write_str("agent"),
            ToolPolicyLayer::Global => f.write_str("global"),
            ToolPolicyLayer::Default => f.write_str("default"),
        }
    }
}

/// Provenance of one resolved list: the layer and the config path it came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxToolPolicySource {
    pub source: ToolPolicyLayer,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxToolPolicySources {
    pub allow: SandboxToolPolicySource,
    pub deny: SandboxToolPolicySource,
}

/// Allow/deny tool lists attached to a sandboxed run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxToolPolicy {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Resolved policy plus where each list came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxToolPolicyResolved {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub sources: SandboxToolPolicySources,
}

impl From<SandboxToolPolicyResolved> for SandboxToolPolicy {
    fn from(resolved: SandboxToolPolicyResolved) -> Self {
        Self {
            allow: resolved.allow,
            deny: resolved.deny,
        }
    }
}

/// Resolve the sandbox tool policy for an agent. Each list is replaced
/// wholesale by the most specific layer that sets it.
pub fn resolve_sandbox_tool_policy_for_agent(
    cfg: &Config,
    agent_id: Option<&str>,
) -> SandboxToolPolicyResolved {
    let agent_policy = agent_id
        .and_then(|id| cfg.agent(id).map(|agent| (id, &agent.tools.sandbox.tools)));
    let global_policy = &cfg.tools.sandbox.tools;

    let resolve = |field: &str,
                   agent_list: Option<&Vec<String>>,
                   global_list: Option<&Vec<String>>,
                   default_list: &[&str]| {
        if let (Some((id, _)), Some(list)) = (agent_policy, agent_list) {
            return (
                list.clone(),
                SandboxToolPolicySource {
                    source: ToolPolicyLayer::Agent,
                    key: format!("agents.{}.tools.sandbox.tools.{}", id, field),
                },
            );
        }
        if let Some(list) = global_list {
            return (
                list.clone(),
                SandboxToolPolicySource {
                    source: ToolPolicyLayer::Global,
                    key: format!("tools.sandbox.tools.{}", field),
                },
            );
        }
        (
            default_list.iter().map(|t| t.to_string()).collect(),
            SandboxToolPolicySource {
                source: ToolPolicyLayer::Default,
                key: format!("default.{}", field),
            },
        )
    };

    let (allow, allow_source) = resolve(
        "allow",
        agent_policy.and_then(|(_, p)| p.allow.as_ref()),
        global_policy.allow.as_ref(),
        DEFAULT_TOOL_ALLOW,
    );
    let (deny, deny_source) = resolve(
        "deny",
        agent_policy.and_then(|(_, p)| p.deny.as_ref()),
        global_policy.deny.as_ref(),
        DEFAULT_TOOL_DENY,
    );

    SandboxToolPolicyResolved {
        allow,
        deny,
        sources: SandboxToolPolicySources {
            allow: allow_source,
            deny: deny_source,
        },
    }
}

fn normalize_tool_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Match a tool name against a pattern; `*` matches any run of characters
fn pattern_matches(pattern: &str, tool: &str) -> bool {
    let pattern = normalize_tool_name(pattern);
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == tool;
    }

    let expr = format!(
        "^{}$",
        pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    );
    match Regex::new(&expr) {
        Ok(re) => re.is_match(tool),
        Err(e) => {
            debug!("Ignoring unusable tool pattern '{}': {}", pattern, e);
            false
        }
    }
}

impl SandboxToolPolicy {
    /// Deny wins; an empty allow list allows everything not denied
    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        let tool = normalize_tool_name(tool_name);
        if self.deny.iter().any(|p| pattern_matches(p, &tool)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|p| pattern_matches(p, &tool))
    }
}

impl SandboxToolPolicyResolved {
    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        SandboxToolPolicy {
            allow: self.allow.clone(),
            deny: self.deny.clone(),
        }
        .is_tool_allowed(tool_name)
    }

    /// Describe the policy and its provenance in human-readable format
    pub fn describe(&self) -> String {
        let render = |list: &[String]| {
            if list.is_empty() {
                "(none)".to_string()
            } else {
                list.join(", ")
            }
        };

        let mut lines = vec!["Sandbox Tool Policy:".to_string()];
        lines.push(format!(
            "  allow: {}  [{}: {}]",
            if self.allow.is_empty() {
                "* (all tools not denied)".to_string()
            } else {
                render(&self.allow)
            },
            self.sources.allow.source,
            self.sources.allow.key
        ));
        lines.push(format!(
            "  deny:  {}  [{}: {}]",
            render(&self.deny),
            self.sources.deny.source,
            self.sources.deny.key
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ToolPolicyConfig};

    fn list(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    fn config_with(global: ToolPolicyConfig, agent: Option<ToolPolicyConfig>) -> Config {
        let mut cfg = Config::default();
        cfg.tools.sandbox.tools = global;
        if let Some(policy) = agent {
            let mut record = AgentConfig::default();
            record.tools.sandbox.tools = policy;
            cfg.agents.insert("coder".to_string(), record);
        }
        cfg
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let cfg = Config::default();
        let resolved = resolve_sandbox_tool_policy_for_agent(&cfg, Some("coder"));
        assert!(resolved.allow.is_empty());
        assert_eq!(resolved.deny.len(), DEFAULT_TOOL_DENY.len());
        assert_eq!(resolved.sources.allow.source, ToolPolicyLayer::Default);
        assert_eq!(resolved.sources.deny.key, "default.deny");
    }

    #[test]
    fn test_agent_list_replaces_global_list() {
        let cfg = config_with(
            ToolPolicyConfig {
                allow: list(&["exec", "read_file"]),
                deny: list(&["web_fetch"]),
            },
            Some(ToolPolicyConfig {
                allow: list(&["bash"]),
                deny: None,
            }),
        );

        let resolved = resolve_sandbox_tool_policy_for_agent(&cfg, Some("coder"));
        assert_eq!(resolved.allow, vec!["bash"]);
        assert_eq!(resolved.sources.allow.source, ToolPolicyLayer::Agent);
        assert_eq!(
            resolved.sources.allow.key,
            "agents.coder.tools.sandbox.tools.allow"
        );
        assert_eq!(resolved.deny, vec!["web_fetch"]);
        assert_eq!(resolved.sources.deny.source, ToolPolicyLayer::Global);
        assert_eq!(resolved.sources.deny.key, "tools.sandbox.tools.deny");
    }

    #[test]
    fn test_unknown_agent_falls_back_to_global() {
        let cfg = config_with(
            ToolPolicyConfig {
                allow: list(&["exec"]),
                deny: None,
            },
            Some(ToolPolicyConfig {
                allow: list(&["bash"]),
                deny: None,
            }),
        );
        let resolved = resolve_sandbox_tool_policy_for_agent(&cfg, Some("writer"));
        assert_eq!(resolved.allow, vec!["exec"]);
        assert_eq!(resolved.sources.allow.source, ToolPolicyLayer::Global);

        let resolved = resolve_sandbox_tool_policy_for_agent(&cfg, None);
        assert_eq!(resolved.allow, vec!["exec"]);
    }

    #[test]
    fn test_empty_agent_list_is_explicit() {
        let cfg = config_with(
            ToolPolicyConfig {
                allow: None,
                deny: list(&["exec"]),
            },
            Some(ToolPolicyConfig {
                allow: None,
                deny: Some(vec![]),
            }),
        );
        let resolved = resolve_sandbox_tool_policy_for_agent(&cfg, Some("coder"));
        assert!(resolved.deny.is_empty());
        assert_eq!(resolved.sources.deny.source, ToolPolicyLayer::Agent);
    }

    #[test]
    fn test_is_tool_allowed() {
        let policy = SandboxToolPolicy {
            allow: vec!["exec".to_string(), "read_*".to_string()],
            deny: vec!["read_secrets".to_string()],
        };
        assert!(policy.is_tool_allowed("exec"));
        assert!(policy.is_tool_allowed(" EXEC "));
        assert!(policy.is_tool_allowed("read_file"));
        assert!(!policy.is_tool_allowed("read_secrets"));
        assert!(!policy.is_tool_allowed("web_fetch"));
    }

    #[test]
    fn test_empty_allow_means_all_not_denied() {
        let policy = SandboxToolPolicy {
            allow: vec![],
            deny: vec!["send_*".to_string()],
        };
        assert!(policy.is_tool_allowed("bash"));
        assert!(!policy.is_tool_allowed("send_whatsapp"));

        let deny_all = SandboxToolPolicy {
            allow: vec!["exec".to_string()],
            deny: vec!["*".to_string()],
        };
        assert!(!deny_all.is_tool_allowed("exec"));
    }

    #[test]
    fn test_pattern_escapes_regex_chars() {
        assert!(pattern_matches("a.b*", "a.bc"));
        assert!(!pattern_matches("a.b*", "axbc"));
    }

    #[test]
    fn test_describe_mentions_sources() {
        let cfg = Config::default();
        let text = resolve_sandbox_tool_policy_for_agent(&cfg, None).describe();
        assert!(text.contains("default.allow"));
        assert!(text.contains("send_whatsapp"));
    }
}
