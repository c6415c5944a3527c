use crate::sandbox::security::SandboxScope;
use sha2::{Digest, Sha256};

/// Agent id used when a session key carries none
pub const DEFAULT_AGENT_ID: &str = "main";

/// Session key of the main session
pub const MAIN_SESSION_KEY: &str = "main";

/// Suffix used by the single shared-scope container
pub const SHARED_SCOPE_KEY: &str = "shared";

/// Docker rejects container names longer than this
const MAX_CONTAINER_NAME_LEN: usize = 63;

const MAX_SLUG_LEN: usize = 32;

/// A session key of the form `agent:<id>[:<rest>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSessionKey {
    pub agent_id: String,
    pub rest: Option<String>,
}

/// Parse an agent-scoped session key. Returns `None` when the key does not
/// follow the `agent:<id>` convention.
pub fn parse_agent_session_key(session_key: &str) -> Option<ParsedSessionKey> {
    let mut parts = session_key.trim().splitn(3, ':');
    if !parts.next()?.eq_ignore_ascii_case("agent") {
        return None;
    }

    let agent_id = parts.next()?.trim().to_lowercase();
    if agent_id.is_empty() {
        return None;
    }

    let rest = parts
        .next()
        .map(|rest| rest.trim().to_string())
        .filter(|rest| !rest.is_empty());

    Some(ParsedSessionKey { agent_id, rest })
}

/// Agent id implied by a session key, if any
pub fn resolve_agent_id(session_key: &str) -> Option<String> {
    parse_agent_session_key(session_key).map(|parsed| parsed.agent_id)
}

/// Whether the key names a main session (`main` or `agent:<id>:main`)
pub fn is_main_session_key(session_key: &str) -> bool {
    let key = session_key.trim();
    if key.eq_ignore_ascii_case(MAIN_SESSION_KEY) {
        return true;
    }
    matches!(
        parse_agent_session_key(key),
        Some(ParsedSessionKey { rest: Some(rest), .. }) if rest.eq_ignore_ascii_case(MAIN_SESSION_KEY)
    )
}

/// Registry key identifying which container a session maps to under `scope`.
/// An explicit `agent_id` wins over the agent implied by the session key, so
/// non-agent keys (`telegram:42`) still land in their agent's container.
pub fn resolve_sandbox_scope_key(
    scope: SandboxScope,
    session_key: &str,
    agent_id: Option<&str>,
) -> String {
    let trimmed = session_key.trim();
    let agent_id = agent_id
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty());

    match scope {
        SandboxScope::Shared => SHARED_SCOPE_KEY.to_string(),
        SandboxScope::Session => {
            let key = if trimmed.is_empty() {
                MAIN_SESSION_KEY
            } else {
                trimmed
            };
            match agent_id {
                Some(id) if parse_agent_session_key(key).is_none() => {
                    format!("agent:{}:{}", id, key)
                }
                _ => key.to_string(),
            }
        }
        SandboxScope::Agent => {
            let agent_id = agent_id
                .or_else(|| resolve_agent_id(trimmed))
                .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());
            format!("agent:{}", agent_id)
        }
    }
}

/// Filesystem- and container-safe slug with a short hash suffix so that
/// distinct keys never collide after sanitizing.
pub fn slugify_session_key(session_key: &str) -> String {
    let trimmed = session_key.trim();
    let key = if trimmed.is_empty() { MAIN_SESSION_KEY } else { trimmed };

    let mut safe = String::with_capacity(key.len());
    let mut last_dash = false;
    for c in key.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            safe.push(c);
            last_dash = c == '-';
        } else if !last_dash {
            safe.push('-');
            last_dash = true;
        }
    }

    let mut safe: String = safe.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    if safe.is_empty() {
        safe.push_str("session");
    }

    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}-{}", safe, &digest[..8])
}

/// Container name for a scope key: `<prefix><slug>`, or `<prefix>shared`
pub fn container_name(prefix: &str, scope: SandboxScope, scope_key: &str) -> String {
    let suffix = match scope {
        SandboxScope::Shared => SHARED_SCOPE_KEY.to_string(),
        _ => slugify_session_key(scope_key),
    };
    format!("{}{}", prefix, suffix)
        .chars()
        .take(MAX_CONTAINER_NAME_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_session_key() {
        assert_eq!(
            parse_agent_session_key("agent:Coder"),
            Some(ParsedSessionKey {
                agent_id: "coder".to_string(),
                rest: None
            })
        );
        assert_eq!(
            parse_agent_session_key("agent:coder:telegram:dm:42"),
            Some(ParsedSessionKey {
                agent_id: "coder".to_string(),
                rest: Some("telegram:dm:42".to_string())
            })
        );
        assert_eq!(parse_agent_session_key("agent:"), None);
        assert_eq!(parse_agent_session_key("agent::x"), None);
        assert_eq!(parse_agent_session_key("main"), None);
        assert_eq!(parse_agent_session_key("shared"), None);
        assert_eq!(parse_agent_session_key("telegram:agent:x"), None);
    }

    #[test]
    fn test_is_main_session_key() {
        assert!(is_main_session_key("main"));
        assert!(is_main_session_key("agent:coder:main"));
        assert!(!is_main_session_key("agent:coder"));
        assert!(!is_main_session_key("agent:coder:discord:1"));
        assert!(!is_main_session_key("group:main"));
    }

    #[test]
    fn test_scope_keys() {
        let key = "agent:coder:telegram:42";
        assert_eq!(resolve_sandbox_scope_key(SandboxScope::Session, key, None), key);
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Agent, key, None),
            "agent:coder"
        );
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Agent, "whatsapp:123", None),
            "agent:main"
        );
        assert_eq!(resolve_sandbox_scope_key(SandboxScope::Shared, key, None), "shared");
        assert_eq!(resolve_sandbox_scope_key(SandboxScope::Session, "  ", None), "main");
    }

    #[test]
    fn test_explicit_agent_owns_non_agent_keys() {
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Agent, "telegram:42", Some("Coder")),
            "agent:coder"
        );
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Session, "telegram:42", Some("coder")),
            "agent:coder:telegram:42"
        );
        // an agent-shaped key is already attributed
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Session, "agent:main:x", Some("coder")),
            "agent:main:x"
        );
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Agent, "telegram:42", Some("  ")),
            "agent:main"
        );
        assert_eq!(
            resolve_sandbox_scope_key(SandboxScope::Shared, "telegram:42", Some("coder")),
            "shared"
        );
    }

    #[test]
    fn test_slug_is_safe_and_distinct() {
        let a = slugify_session_key("agent:coder:telegram:42");
        let b = slugify_session_key("agent:coder/telegram/42");
        assert_ne!(a, b);
        assert!(a.starts_with("agent-coder-telegram-42-"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
        assert_eq!(slugify_session_key("!!!").split('-').next(), Some("session"));
    }

    #[test]
    fn test_container_name() {
        assert_eq!(
            container_name("rustyclaw-sbx-", SandboxScope::Shared, "shared"),
            "rustyclaw-sbx-shared"
        );
        let long_key = format!("agent:{}", "x".repeat(200));
        let name = container_name("rustyclaw-sbx-", SandboxScope::Agent, &long_key);
        assert!(name.len() <= 63);
        assert!(name.starts_with("rustyclaw-sbx-agent-xxx"));
        assert_eq!(
            container_name("p-", SandboxScope::Agent, "agent:coder"),
            container_name("p-", SandboxScope::Agent, "agent:coder")
        );
    }
}
