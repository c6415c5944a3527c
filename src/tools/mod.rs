pub mod policy;

pub use policy::{
    resolve_sandbox_tool_policy_for_agent, SandboxToolPolicy, SandboxToolPolicyResolved,
    SandboxToolPolicySource, ToolPolicyLayer,
};
