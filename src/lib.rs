pub mod config;
pub mod sandbox;
pub mod tools;

pub use config::Config;
pub use sandbox::{SandboxContext, SandboxError, SandboxManager};
pub use tools::policy::{SandboxToolPolicy, SandboxToolPolicyResolved};
