use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rustyclaw_sandbox::sandbox::{resolve_agent_id, RecreateFilter, SandboxContainerInfo};
use rustyclaw_sandbox::{Config, SandboxManager};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rustyclaw-sandbox")]
#[command(about = "Inspect and manage RustyClaw sandbox containers", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sandbox containers with their live state
    List,

    /// Remove sandbox containers so they are recreated on next use
    Recreate(RecreateArgs),

    /// Show the effective sandbox config and tool policy
    Explain {
        /// Agent id (defaults to the agent in --session, else the global layer)
        #[arg(long)]
        agent: Option<String>,

        /// Session key to resolve the agent from
        #[arg(long)]
        session: Option<String>,
    },

    /// Remove idle and expired containers now
    Prune,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct RecreateArgs {
    /// Every registered container
    #[arg(long)]
    all: bool,

    /// Containers owned by this session key
    #[arg(long)]
    session: Option<String>,

    /// Containers owned by this agent
    #[arg(long)]
    agent: Option<String>,
}

impl RecreateArgs {
    fn filter(self) -> RecreateFilter {
        match (self.all, self.session, self.agent) {
            (_, Some(session), _) => RecreateFilter::Session(session),
            (_, _, Some(agent)) => RecreateFilter::Agent(agent),
            _ => RecreateFilter::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        rustyclaw_sandbox::config::parse_config("{}")?
    };

    init_logging(&config.logging.level, &config.logging.format)?;

    if config.config_path.is_some() {
        tracing::debug!("Config loaded from: {}", config_path.display());
    } else {
        tracing::debug!(
            "No config at {}, using built-in defaults",
            config_path.display()
        );
    }

    let manager = SandboxManager::new(config)?;

    match cli.command {
        Commands::List => {
            let containers = manager.list_containers().await;
            print_containers(&containers);
        }
        Commands::Recreate(args) => {
            let removed = manager.recreate(&args.filter()).await?;
            if removed.is_empty() {
                println!("No matching sandbox containers.");
            } else {
                for name in &removed {
                    println!("Removed {}", name);
                }
                println!(
                    "{} container(s) will be recreated on next use.",
                    removed.len()
                );
            }
        }
        Commands::Explain { agent, session } => {
            let agent_id = agent
                .map(|a| a.trim().to_lowercase())
                .or_else(|| session.as_deref().and_then(resolve_agent_id));
            println!("{}", manager.get_config_info(agent_id.as_deref()));
        }
        Commands::Prune => {
            let report = manager.prune_now().await?;
            println!(
                "Scanned {} container(s), removed {}.",
                report.scanned,
                report.removed.len()
            );
            for name in &report.removed {
                println!("  {}", name);
            }
        }
    }

    Ok(())
}

fn print_containers(containers: &[SandboxContainerInfo]) {
    if containers.is_empty() {
        println!("No sandbox containers.");
        return;
    }

    println!(
        "{:<40} {:<8} {:<30} {:<6} {}",
        "CONTAINER", "RUNNING", "IMAGE", "MATCH", "SESSION"
    );
    for info in containers {
        println!(
            "{:<40} {:<8} {:<30} {:<6} {}",
            info.entry.container_name,
            if info.running { "yes" } else { "no" },
            info.actual_image,
            if info.image_match { "yes" } else { "no" },
            info.entry.session_key
        );
    }

    let running = containers.iter().filter(|c| c.running).count();
    let mismatched: Vec<_> = containers.iter().filter(|c| !c.image_match).collect();
    println!();
    println!(
        "{} container(s), {} running, {} with image mismatch",
        containers.len(),
        running,
        mismatched.len()
    );
    for info in mismatched {
        println!(
            "  warning: {} runs {} but {} is configured; run `recreate --session {}`",
            info.entry.container_name,
            info.actual_image,
            info.configured_image,
            info.entry.session_key
        );
    }
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
