use crate::config::Config;
use crate::sandbox::container::{now_ms, ContainerManager};
use crate::sandbox::identity::resolve_agent_id;
use crate::sandbox::registry::SandboxRegistryEntry;
use crate::sandbox::resolve::{resolve_sandbox_config_for_agent, SandboxPruneConfig};
use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Minimum spacing between two prune scans
pub const DEFAULT_PRUNE_COOLDOWN: Duration = Duration::from_secs(5 * 60);

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Outcome of one prune scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub scanned: usize,
    pub removed: Vec<String>,
}

/// `units * unit_ms`, or `None` when the product does not fit an i64
fn threshold_ms(units: u64, unit_ms: i64) -> Option<i64> {
    i64::try_from(units).ok()?.checked_mul(unit_ms)
}

/// Whether an entry has outlived its idle or age allowance. A zero
/// threshold disables that dimension; one too large to represent never
/// expires.
pub fn should_prune(entry: &SandboxRegistryEntry, prune: &SandboxPruneConfig, now_ms: i64) -> bool {
    let idle_ms = now_ms.saturating_sub(entry.last_used_at_ms);
    let age_ms = now_ms.saturating_sub(entry.created_at_ms);

    let expired = |units: u64, unit_ms: i64, elapsed: i64| {
        units > 0 && threshold_ms(units, unit_ms).is_some_and(|limit| elapsed > limit)
    };

    expired(prune.idle_hours, HOUR_MS, idle_ms) || expired(prune.max_age_days, DAY_MS, age_ms)
}

/// Reclaims idle and stale sandbox containers
pub struct Pruner {
    manager: Arc<ContainerManager>,
    cooldown: Duration,
    last_prune_at_ms: Mutex<Option<i64>>,
}

impl Pruner {
    pub fn new(manager: Arc<ContainerManager>) -> Self {
        Self::with_cooldown(manager, DEFAULT_PRUNE_COOLDOWN)
    }

    pub fn with_cooldown(manager: Arc<ContainerManager>, cooldown: Duration) -> Self {
        Self {
            manager,
            cooldown,
            last_prune_at_ms: Mutex::new(None),
        }
    }

    /// Claim the next scan slot; false while the cooldown is running
    fn try_claim(&self, now: i64) -> bool {
        let mut last = self
            .last_prune_at_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let cooldown_ms = self.cooldown.as_millis() as i64;
        if let Some(prev) = *last {
            if now - prev < cooldown_ms {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Rate-limited prune. Returns `None` when skipped by the cooldown or when
    /// the scan failed; failures are logged, never propagated.
    pub async fn maybe_prune(&self, cfg: &Config) -> Option<PruneReport> {
        let now = now_ms();
        if !self.try_claim(now) {
            debug!("Skipping sandbox prune, last scan was less than {:?} ago", self.cooldown);
            return None;
        }

        match self.prune_at(cfg, now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Failed to prune sandbox containers: {:#}", e);
                None
            }
        }
    }

    /// Scan now, ignoring the cooldown
    pub async fn prune_once(&self, cfg: &Config) -> Result<PruneReport> {
        self.prune_at(cfg, now_ms()).await
    }

    /// Scan the registry as of `now` and remove every expired container
    pub async fn prune_at(&self, cfg: &Config, now: i64) -> Result<PruneReport> {
        let registry = self.manager.registry().read().await;
        let mut report = PruneReport {
            scanned: registry.entries.len(),
            removed: Vec::new(),
        };

        for entry in registry.entries {
            let agent_id = resolve_agent_id(&entry.session_key);
            let prune = resolve_sandbox_config_for_agent(cfg, agent_id.as_deref()).prune;

            if !should_prune(&entry, &prune, now) {
                continue;
            }

            info!(
                "Pruning sandbox container {} (idle: {}h, age: {}d, config: idle_limit={}h, max_age={}d)",
                entry.container_name,
                now.saturating_sub(entry.last_used_at_ms) / HOUR_MS,
                now.saturating_sub(entry.created_at_ms) / DAY_MS,
                prune.idle_hours,
                prune.max_age_days
            );

            // The snapshot may be stale by now; a container used since the
            // scan started stays.
            let removed = self
                .manager
                .remove_sandbox_container_if(&entry.container_name, |current| {
                    current.is_some_and(|e| should_prune(e, &prune, now))
                })
                .await;
            match removed {
                Ok(true) => report.removed.push(entry.container_name),
                Ok(false) => debug!(
                    "Keeping sandbox container {}, it was used during the prune scan",
                    entry.container_name
                ),
                Err(e) => warn!("Failed to prune container {}: {:#}", entry.container_name, e),
            }
        }

        if !report.removed.is_empty() {
            info!("Pruned {} idle sandbox containers", report.removed.len());
        }

        Ok(report)
    }

    /// Background task that calls [`maybe_prune`](Self::maybe_prune) on every tick
    pub fn spawn_periodic(self: Arc<Self>, cfg: Arc<Config>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                self.maybe_prune(&cfg).await;
            }
        })
    }
}
