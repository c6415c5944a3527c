use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REGISTRY_FILE: &str = "containers.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRegistryEntry {
    pub container_name: String,
    /// Scope key of the owner (`agent:<id>`, a session key, or `shared`)
    pub session_key: String,
    pub created_at_ms: i64,
    pub last_used_at_ms: i64,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxRegistryData {
    pub entries: Vec<SandboxRegistryEntry>,
}

impl SandboxRegistryData {
    pub fn get(&self, container_name: &str) -> Option<&SandboxRegistryEntry> {
        self.entries
            .iter()
            .find(|e| e.container_name == container_name)
    }
}

/// Combine a new entry with the one already recorded under the same name.
/// `created_at_ms` and `image` are kept from the existing entry; the config
/// hash falls back to the existing one only when the update carries none.
pub fn merge_entry(
    existing: Option<&SandboxRegistryEntry>,
    entry: SandboxRegistryEntry,
) -> SandboxRegistryEntry {
    match existing {
        Some(prev) => SandboxRegistryEntry {
            created_at_ms: prev.created_at_ms,
            image: prev.image.clone(),
            config_hash: entry.config_hash.or_else(|| prev.config_hash.clone()),
            ..entry
        },
        None => entry,
    }
}

/// File-backed registry with a single in-process writer
pub struct SandboxRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SandboxRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Registry at `<state_dir>/sandbox/containers.json`
    pub fn in_state_dir<P: AsRef<Path>>(state_dir: P) -> Self {
        Self::new(state_dir.as_ref().join("sandbox").join(REGISTRY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry; any read or parse failure yields an empty registry
    pub async fn read(&self) -> SandboxRegistryData {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read sandbox registry {}: {}", self.path.display(), e);
                }
                return SandboxRegistryData::default();
            }
        };

        match serde_json::from_str::<SandboxRegistryData>(&contents) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Ignoring corrupt sandbox registry {}: {}",
                    self.path.display(),
                    e
                );
                SandboxRegistryData::default()
            }
        }
    }

    pub async fn get(&self, container_name: &str) -> Option<SandboxRegistryEntry> {
        self.read().await.get(container_name).cloned()
    }

    /// Insert or refresh an entry (see [`merge_entry`])
    pub async fn update(&self, entry: SandboxRegistryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut data = self.read().await;
        let position = data
            .entries
            .iter()
            .position(|e| e.container_name == entry.container_name);
        let existing = position.map(|idx| data.entries.remove(idx));

        let merged = merge_entry(existing.as_ref(), entry);
        debug!(
            "Recording sandbox container {} (session_key={})",
            merged.container_name, merged.session_key
        );
        data.entries.push(merged);

        self.write(&data).await
    }

    /// Remove an entry. Returns whether anything was removed; the file is
    /// only rewritten when it was.
    pub async fn remove(&self, container_name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let mut data = self.read().await;
        let before = data.entries.len();
        data.entries.retain(|e| e.container_name != container_name);
        if data.entries.len() == before {
            return Ok(false);
        }

        self.write(&data).await?;
        Ok(true)
    }

    async fn write(&self, data: &SandboxRegistryData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }

        let mut contents =
            serde_json::to_string_pretty(data).context("Failed to serialize sandbox registry")?;
        contents.push('\n');

        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, contents)
            .await
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(name: &str, created: i64, used: i64, image: &str) -> SandboxRegistryEntry {
        SandboxRegistryEntry {
            container_name: name.to_string(),
            session_key: "agent:main".to_string(),
            created_at_ms: created,
            last_used_at_ms: used,
            image: image.to_string(),
            config_hash: None,
        }
    }

    fn make_registry() -> (TempDir, SandboxRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = SandboxRegistry::in_state_dir(dir.path());
        (dir, registry)
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let (_dir, registry) = make_registry();
        assert!(registry.read().await.entries.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_empty() {
        let (_dir, registry) = make_registry();
        fs::create_dir_all(registry.path().parent().unwrap())
            .await
            .unwrap();
        fs::write(registry.path(), "{not json").await.unwrap();
        assert!(registry.read().await.entries.is_empty());

        fs::write(registry.path(), r#"{"entries": 5}"#).await.unwrap();
        assert!(registry.read().await.entries.is_empty());

        // A write heals the file
        registry.update(entry("c1", 1, 1, "a")).await.unwrap();
        assert_eq!(registry.read().await.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_preserves_identity_fields() {
        let (_dir, registry) = make_registry();
        registry.update(entry("c1", 1000, 1000, "a")).await.unwrap();
        registry.update(entry("c1", 9999, 2000, "b")).await.unwrap();

        let data = registry.read().await;
        assert_eq!(data.entries.len(), 1);
        let stored = data.get("c1").unwrap();
        assert_eq!(stored.created_at_ms, 1000);
        assert_eq!(stored.image, "a");
        assert_eq!(stored.last_used_at_ms, 2000);
    }

    #[test]
    fn test_merge_config_hash_fallback() {
        let mut prev = entry("c1", 1, 1, "a");
        prev.config_hash = Some("old".to_string());

        let merged = merge_entry(Some(&prev), entry("c1", 2, 2, "b"));
        assert_eq!(merged.config_hash.as_deref(), Some("old"));

        let mut next = entry("c1", 2, 3, "b");
        next.config_hash = Some("new".to_string());
        let merged = merge_entry(Some(&prev), next);
        assert_eq!(merged.config_hash.as_deref(), Some("new"));
        assert_eq!(merged.last_used_at_ms, 3);
    }

    #[tokio::test]
    async fn test_file_format() {
        let (_dir, registry) = make_registry();
        registry.update(entry("c1", 1, 2, "img")).await.unwrap();

        let raw = fs::read_to_string(registry.path()).await.unwrap();
        assert!(raw.ends_with("}\n"));
        assert!(raw.contains("\"containerName\": \"c1\""));
        assert!(raw.contains("\"lastUsedAtMs\": 2"));
        assert!(!raw.contains("configHash"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_dir, registry) = make_registry();
        registry.update(entry("c1", 1, 1, "a")).await.unwrap();
        registry.update(entry("c2", 1, 1, "a")).await.unwrap();

        assert!(registry.remove("c1").await.unwrap());
        assert!(!registry.remove("c1").await.unwrap());
        assert!(!registry.remove("nope").await.unwrap());

        let data = registry.read().await;
        assert_eq!(data.entries.len(), 1);
        assert!(data.get("c2").is_some());
    }

    #[tokio::test]
    async fn test_remove_on_missing_file_does_not_create_it() {
        let (_dir, registry) = make_registry();
        assert!(!registry.remove("c1").await.unwrap());
        assert!(!registry.path().exists());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let (_dir, registry) = make_registry();
        let registry = Arc::new(registry);

        let mut handles = vec![];
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update(entry(&format!("c{}", i), i, i, "img"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.read().await.entries.len(), 20);
    }
}
