//! Saved ownership state: domains, zones, grants and rules
//!
//! Captured requests live in the request store. Everything a management
//! call can change lives here, written as one snapshot per change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::access::{AccessControl, ZoneGrants};
use crate::error::{Result, VigilError};
use crate::models::{Domain, Zone};
use crate::registry::ZoneRegistry;
use crate::rules::{RuleEngine, RuleView};

/// One full snapshot of the ownership state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub domains: Vec<Domain>,
    /// Every issued zone, soft-deleted ones included
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub grants: ZoneGrants,
    #[serde(default)]
    pub rules: Vec<RuleView>,
}

/// Where catalog snapshots are kept
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Latest snapshot; empty when nothing was saved yet
    async fn load(&self) -> Result<Catalog>;

    /// Replaces the saved snapshot
    async fn save(&self, catalog: &Catalog) -> Result<()>;
}

/// Keeps the snapshot in memory only
#[derive(Default)]
pub struct MemoryCatalogStore {
    saved: RwLock<Catalog>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load(&self) -> Result<Catalog> {
        let saved = self.saved.read().unwrap_or_else(|e| e.into_inner());
        Ok(saved.clone())
    }

    async fn save(&self, catalog: &Catalog) -> Result<()> {
        let mut saved = self.saved.write().unwrap_or_else(|e| e.into_inner());
        *saved = catalog.clone();
        Ok(())
    }
}

/// Pretty-printed JSON file, replaced atomically through a sibling temp file
pub struct JsonCatalogStore {
    path: PathBuf,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    async fn load(&self) -> Result<Catalog> {
        match tokio::fs::read(&self.path).await {
            Ok(content) => {
                let catalog: Catalog = serde_json::from_slice(&content).map_err(|e| {
                    VigilError::ConfigError(format!(
                        "cannot read catalog {}: {e}",
                        self.path.display()
                    ))
                })?;
                info!(
                    "Loaded catalog from {} ({} domain(s), {} zone(s), {} rule(s))",
                    self.path.display(),
                    catalog.domains.len(),
                    catalog.zones.len(),
                    catalog.rules.len()
                );
                Ok(catalog)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Catalog::default()),
            Err(e) => Err(VigilError::IoError(e)),
        }
    }

    async fn save(&self, catalog: &Catalog) -> Result<()> {
        let body = serde_json::to_vec_pretty(catalog)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| VigilError::StorageUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| VigilError::StorageUnavailable(e.to_string()))?;
        debug!("Saved catalog to {}", self.path.display());
        Ok(())
    }
}

/// Snapshots the live state into a catalog store after each change
pub struct CatalogSync {
    registry: Arc<ZoneRegistry>,
    access: Arc<AccessControl>,
    rules: Arc<RuleEngine>,
    store: Arc<dyn CatalogStore>,
    writer: Mutex<()>,
}

impl CatalogSync {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        access: Arc<AccessControl>,
        rules: Arc<RuleEngine>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            registry,
            access,
            rules,
            store,
            writer: Mutex::new(()),
        }
    }

    /// Current state as a catalog
    pub fn snapshot(&self) -> Catalog {
        Catalog {
            domains: self.registry.domains(),
            zones: self.registry.all_zones(),
            grants: self.access.grants(),
            rules: self.rules.all_rules(),
        }
    }

    /// Loads the saved catalog into the live registry, grants and rules
    pub async fn restore(&self) -> Result<Catalog> {
        let catalog = self.store.load().await?;
        self.rules.restore(&catalog.rules)?;
        self.registry
            .restore(catalog.domains.clone(), catalog.zones.clone());
        self.access.restore_grants(catalog.grants.clone());
        Ok(catalog)
    }

    /// Writes the current state
    ///
    /// Snapshots are taken under the writer lock so saves land in order.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        let catalog = self.snapshot();
        self.store.save(&catalog).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::DEFAULT_PUBLIC_OWNER;
    use std::collections::BTreeSet;

    fn live() -> (Arc<ZoneRegistry>, Arc<AccessControl>, Arc<RuleEngine>) {
        let registry = Arc::new(ZoneRegistry::new());
        let access = Arc::new(AccessControl::new(Arc::clone(&registry), DEFAULT_PUBLIC_OWNER));
        (registry, access, Arc::new(RuleEngine::new()))
    }

    #[tokio::test]
    async fn test_json_catalog_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CatalogStore> =
            Arc::new(JsonCatalogStore::new(dir.path().join("catalog.json")));

        let (registry, access, rules) = live();
        registry.register_domain("ssrf.uk", BTreeSet::new(), "root").unwrap();
        let zone = registry.issue_zone("ssrf.uk", "alice", Some("abc")).unwrap();
        access.assign_owner(&zone);
        let sync = CatalogSync::new(registry, access, rules, Arc::clone(&store));
        sync.persist().await.unwrap();

        let (registry, access, rules) = live();
        let sync = CatalogSync::new(Arc::clone(&registry), Arc::clone(&access), rules, store);
        let catalog = sync.restore().await.unwrap();
        assert_eq!(catalog.zones.len(), 1);
        assert!(registry.resolve("abc.ssrf.uk").is_some());
        assert_eq!(access.grants()["abc.ssrf.uk"].len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCatalogStore::new(dir.path().join("absent.json"));
        let catalog = store.load().await.unwrap();
        assert!(catalog.domains.is_empty() && catalog.zones.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_catalog_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = JsonCatalogStore::new(&path);
        assert!(matches!(store.load().await, Err(VigilError::ConfigError(_))));
    }
}
