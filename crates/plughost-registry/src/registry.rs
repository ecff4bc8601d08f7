//! The plugin catalog.
//!
//! [`Registry`] owns the persisted catalog file and its in-memory secondary
//! indexes (category and capability).  It is cheaply cloneable: clones share
//! the same state, so one instance can be handed to the loader and the
//! executor alike.
//!
//! Every mutation runs a locked read-modify-write cycle against the catalog
//! file (see [`crate::store`]), so the in-memory view is refreshed from disk
//! before each change and concurrent host processes do not lose updates.
//!
//! # Example
//!
//! ```rust,no_run
//! # use plughost_registry::{PluginManifest, Registry};
//! # fn demo(manifest: PluginManifest) -> plughost_registry::Result<()> {
//! let registry = Registry::open("data/registry.json")?;
//! registry.register(manifest.clone(), "local:/opt/echo", "/opt/echo")?;
//! registry.update_usage(&manifest.id, true)?;
//! assert_eq!(registry.get(&manifest.id).unwrap().usage_count, 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::entry::{PluginEntry, Rarity};
use crate::error::{RegistryError, Result};
use crate::manifest::PluginManifest;
use crate::store::CatalogFile;

// ---------------------------------------------------------------------------
// Catalog (in-memory state)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Catalog {
    entries: BTreeMap<String, PluginEntry>,
    by_category: HashMap<String, BTreeSet<String>>,
    by_capability: HashMap<String, BTreeSet<String>>,
}

impl Catalog {
    fn from_entries(entries: BTreeMap<String, PluginEntry>) -> Self {
        let mut catalog = Self {
            entries: BTreeMap::new(),
            ..Self::default()
        };
        for (_, entry) in entries {
            catalog.insert(entry);
        }
        catalog
    }

    /// Insert or overwrite, keeping indexes consistent.
    fn insert(&mut self, entry: PluginEntry) {
        let id = entry.manifest.id.clone();
        self.remove(&id);

        self.by_category
            .entry(index_key(&entry.manifest.category))
            .or_default()
            .insert(id.clone());
        for capability in &entry.manifest.capabilities {
            self.by_capability
                .entry(index_key(capability))
                .or_default()
                .insert(id.clone());
        }

        self.entries.insert(id, entry);
    }

    /// Remove an entry and every index reference to it.
    fn remove(&mut self, id: &str) -> Option<PluginEntry> {
        let entry = self.entries.remove(id)?;

        let category = index_key(&entry.manifest.category);
        if let Some(ids) = self.by_category.get_mut(&category) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_category.remove(&category);
            }
        }
        for capability in &entry.manifest.capabilities {
            let key = index_key(capability);
            if let Some(ids) = self.by_capability.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_capability.remove(&key);
                }
            }
        }

        Some(entry)
    }

    fn lookup(&self, ids: Option<&BTreeSet<String>>) -> Vec<PluginEntry> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

fn index_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Aggregate counts over the whole collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_plugins: usize,
    pub active_plugins: usize,
    /// Sum of `usage_count` across all entries.
    pub total_usage: u64,
    pub by_category: BTreeMap<String, usize>,
    pub by_capability: BTreeMap<String, usize>,
    pub by_rarity: BTreeMap<Rarity, usize>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Persistent, indexed plugin catalog.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RwLock<Catalog>>,
    file: Arc<CatalogFile>,
}

impl Registry {
    /// Open (or create) the catalog stored at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file = CatalogFile::new(path);
        let entries = file.load()?;

        tracing::info!(
            path = %file.path().display(),
            plugins = entries.len(),
            "registry opened"
        );

        Ok(Self {
            state: Arc::new(RwLock::new(Catalog::from_entries(entries))),
            file: Arc::new(file),
        })
    }

    /// Path of the backing catalog file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Insert or overwrite the entry for `manifest.id` with fresh statistics.
    pub fn register(
        &self,
        manifest: PluginManifest,
        source: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Result<PluginEntry> {
        let entry = PluginEntry::new(manifest, source, local_path.into());
        let id = entry.manifest.id.clone();

        let registered = self.mutate(|catalog| {
            let replaced = catalog.entries.contains_key(&id);
            catalog.insert(entry.clone());
            (replaced, true)
        })?;

        tracing::info!(
            plugin_id = %id,
            version = %entry.manifest.version,
            replaced = registered,
            "plugin registered"
        );
        Ok(entry)
    }

    /// Remove an entry.  Returns `false` if it was not registered.
    pub fn unregister(&self, id: &str) -> Result<bool> {
        let removed = self.mutate(|catalog| {
            let removed = catalog.remove(id).is_some();
            (removed, removed)
        })?;

        if removed {
            tracing::info!(plugin_id = %id, "plugin unregistered");
        }
        Ok(removed)
    }

    /// Pure lookup.
    pub fn get(&self, id: &str) -> Option<PluginEntry> {
        self.read().entries.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.read().entries.contains_key(id)
    }

    /// Every entry, ordered by id.
    pub fn list(&self) -> Vec<PluginEntry> {
        self.read().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Case-insensitive substring search over name, description and
    /// capabilities, best `overall_score` first.
    pub fn search(&self, query: &str) -> Vec<PluginEntry> {
        let needle = query.trim().to_lowercase();
        let mut hits: Vec<PluginEntry> = self
            .read()
            .entries
            .values()
            .filter(|e| e.matches(&needle))
            .cloned()
            .collect();
        sort_by_score(&mut hits);
        hits
    }

    /// Entries whose category equals `category` (case-insensitive).
    pub fn by_category(&self, category: &str) -> Vec<PluginEntry> {
        let catalog = self.read();
        catalog.lookup(catalog.by_category.get(&index_key(category)))
    }

    /// Entries declaring `capability` (case-insensitive).
    pub fn by_capability(&self, capability: &str) -> Vec<PluginEntry> {
        let catalog = self.read();
        catalog.lookup(catalog.by_capability.get(&index_key(capability)))
    }

    /// Most used active entries, ties broken by score.
    pub fn trending(&self, limit: usize) -> Vec<PluginEntry> {
        let mut active: Vec<PluginEntry> = self
            .read()
            .entries
            .values()
            .filter(|e| e.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| b.overall_score().total_cmp(&a.overall_score()))
                .then_with(|| a.id().cmp(b.id()))
        });
        active.truncate(limit);
        active
    }

    /// Record one execution: `usage_count += 1` and the success-rate moving
    /// average.  Returns `false` (and writes nothing) if `id` is unknown.
    pub fn update_usage(&self, id: &str, success: bool) -> Result<bool> {
        self.record(id, success, None)
    }

    /// Like [`update_usage`](Self::update_usage), also folding `duration`
    /// into the latency average.
    pub fn record_execution(&self, id: &str, success: bool, duration: Duration) -> Result<bool> {
        self.record(id, success, Some(duration))
    }

    fn record(&self, id: &str, success: bool, duration: Option<Duration>) -> Result<bool> {
        let recorded = self.mutate(|catalog| match catalog.entries.get_mut(id) {
            Some(entry) => {
                entry.record(success, duration);
                (true, true)
            }
            None => (false, false),
        })?;

        if recorded {
            tracing::debug!(plugin_id = %id, success, "usage recorded");
        } else {
            tracing::debug!(plugin_id = %id, "usage update for unknown plugin ignored");
        }
        Ok(recorded)
    }

    /// Enable or disable execution of a plugin.
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let found = self.mutate(|catalog| match catalog.entries.get_mut(id) {
            Some(entry) => {
                entry.is_active = active;
                entry.last_updated = Utc::now();
                (true, true)
            }
            None => (false, false),
        })?;

        if !found {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        tracing::info!(plugin_id = %id, active, "plugin activation changed");
        Ok(())
    }

    /// Aggregate counts by category, capability and rarity.
    pub fn collection_stats(&self) -> CollectionStats {
        let catalog = self.read();
        let mut stats = CollectionStats {
            total_plugins: catalog.entries.len(),
            ..CollectionStats::default()
        };

        for rarity in Rarity::ALL {
            stats.by_rarity.insert(rarity, 0);
        }

        for entry in catalog.entries.values() {
            if entry.is_active {
                stats.active_plugins += 1;
            }
            stats.total_usage = stats.total_usage.saturating_add(entry.usage_count);
            *stats
                .by_category
                .entry(entry.manifest.category.clone())
                .or_default() += 1;
            for capability in &entry.manifest.capabilities {
                *stats.by_capability.entry(capability.clone()).or_default() += 1;
            }
            *stats.by_rarity.entry(entry.rarity()).or_default() += 1;
        }

        stats
    }

    /// Re-read the catalog from disk, discarding the in-memory view.
    pub fn reload(&self) -> Result<()> {
        let entries = self.file.load()?;
        *self.write() = Catalog::from_entries(entries);
        Ok(())
    }

    /// Locked read-modify-write.
    ///
    /// `apply` receives a catalog freshly loaded from disk and returns its
    /// result plus whether anything changed.  Only changed catalogs are
    /// written; the in-memory view is swapped only after a successful write.
    fn mutate<T>(&self, apply: impl FnOnce(&mut Catalog) -> (T, bool)) -> Result<T> {
        let _lock = self.file.lock()?;
        let mut next = Catalog::from_entries(self.file.load()?);

        let (out, changed) = apply(&mut next);
        if changed {
            self.file.save(&next.entries)?;
        }

        *self.write() = next;
        Ok(out)
    }

    fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sort_by_score(entries: &mut [PluginEntry]) {
    entries.sort_by(|a, b| {
        b.overall_score()
            .total_cmp(&a.overall_score())
            .then_with(|| a.id().cmp(b.id()))
    });
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.file.path())
            .field("plugins", &self.len())
            .finish()
    }
}
