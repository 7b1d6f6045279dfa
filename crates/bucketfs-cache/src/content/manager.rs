//! Process-wide content-cache table: admission, size ledger, LRU eviction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bucketfs_core::domain::{ObjectMetadata, ObjectName};
use tracing::{debug, info, warn};

use crate::content::entry::{CacheEntry, CacheKey};
use crate::error::CacheError;

/// Owner of every live cache entry and of the byte-budget ledger.
///
/// All admission and eviction decisions happen under the single table lock;
/// the lock is never held across I/O or awaits — file deletion happens after
/// the victim is already out of the table.
pub struct FileCacheManager {
    dir: PathBuf,
    /// Total byte budget. Admission beyond this triggers eviction.
    budget: u64,
    chunk_size: u64,
    table: Mutex<HashMap<CacheKey, Arc<CacheEntry>>>,
}

impl FileCacheManager {
    /// Creates the manager and its on-disk directory.
    pub fn new(dir: PathBuf, budget: u64, chunk_size: u64) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            budget,
            chunk_size,
            table: Mutex::new(HashMap::new()),
        })
    }

    /// Configured byte budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Sum of the sizes of all live entries.
    pub fn total_size(&self) -> u64 {
        let table = self.table.lock().unwrap();
        table.values().map(|e| e.size()).sum()
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Returns the live entry for exactly this (name, generation), if any,
    /// bumping its LRU position.
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let table = self.table.lock().unwrap();
        let entry = table.get(key)?;
        if entry.is_doomed() {
            return None;
        }
        entry.touch();
        Some(Arc::clone(entry))
    }

    /// Returns the existing entry for this object generation or admits a
    /// new one, evicting under pressure.
    ///
    /// A `CacheError::Full` means the caller should fall back to direct
    /// range reads; the miss is logged as an observability event, not an
    /// operation failure.
    pub fn lookup_or_admit(
        &self,
        metadata: &ObjectMetadata,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        let key = CacheKey::new(metadata.name.clone(), metadata.generation);

        let mut victims: Vec<Arc<CacheEntry>> = Vec::new();
        let entry = {
            let mut table = self.table.lock().unwrap();

            if let Some(existing) = table.get(&key) {
                if !existing.is_doomed() {
                    existing.touch();
                    return Ok(Arc::clone(existing));
                }
            }

            // A different generation of the same name is now stale.
            Self::doom_other_generations(&mut table, &key, &mut victims);

            if metadata.size > self.budget {
                info!(
                    name = %key.name,
                    size = metadata.size,
                    budget = self.budget,
                    "object larger than cache budget, admission refused"
                );
                return Err(CacheError::Full {
                    needed: metadata.size,
                    budget: self.budget,
                });
            }

            // Evict zero-reference entries, least recently used first,
            // until the candidate fits.
            let mut used: u64 = table.values().map(|e| e.size()).sum();
            while used + metadata.size > self.budget {
                let victim_key = table
                    .iter()
                    .filter(|(_, e)| e.ref_count() == 0)
                    .min_by_key(|(_, e)| e.last_used())
                    .map(|(k, _)| k.clone());
                match victim_key {
                    Some(k) => {
                        let victim = table.remove(&k).expect("victim key just observed");
                        debug!(name = %k.name, generation = %k.generation, "evicting cache entry (LRU)");
                        used -= victim.size();
                        victim.doom();
                        victims.push(victim);
                    }
                    None => {
                        info!(
                            name = %key.name,
                            size = metadata.size,
                            used,
                            budget = self.budget,
                            "cache admission refused: no evictable entries"
                        );
                        // Put the already-doomed victims on disk-cleanup
                        // duty before bailing out.
                        for victim in &victims {
                            Self::cleanup_victim(victim);
                        }
                        return Err(CacheError::Full {
                            needed: metadata.size,
                            budget: self.budget,
                        });
                    }
                }
            }

            let entry = Arc::new(CacheEntry::create(
                &self.dir,
                key,
                metadata.size,
                self.chunk_size,
            )?);
            table.insert(entry.key().clone(), Arc::clone(&entry));
            entry
        };

        for victim in &victims {
            Self::cleanup_victim(victim);
        }
        Ok(entry)
    }

    /// Dooms every live entry for `name`, regardless of generation.
    ///
    /// Called when the object is deleted or overwritten through the mount.
    pub fn invalidate(&self, name: &ObjectName) {
        let mut victims = Vec::new();
        {
            let mut table = self.table.lock().unwrap();
            let keys: Vec<CacheKey> = table
                .keys()
                .filter(|k| &k.name == name)
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = table.remove(&key) {
                    entry.doom();
                    victims.push(entry);
                }
            }
        }
        for victim in &victims {
            Self::cleanup_victim(victim);
        }
    }

    /// Releases a handle's reference; doomed entries with no remaining
    /// references are deleted from disk.
    pub fn release(&self, entry: &Arc<CacheEntry>) {
        if entry.release() == 0 && entry.is_doomed() {
            Self::cleanup_victim(entry);
        }
    }

    fn doom_other_generations(
        table: &mut HashMap<CacheKey, Arc<CacheEntry>>,
        key: &CacheKey,
        victims: &mut Vec<Arc<CacheEntry>>,
    ) {
        let stale: Vec<CacheKey> = table
            .keys()
            .filter(|k| k.name == key.name && k.generation != key.generation)
            .cloned()
            .collect();
        for stale_key in stale {
            if let Some(entry) = table.remove(&stale_key) {
                debug!(
                    name = %stale_key.name,
                    generation = %stale_key.generation,
                    "superseded cache entry invalidated"
                );
                entry.doom();
                victims.push(entry);
            }
        }
    }

    fn cleanup_victim(victim: &Arc<CacheEntry>) {
        if victim.ref_count() > 0 {
            // A handle is still reading; files are deleted when the last
            // reference is released.
            return;
        }
        if let Err(e) = victim.remove_files() {
            warn!(name = %victim.key().name, error = %e, "failed to remove evicted cache entry");
        }
    }
}
