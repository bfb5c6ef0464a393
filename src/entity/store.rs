//! In-process working store.

use super::{ScanFilter, Side, StoredEntry, WorkingStore};
use crate::error::Result;
use ahash::AHashMap;
use dashmap::DashMap;

#[derive(Debug, Default)]
struct TableEntries {
    index: AHashMap<String, usize>,
    entries: Vec<StoredEntry>,
}

/// Working store backed by a concurrent map of per-table entry lists.
///
/// Each `(side, table)` shard is locked for the duration of one `put_all`, so
/// insert-if-absent is atomic per table.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: DashMap<(Side, String), TableEntries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn shard_key(side: Side, table: &str) -> (Side, String) {
    (side, table.to_lowercase())
}

impl WorkingStore for MemoryStore {
    fn put_all(&self, side: Side, entries: &[StoredEntry]) -> Result<u64> {
        let mut added = 0u64;
        let mut grouped: AHashMap<String, Vec<&StoredEntry>> = AHashMap::new();
        for entry in entries {
            grouped
                .entry(entry.table.to_lowercase())
                .or_default()
                .push(entry);
        }

        for (table, group) in grouped {
            let mut shard = self.tables.entry((side, table)).or_default();
            for entry in group {
                if shard.index.contains_key(&entry.key) {
                    continue;
                }
                let pos = shard.entries.len();
                shard.index.insert(entry.key.clone(), pos);
                shard.entries.push(entry.clone());
                added += 1;
            }
        }

        Ok(added)
    }

    fn contains(&self, side: Side, table: &str, key: &str) -> Result<bool> {
        Ok(self
            .tables
            .get(&shard_key(side, table))
            .is_some_and(|t| t.index.contains_key(key)))
    }

    fn scan(
        &self,
        side: Side,
        table: &str,
        filter: ScanFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<StoredEntry>> {
        let Some(shard) = self.tables.get(&shard_key(side, table)) else {
            return Ok(Vec::new());
        };
        Ok(shard
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count(&self, side: Side, table: &str, filter: ScanFilter) -> Result<u64> {
        let Some(shard) = self.tables.get(&shard_key(side, table)) else {
            return Ok(0);
        };
        Ok(match filter.birthday {
            None => shard.entries.len() as u64,
            Some(_) => shard.entries.iter().filter(|e| filter.matches(e)).count() as u64,
        })
    }

    fn tables(&self, side: Side) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .tables
            .iter()
            .filter(|r| r.key().0 == side && !r.value().entries.is_empty())
            .map(|r| r.key().1.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn clear(&self) -> Result<()> {
        self.tables.clear();
        Ok(())
    }
}
