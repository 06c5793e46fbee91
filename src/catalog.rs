//! In-memory dataset catalog.
//!
//! [`DatasetCatalog`] is the merged, queryable view over every connector's
//! results. Writes replace one entry at a time under a short write lock,
//! so a reader running during a refresh always sees whole entries, never a
//! half-written one. Readers receive clones; nothing outside the catalog
//! holds a reference into the map.
//!
//! # Search ranking
//!
//! Matching is a case-insensitive substring test. Results are grouped into
//! tiers and sorted by id within a tier:
//!
//! | Tier | Match |
//! |------|-------|
//! | 0 | name equals the query |
//! | 1 | name contains the query |
//! | 2 | a schema field name contains the query |
//! | 3 | source, description, or a tag contains the query |

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{Catalog, DatasetMetadata, UpsertOutcome};

/// Optional narrowing applied on top of the text query.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Exact source label (e.g. `"ine:es"`).
    pub source: Option<String>,
    /// Every listed tag must be present (case-insensitive).
    pub tags: Vec<String>,
    /// Only entries fetched at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct DatasetCatalog {
    entries: RwLock<BTreeMap<String, DatasetMetadata>>,
}

impl DatasetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry with the same id.
    ///
    /// An entry whose `fetched_at` is older than the stored one is rejected,
    /// keeping `fetched_at` non-decreasing per id.
    pub fn upsert(&self, entry: DatasetMetadata) -> UpsertOutcome {
        let mut entries = self.write();
        match entries.get(&entry.id) {
            None => {
                entries.insert(entry.id.clone(), entry);
                UpsertOutcome::Inserted
            }
            Some(existing) if entry.fetched_at < existing.fetched_at => UpsertOutcome::Stale,
            Some(existing) => {
                let outcome = if existing.same_content(&entry) {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::Updated
                };
                entries.insert(entry.id.clone(), entry);
                outcome
            }
        }
    }

    /// Drop one entry. Refreshes never call this; only operators do.
    pub fn remove(&self, id: &str) -> Option<DatasetMetadata> {
        self.write().remove(id)
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.write();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn get(&self, id: &str) -> Option<DatasetMetadata> {
        self.read().get(id).cloned()
    }

    /// Owned copy of the whole catalog.
    pub fn all(&self) -> Catalog {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Entries produced by the given source label.
    pub fn by_source(&self, source: &str) -> Vec<DatasetMetadata> {
        self.read()
            .values()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }

    /// Ids whose `fetched_at` is at least `ttl` old at `now`.
    pub fn stale(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<String> {
        self.read()
            .values()
            .filter(|e| is_stale(e, ttl, now))
            .map(|e| e.id.clone())
            .collect()
    }

    /// True when `source` has no entries yet or any of them is stale.
    pub fn source_is_due(&self, source: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        let entries = self.read();
        let mut from_source = entries.values().filter(|e| e.source == source).peekable();
        if from_source.peek().is_none() {
            return true;
        }
        from_source.any(|e| is_stale(e, ttl, now))
    }

    pub fn search(&self, query: &str) -> Vec<DatasetMetadata> {
        self.search_with(query, &SearchFilter::default())
    }

    pub fn search_with(&self, query: &str, filter: &SearchFilter) -> Vec<DatasetMetadata> {
        let needle = query.trim().to_lowercase();
        let entries = self.read();

        let mut ranked: Vec<(u8, &DatasetMetadata)> = entries
            .values()
            .filter(|e| passes_filter(e, filter))
            .filter_map(|e| match_tier(e, &needle).map(|tier| (tier, e)))
            .collect();

        // BTreeMap iteration is already id-ascending, so a stable sort by
        // tier keeps the id order inside each tier.
        ranked.sort_by_key(|(tier, _)| *tier);

        let limit = filter.limit.unwrap_or(usize::MAX);
        ranked
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, DatasetMetadata>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DatasetMetadata>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_stale(entry: &DatasetMetadata, ttl: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| entry.fetched_at.checked_add_signed(ttl))
        .map_or(false, |expires| expires <= now)
}

fn passes_filter(entry: &DatasetMetadata, filter: &SearchFilter) -> bool {
    if let Some(source) = &filter.source {
        if &entry.source != source {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if entry.fetched_at < since {
            return false;
        }
    }
    filter.tags.iter().all(|wanted| {
        entry
            .tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(wanted))
    })
}

/// Relevance tier of `entry` for a lowercased needle; `None` if no match.
fn match_tier(entry: &DatasetMetadata, needle: &str) -> Option<u8> {
    if needle.is_empty() {
        return Some(1);
    }
    let name = entry.name.to_lowercase();
    if name == needle {
        return Some(0);
    }
    if name.contains(needle) {
        return Some(1);
    }
    if entry
        .schema
        .keys()
        .any(|field| field.to_lowercase().contains(needle))
    {
        return Some(2);
    }
    let in_description = entry
        .description
        .as_deref()
        .is_some_and(|d| d.to_lowercase().contains(needle));
    if entry.source.to_lowercase().contains(needle)
        || in_description
        || entry.tags.iter().any(|t| t.to_lowercase().contains(needle))
    {
        return Some(3);
    }
    None
}
