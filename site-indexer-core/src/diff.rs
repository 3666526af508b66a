//! Index diffing: classifies freshly generated records against the stored index items.

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::record::{ExistingIndexItem, PageIndexRecord};

/// A fresh record matching a stored item. The item id is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdate {
    pub item_id: String,
    pub record: PageIndexRecord,
    /// Whether any field differs from what is stored.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexDiff {
    pub create: Vec<PageIndexRecord>,
    pub update: Vec<IndexUpdate>,
    pub delete: Vec<ExistingIndexItem>,
}

impl IndexDiff {
    /// True when there is nothing to create or update.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty()
    }

    pub fn changed_updates(&self) -> impl Iterator<Item = &IndexUpdate> {
        self.update.iter().filter(|u| u.changed)
    }

    pub fn unchanged_updates(&self) -> impl Iterator<Item = &IndexUpdate> {
        self.update.iter().filter(|u| !u.changed)
    }
}

/// Diffs `fresh` against `existing` on `(site, pageid)`.
///
/// Existing items of other sites are ignored. When two stored items share a key, the first
/// is kept as the match and the others are deleted.
pub fn diff(site: &str, fresh: Vec<PageIndexRecord>, existing: Vec<ExistingIndexItem>) -> IndexDiff {
    let mut by_key: HashMap<(String, String), ExistingIndexItem> = HashMap::new();
    let mut result = IndexDiff::default();

    for item in existing.into_iter().filter(|i| i.record.site == site) {
        let key = (item.record.site.clone(), item.record.pageid.clone());
        if by_key.contains_key(&key) {
            result.delete.push(item);
        } else {
            by_key.insert(key, item);
        }
    }

    let mut fresh_keys: HashSet<(String, String)> = HashSet::new();
    for record in fresh {
        let key = (record.site.clone(), record.pageid.clone());
        if !fresh_keys.insert(key.clone()) {
            continue;
        }
        match by_key.remove(&key) {
            Some(existing) => result.update.push(IndexUpdate {
                changed: existing.record != record,
                item_id: existing.id,
                record,
            }),
            None => result.create.push(record),
        }
    }

    let mut stale: Vec<ExistingIndexItem> = by_key.into_values().collect();
    stale.sort_by(|a, b| a.record.pageid.cmp(&b.record.pageid));
    result.delete.extend(stale);

    info!(
        site = %site,
        create = result.create.len(),
        update = result.update.len(),
        changed = result.changed_updates().count(),
        delete = result.delete.len(),
        "[DIFF] Classified index records"
    );
    result
}
