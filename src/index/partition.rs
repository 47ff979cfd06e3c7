use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::types::{Template, TemplateId};

/// One disjoint slice of the template keyspace.
///
/// Holds the templates themselves plus a `group_id -> ids` index. Both maps
/// are sharded `DashMap`s, so loads and searches on different keys do not
/// contend. Entry count is capped; past the cap the least recently touched
/// entry is evicted using sampled approximate LRU.
pub struct Partition {
    entries: DashMap<TemplateId, PartitionEntry>,
    groups: DashMap<String, DashSet<TemplateId>>,
    max_entries: usize,
    clock: AtomicU64,
}

struct PartitionEntry {
    template: Arc<Template>,
    last_touched: AtomicU64,
}

/// What an insert did to the partition's entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    pub added: bool,
    pub evicted: usize,
}

impl Partition {
    /// Entries examined per eviction round.
    const EVICTION_SAMPLE_SIZE: usize = 16;

    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            groups: DashMap::new(),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or overwrite by id. An overwrite drops the id from any group it
    /// no longer belongs to.
    pub fn insert(&self, template: Template) -> InsertOutcome {
        let id = template.id.clone();
        let new_groups = template.group_ids.clone();
        let entry = PartitionEntry {
            template: Arc::new(template),
            last_touched: AtomicU64::new(self.tick()),
        };

        let old = self.entries.insert(id.clone(), entry);
        if let Some(old) = &old {
            for g in old.template.group_ids.difference(&new_groups) {
                self.unindex(g, &id);
            }
        }
        for g in &new_groups {
            self.groups.entry(g.clone()).or_default().insert(id.clone());
        }

        InsertOutcome {
            added: old.is_none(),
            evicted: self.evict_if_needed(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        let entry = self.entries.get(id)?;
        entry.last_touched.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&entry.template))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Template>> {
        let (_, entry) = self.entries.remove(id)?;
        for g in &entry.template.group_ids {
            self.unindex(g, id);
        }
        Some(entry.template)
    }

    fn unindex(&self, group: &str, id: &str) {
        let now_empty = match self.groups.get(group) {
            Some(ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove_if(group, |_, ids| ids.is_empty());
        }
    }

    /// Ids in this partition tagged with `group`.
    pub fn group_members(&self, group: &str) -> Vec<TemplateId> {
        self.groups
            .get(group)
            .map(|ids| ids.iter().map(|id| id.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Visit every template, or only those in at least one of `groups`.
    ///
    /// With a filter the group index prunes the walk. Membership is checked
    /// again on the template itself, so an index entry left behind by a racing
    /// overwrite can never widen the candidate set.
    pub fn scan<F>(&self, groups: Option<&BTreeSet<String>>, mut visit: F)
    where
        F: FnMut(&Template),
    {
        match groups {
            None => {
                for entry in self.entries.iter() {
                    visit(&entry.value().template);
                }
            }
            Some(groups) => {
                let mut ids: HashSet<TemplateId> = HashSet::new();
                for g in groups {
                    if let Some(members) = self.groups.get(g) {
                        ids.extend(members.iter().map(|id| id.key().clone()));
                    }
                }
                for id in ids {
                    let template = match self.entries.get(&id) {
                        Some(entry) => Arc::clone(&entry.template),
                        None => continue,
                    };
                    if template.in_any_group(groups) {
                        visit(&template);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything and return how many templates were removed.
    pub fn clear(&self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.groups.clear();
        n
    }

    /// Release spare map capacity after large removals.
    pub fn reclaim(&self) {
        self.groups.retain(|_, ids| !ids.is_empty());
        for ids in self.groups.iter() {
            ids.shrink_to_fit();
        }
        self.groups.shrink_to_fit();
        self.entries.shrink_to_fit();
    }

    pub fn approx_bytes(&self) -> usize {
        let templates: usize = self
            .entries
            .iter()
            .map(|e| e.value().template.approx_bytes() + std::mem::size_of::<PartitionEntry>())
            .sum();
        let index: usize = self
            .groups
            .iter()
            .map(|g| g.key().len() + g.value().len() * std::mem::size_of::<TemplateId>())
            .sum();
        templates + index
    }

    /// Approximate LRU eviction via random sampling (Redis-style).
    fn evict_if_needed(&self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            let victim = self
                .entries
                .iter()
                .take(Self::EVICTION_SAMPLE_SIZE)
                .min_by_key(|r| r.value().last_touched.load(Ordering::Relaxed))
                .map(|r| r.key().clone());

            match victim {
                Some(id) => {
                    if self.remove(&id).is_some() {
                        evicted += 1;
                        debug!(template_id = %id, "evicted template at entry ceiling");
                    }
                }
                None => break,
            }
        }
        evicted
    }
}
