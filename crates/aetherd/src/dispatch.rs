//! Subscription registry and fan-out
//!
//! Candidate selection goes through an inverted index (kind, tag pair,
//! pubkey first byte); the filter itself is then evaluated
//! authoritatively, so a stale or over-broad index entry can never
//! cause a wrong delivery, only a wasted check. Each subscription is
//! indexed under its most selective predicate; subscriptions with no
//! indexable predicate fan out on every event.

use crate::outbox::{Outbox, OutboxStats};
use aether_core::{Event, Filter};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection identity across every gateway surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// (connection, connection-local id) names a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub conn: ConnId,
    pub id: String,
}

pub struct Subscription {
    pub key: SubKey,
    pub filters: Vec<Filter>,
    pub outbox: Arc<Outbox>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}

#[derive(Clone, Debug)]
pub struct SubscriptionStats {
    pub conn: ConnId,
    pub sub_id: String,
    pub stats: OutboxStats,
}

#[derive(Default)]
struct FilterIndex {
    by_kind: HashMap<u16, HashSet<SubKey>>,
    by_tag: HashMap<(String, String), HashSet<SubKey>>,
    by_prefix_byte: HashMap<u8, HashSet<SubKey>>,
    unindexed: HashSet<SubKey>,
}

impl FilterIndex {
    fn insert(&mut self, key: &SubKey, filters: &[Filter]) {
        for filter in filters {
            self.insert_one(key, filter);
        }
        if filters.is_empty() {
            // Nothing can match, but the key must be removable later.
            self.unindexed.insert(key.clone());
        }
    }

    fn insert_one(&mut self, key: &SubKey, filter: &Filter) {
        if let Some(kinds) = &filter.kinds {
            for kind in kinds {
                self.by_kind.entry(*kind).or_default().insert(key.clone());
            }
            return;
        }
        if let Some(tags) = &filter.tags {
            if let Some((tag_key, values)) = tags.iter().next() {
                for value in values {
                    self.by_tag
                        .entry((tag_key.clone(), value.clone()))
                        .or_default()
                        .insert(key.clone());
                }
                return;
            }
        }
        if let Some(prefixes) = &filter.pubkey_prefixes {
            if !prefixes.is_empty() && prefixes.iter().all(|p| !p.is_empty()) {
                for prefix in prefixes {
                    self.by_prefix_byte
                        .entry(prefix[0])
                        .or_default()
                        .insert(key.clone());
                }
                return;
            }
        }
        self.unindexed.insert(key.clone());
    }

    fn remove(&mut self, key: &SubKey) {
        self.by_kind.retain(|_, set| {
            set.remove(key);
            !set.is_empty()
        });
        self.by_tag.retain(|_, set| {
            set.remove(key);
            !set.is_empty()
        });
        self.by_prefix_byte.retain(|_, set| {
            set.remove(key);
            !set.is_empty()
        });
        self.unindexed.remove(key);
    }

    fn candidates(&self, event: &Event) -> HashSet<SubKey> {
        let mut out: HashSet<SubKey> = self.unindexed.iter().cloned().collect();
        if let Some(set) = self.by_kind.get(&event.kind) {
            out.extend(set.iter().cloned());
        }
        for (k, v) in event.tag_pairs() {
            if let Some(set) = self.by_tag.get(&(k.to_owned(), v.to_owned())) {
                out.extend(set.iter().cloned());
            }
        }
        if let Some(set) = self.by_prefix_byte.get(&event.pubkey.0[0]) {
            out.extend(set.iter().cloned());
        }
        out
    }
}

pub struct Dispatcher {
    subs: RwLock<HashMap<SubKey, Arc<Subscription>>>,
    index: RwLock<FilterIndex>,
    default_capacity: usize,
}

impl Dispatcher {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            index: RwLock::new(FilterIndex::default()),
            default_capacity,
        }
    }

    /// Register (or replace) a subscription; returns its outbox.
    pub fn register(
        &self,
        conn: ConnId,
        sub_id: impl Into<String>,
        filters: Vec<Filter>,
        capacity: Option<usize>,
    ) -> Arc<Outbox> {
        let key = SubKey {
            conn,
            id: sub_id.into(),
        };
        let outbox = Outbox::new(capacity.unwrap_or(self.default_capacity));
        let sub = Arc::new(Subscription {
            key: key.clone(),
            filters,
            outbox: outbox.clone(),
        });

        let mut subs = self.subs.write();
        let mut index = self.index.write();
        if let Some(old) = subs.insert(key.clone(), sub.clone()) {
            old.outbox.close();
            index.remove(&key);
        }
        index.insert(&key, &sub.filters);
        outbox
    }

    pub fn unregister(&self, conn: ConnId, sub_id: &str) -> bool {
        let key = SubKey {
            conn,
            id: sub_id.to_owned(),
        };
        let mut subs = self.subs.write();
        match subs.remove(&key) {
            Some(sub) => {
                sub.outbox.close();
                self.index.write().remove(&key);
                true
            }
            None => false,
        }
    }

    /// Revoke every subscription a connection owns.
    pub fn drop_conn(&self, conn: ConnId) {
        let mut subs = self.subs.write();
        let keys: Vec<SubKey> = subs.keys().filter(|k| k.conn == conn).cloned().collect();
        let mut index = self.index.write();
        for key in keys {
            if let Some(sub) = subs.remove(&key) {
                sub.outbox.close();
            }
            index.remove(&key);
        }
    }

    pub fn get(&self, conn: ConnId, sub_id: &str) -> Option<Arc<Subscription>> {
        self.subs
            .read()
            .get(&SubKey {
                conn,
                id: sub_id.to_owned(),
            })
            .cloned()
    }

    /// Fan an accepted event out to every matching subscription; returns
    /// the number of deliveries enqueued.
    pub fn dispatch(&self, event: &Arc<Event>) -> usize {
        let candidates = self.index.read().candidates(event);
        if candidates.is_empty() {
            return 0;
        }

        let subs = self.subs.read();
        let mut matched = 0;
        for key in candidates {
            if let Some(sub) = subs.get(&key) {
                if sub.matches(event) {
                    sub.outbox.push(event.clone());
                    matched += 1;
                }
            }
        }
        matched
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.read().len()
    }

    pub fn subscription_stats(&self) -> Vec<SubscriptionStats> {
        self.subs
            .read()
            .values()
            .map(|sub| SubscriptionStats {
                conn: sub.key.conn,
                sub_id: sub.key.id.clone(),
                stats: sub.outbox.stats(),
            })
            .collect()
    }
}
