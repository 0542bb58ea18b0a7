//! In-memory store
//!
//! One mutex over the whole state keeps `put` linearizable per
//! replaceable key. Secondary maps mirror the required indexes: time
//! order, kind, tag pair, and the two replaceable-key maps.

use super::{sort_backfill, PutOutcome, Store, StoreError};
use aether_core::{supersedes, Event, EventId, Filter, KindClass, Pubkey};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct Inner {
    events: HashMap<EventId, Event>,
    by_created: BTreeSet<(u64, EventId)>,
    by_kind: HashMap<u16, BTreeSet<(u64, EventId)>>,
    by_tag: HashMap<(String, String), BTreeSet<EventId>>,
    replaceable: HashMap<(Pubkey, u16), EventId>,
    parameterized: HashMap<(Pubkey, u16, String), EventId>,
}

impl Inner {
    fn index(&mut self, event: &Event) {
        let entry = (event.created_at, event.event_id);
        self.by_created.insert(entry);
        self.by_kind.entry(event.kind).or_default().insert(entry);
        for (k, v) in event.tag_pairs() {
            self.by_tag
                .entry((k.to_owned(), v.to_owned()))
                .or_default()
                .insert(event.event_id);
        }
        self.events.insert(event.event_id, event.clone());
    }

    fn deindex(&mut self, event: &Event) {
        let entry = (event.created_at, event.event_id);
        self.by_created.remove(&entry);
        if let Some(set) = self.by_kind.get_mut(&event.kind) {
            set.remove(&entry);
            if set.is_empty() {
                self.by_kind.remove(&event.kind);
            }
        }
        for (k, v) in event.tag_pairs() {
            if let Some(set) = self.by_tag.get_mut(&(k.to_owned(), v.to_owned())) {
                set.remove(&event.event_id);
                if set.is_empty() {
                    self.by_tag.remove(&(k.to_owned(), v.to_owned()));
                }
            }
        }
        self.events.remove(&event.event_id);
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    ttl_ns: u64,
}

impl MemoryStore {
    /// `ttl_ns` of 0 keeps immutable events forever.
    pub fn new(ttl_ns: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl_ns,
        }
    }

    fn put_replaceable(
        inner: &mut Inner,
        event: &Event,
        incumbent: Option<EventId>,
    ) -> PutOutcome {
        match incumbent.and_then(|id| inner.events.get(&id).cloned()) {
            None => {
                inner.index(event);
                PutOutcome::Inserted
            }
            Some(old) => {
                if supersedes(event, &old) {
                    inner.deindex(&old);
                    inner.index(event);
                    PutOutcome::Replaced(old.event_id)
                } else {
                    PutOutcome::Duplicate
                }
            }
        }
    }
}

impl Store for MemoryStore {
    fn put(&self, event: &Event) -> Result<PutOutcome, StoreError> {
        let class = event
            .class()
            .ok_or(StoreError::UnclassifiedKind(event.kind))?;
        let mut inner = self.inner.lock();

        if inner.events.contains_key(&event.event_id) {
            return Ok(PutOutcome::Duplicate);
        }

        Ok(match class {
            KindClass::Ephemeral => PutOutcome::Inserted,
            KindClass::Immutable => {
                inner.index(event);
                PutOutcome::Inserted
            }
            KindClass::Replaceable => {
                let key = (event.pubkey, event.kind);
                let incumbent = inner.replaceable.get(&key).copied();
                let outcome = Self::put_replaceable(&mut inner, event, incumbent);
                if !matches!(outcome, PutOutcome::Duplicate) {
                    inner.replaceable.insert(key, event.event_id);
                }
                outcome
            }
            KindClass::ParameterizedReplaceable => {
                let key = (event.pubkey, event.kind, event.d_value().to_owned());
                let incumbent = inner.parameterized.get(&key).copied();
                let outcome = Self::put_replaceable(&mut inner, event, incumbent);
                if !matches!(outcome, PutOutcome::Duplicate) {
                    inner.parameterized.insert(key, event.event_id);
                }
                outcome
            }
        })
    }

    fn get(&self, event_id: &EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.inner.lock().events.get(event_id).cloned())
    }

    fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        // Narrow the scan with the kind index when possible; the filter
        // itself stays authoritative.
        match &filter.kinds {
            Some(kinds) => {
                let mut candidates: Vec<(u64, EventId)> = kinds
                    .iter()
                    .filter_map(|k| inner.by_kind.get(k))
                    .flat_map(|set| set.iter().copied())
                    .collect();
                candidates.sort_unstable_by(|a, b| b.cmp(a));
                for (_, id) in candidates {
                    if out.len() >= limit {
                        break;
                    }
                    if let Some(event) = inner.events.get(&id) {
                        if filter.matches(event) {
                            out.push(event.clone());
                        }
                    }
                }
            }
            None => {
                for (_, id) in inner.by_created.iter().rev() {
                    if out.len() >= limit {
                        break;
                    }
                    if let Some(event) = inner.events.get(id) {
                        if filter.matches(event) {
                            out.push(event.clone());
                        }
                    }
                }
            }
        }

        sort_backfill(&mut out);
        Ok(out)
    }

    fn gc(&self, now_ns: u64) -> Result<usize, StoreError> {
        if self.ttl_ns == 0 {
            return Ok(0);
        }
        let cutoff = now_ns.saturating_sub(self.ttl_ns);
        let mut inner = self.inner.lock();

        let expired: Vec<Event> = inner
            .by_created
            .iter()
            .take_while(|(created, _)| *created < cutoff)
            .filter_map(|(_, id)| inner.events.get(id))
            .filter(|e| e.class() == Some(KindClass::Immutable))
            .cloned()
            .collect();
        for event in &expired {
            inner.deindex(event);
        }
        Ok(expired.len())
    }

    fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    const TTL: u64 = 1_000_000;

    fn store() -> MemoryStore {
        MemoryStore::new(TTL)
    }

    #[test]
    fn immutable_put_and_dedupe() {
        contract::immutable_put_and_dedupe(&store());
    }

    #[test]
    fn replaceable_conflict() {
        contract::replaceable_conflict(&store());
    }

    #[test]
    fn parameterized_replacement() {
        contract::parameterized_replacement(&store());
    }

    #[test]
    fn ephemeral_leaves_no_trace() {
        contract::ephemeral_leaves_no_trace(&store());
    }

    #[test]
    fn query_order_and_limit() {
        contract::query_order_and_limit(&store());
    }

    #[test]
    fn query_ties_break_on_id() {
        contract::query_ties_break_on_id(&store());
    }

    #[test]
    fn query_by_tag() {
        contract::query_by_tag(&store());
    }

    #[test]
    fn gc_expires_only_immutable() {
        contract::gc_expires_only_immutable(&store(), TTL);
    }

    #[test]
    fn concurrent_writers_converge_on_one_winner() {
        use aether_core::crypto::KeyPair;
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new(0));
        let kp = KeyPair::from_seed(&[9; 32]);
        let events: Vec<Event> = (0..16u64)
            .map(|i| kp.sign_event(100, 10001, vec![], vec![i as u8]))
            .collect();
        let winner = events
            .iter()
            .max_by(|a, b| (a.created_at, a.event_id).cmp(&(b.created_at, b.event_id)))
            .cloned()
            .unwrap();

        let handles: Vec<_> = events
            .into_iter()
            .map(|event| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.put(&event).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.event_count(), 1);
        assert_eq!(store.get(&winner.event_id).unwrap().unwrap(), winner);
    }
}
