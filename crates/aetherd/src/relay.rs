//! Relay core: Validator -> Store -> Dispatcher
//!
//! Every gateway funnels through [`Relay::publish`] and
//! [`Relay::subscribe`], so an event accepted on one surface is
//! dispatchable over all of them. Validation failures come back as
//! [`Reject`] values; duplicates (including replaceable-conflict
//! losers) acknowledge positively with reason `duplicate` and are
//! neither stored nor fanned out.

use crate::dispatch::{ConnId, Dispatcher};
use crate::outbox::Outbox;
use crate::store::{PutOutcome, Store, StoreError};
use aether_core::validate::Validator;
use aether_core::{Event, EventId, Filter, KindClass, Pubkey, Reject};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Relay clock: nanoseconds since the Unix epoch.
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// How an accepted event was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// Persisted and fanned out
    Stored,
    /// Displaced the previous incumbent for its replaceable key
    Replaced(EventId),
    /// Fanned out only (ephemeral kind)
    Ephemeral,
    /// Already known or lost the conflict rule; acknowledged, ignored
    Duplicate,
}

impl Acceptance {
    /// Reason string carried in the positive ack, when one applies.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Duplicate => Some("duplicate"),
            _ => None,
        }
    }

    pub fn dispatched(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub duplicates: AtomicU64,
    pub replaced: AtomicU64,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub replaced: u64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
        }
    }
}

struct RateLimitState {
    count: u32,
    window_start: Instant,
}

/// Fixed-window publish limiter keyed by publisher pubkey.
struct RateLimiter {
    windows: Mutex<HashMap<Pubkey, RateLimitState>>,
    events_per_minute: u32,
}

impl RateLimiter {
    fn new(events_per_minute: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            events_per_minute,
        }
    }

    fn check(&self, pubkey: &Pubkey) -> Result<(), Reject> {
        let now = Instant::now();
        let window = Duration::from_secs(60);

        let mut windows = self.windows.lock();
        let state = windows.entry(*pubkey).or_insert(RateLimitState {
            count: 0,
            window_start: now,
        });

        if now.duration_since(state.window_start) >= window {
            state.count = 0;
            state.window_start = now;
        }
        if state.count >= self.events_per_minute {
            return Err(Reject::RateLimited);
        }
        state.count += 1;
        Ok(())
    }
}

pub struct Relay {
    validator: Validator,
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    rate: Option<RateLimiter>,
    metrics: RelayMetrics,
    /// Accepted events are mirrored here for an external gossip overlay.
    forward_tx: broadcast::Sender<Arc<Event>>,
}

impl Relay {
    pub fn new(
        validator: Validator,
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        rate_limit_epm: u32,
    ) -> Self {
        let (forward_tx, _) = broadcast::channel(1024);
        Self {
            validator,
            store,
            dispatcher,
            rate: (rate_limit_epm > 0).then(|| RateLimiter::new(rate_limit_epm)),
            metrics: RelayMetrics::default(),
            forward_tx,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Tap of accepted (non-duplicate) events for mesh forwarding.
    pub fn subscribe_forward(&self) -> broadcast::Receiver<Arc<Event>> {
        self.forward_tx.subscribe()
    }

    /// Validate, persist per kind class, and fan out one event.
    pub fn publish(&self, event: Event) -> Result<Acceptance, Reject> {
        if let Some(rate) = &self.rate {
            if let Err(reject) = rate.check(&event.pubkey) {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(reject);
            }
        }

        if let Err(reject) = self.validator.validate(&event, unix_now_ns()) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(reject);
        }

        let outcome = self.store.put(&event).map_err(|e| {
            warn!("store error on put: {e}");
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            Reject::Internal(e.to_string())
        })?;

        let acceptance = match outcome {
            PutOutcome::Duplicate => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(Acceptance::Duplicate);
            }
            PutOutcome::Inserted => {
                if event.class() == Some(KindClass::Ephemeral) {
                    Acceptance::Ephemeral
                } else {
                    Acceptance::Stored
                }
            }
            PutOutcome::Replaced(old) => {
                self.metrics.replaced.fetch_add(1, Ordering::Relaxed);
                Acceptance::Replaced(old)
            }
        };
        self.metrics.accepted.fetch_add(1, Ordering::Relaxed);

        let event = Arc::new(event);
        let matched = self.dispatcher.dispatch(&event);
        debug!(event_id = %event.event_id, kind = event.kind, matched, "accepted");
        let _ = self.forward_tx.send(event);

        Ok(acceptance)
    }

    /// Register a subscription and return its outbox together with the
    /// historical backfill (newest first). Registration happens before
    /// the query, so nothing is lost in between; the at-least-once
    /// contract tolerates the rare duplicate that ordering allows.
    pub fn subscribe(
        &self,
        conn: ConnId,
        sub_id: impl Into<String>,
        filters: Vec<Filter>,
        capacity: Option<usize>,
    ) -> Result<(Arc<Outbox>, Vec<Event>), Reject> {
        let sub_id = sub_id.into();
        let outbox = self
            .dispatcher
            .register(conn, sub_id.clone(), filters.clone(), capacity);
        let backfill = self.backfill(&filters)?;

        debug!(%conn, %sub_id, backfill = backfill.len(), "subscribed");
        Ok((outbox, backfill))
    }

    /// Historical events for a filter set: per-filter query results
    /// merged, deduped by id, newest first.
    pub fn backfill(&self, filters: &[Filter]) -> Result<Vec<Event>, Reject> {
        let mut backfill = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for filter in filters {
            let found = self.store.query(filter).map_err(|e: StoreError| {
                warn!("store error on query: {e}");
                Reject::Internal(e.to_string())
            })?;
            for event in found {
                if seen.insert(event.event_id) {
                    backfill.push(event);
                }
            }
        }
        backfill.sort_by(|a, b| (b.created_at, &b.event_id.0).cmp(&(a.created_at, &a.event_id.0)));
        Ok(backfill)
    }

    pub fn unsubscribe(&self, conn: ConnId, sub_id: &str) -> Result<(), Reject> {
        if self.dispatcher.unregister(conn, sub_id) {
            Ok(())
        } else {
            Err(Reject::SubscriptionNotFound)
        }
    }

    /// Connection teardown: revoke every owned subscription.
    pub fn drop_conn(&self, conn: ConnId) {
        self.dispatcher.drop_conn(conn);
    }

    pub fn gc(&self) -> Result<usize, StoreError> {
        self.store.gc(unix_now_ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use aether_core::crypto::KeyPair;
    use aether_core::validate::ValidatorConfig;
    use aether_core::{FilterWire, Tag};

    fn relay() -> Relay {
        relay_with_rate(0)
    }

    fn relay_with_rate(epm: u32) -> Relay {
        Relay::new(
            Validator::new(ValidatorConfig::default()),
            Arc::new(MemoryStore::new(0)),
            Arc::new(Dispatcher::new(16)),
            epm,
        )
    }

    fn filter(json: &str) -> Filter {
        serde_json::from_str::<FilterWire>(json)
            .unwrap()
            .normalize()
            .unwrap()
    }

    fn now() -> u64 {
        unix_now_ns()
    }

    #[test]
    fn resubmission_is_acked_as_duplicate_without_fanout() {
        let relay = relay();
        let conn = ConnId::next();
        let (outbox, _) = relay
            .subscribe(conn, "s", vec![filter(r#"{"kinds": [1]}"#)], None)
            .unwrap();

        let kp = KeyPair::from_seed(&[1; 32]);
        let event = kp.sign_event(now(), 1, vec![], b"once".to_vec());

        assert_eq!(relay.publish(event.clone()).unwrap(), Acceptance::Stored);
        assert_eq!(relay.publish(event).unwrap(), Acceptance::Duplicate);

        // Exactly one delivery, and the store is unchanged.
        assert_eq!(outbox.stats().depth, 1);
        assert_eq!(relay.store().event_count(), 1);
        assert_eq!(relay.metrics().snapshot().duplicates, 1);
    }

    #[test]
    fn replaceable_loser_is_not_dispatched() {
        let relay = relay();
        let conn = ConnId::next();
        let (outbox, _) = relay
            .subscribe(conn, "s", vec![filter(r#"{"kinds": [10001]}"#)], None)
            .unwrap();

        let kp = KeyPair::from_seed(&[2; 32]);
        let t = now();
        let mut a = kp.sign_event(t, 10001, vec![], b"a".to_vec());
        let mut b = kp.sign_event(t, 10001, vec![], b"b".to_vec());
        if a.event_id > b.event_id {
            std::mem::swap(&mut a, &mut b);
        }

        assert_eq!(relay.publish(b.clone()).unwrap(), Acceptance::Stored);
        assert_eq!(relay.publish(a).unwrap(), Acceptance::Duplicate);
        assert_eq!(outbox.stats().depth, 1);

        let found = relay.store().query(&filter(r#"{"kinds": [10001]}"#)).unwrap();
        assert_eq!(found, vec![b]);
    }

    #[test]
    fn ephemeral_fan_out_leaves_no_backfill() {
        let relay = relay();
        let conn = ConnId::next();
        let (outbox, backfill) = relay
            .subscribe(conn, "s", vec![filter(r#"{"kinds": [29999]}"#)], None)
            .unwrap();
        assert!(backfill.is_empty());

        let kp = KeyPair::from_seed(&[3; 32]);
        let event = kp.sign_event(now(), 29999, vec![], b"flash".to_vec());
        assert_eq!(relay.publish(event).unwrap(), Acceptance::Ephemeral);
        assert_eq!(outbox.stats().depth, 1);

        // Resubscription sees nothing: the store kept no trace.
        let (_, backfill) = relay
            .subscribe(conn, "again", vec![filter(r#"{"kinds": [29999]}"#)], None)
            .unwrap();
        assert!(backfill.is_empty());
        assert_eq!(relay.store().event_count(), 0);
    }

    #[test]
    fn invalid_events_are_rejected_not_stored() {
        let relay = relay();
        let kp = KeyPair::from_seed(&[4; 32]);
        let mut event = kp.sign_event(now(), 1, vec![], b"x".to_vec());
        event.sig.0[0] ^= 1;

        assert_eq!(relay.publish(event), Err(Reject::InvalidSignature));
        assert_eq!(relay.store().event_count(), 0);
        assert_eq!(relay.metrics().snapshot().rejected, 1);
    }

    #[test]
    fn backfill_merges_filters_and_dedupes() {
        let relay = relay();
        let kp = KeyPair::from_seed(&[5; 32]);
        let tagged = kp.sign_event(
            now(),
            1,
            vec![Tag::new("c", vec!["vision".into()])],
            b"t".to_vec(),
        );
        relay.publish(tagged.clone()).unwrap();

        // Both filters match the same event; it appears once.
        let (_, backfill) = relay
            .subscribe(
                ConnId::next(),
                "s",
                vec![
                    filter(r#"{"kinds": [1]}"#),
                    filter(r#"{"tags": {"c": ["vision"]}}"#),
                ],
                None,
            )
            .unwrap();
        assert_eq!(backfill, vec![tagged]);
    }

    #[test]
    fn unsubscribe_unknown_is_an_error() {
        let relay = relay();
        assert_eq!(
            relay.unsubscribe(ConnId::next(), "ghost"),
            Err(Reject::SubscriptionNotFound)
        );
    }

    #[test]
    fn rate_limit_applies_per_pubkey() {
        let relay = relay_with_rate(2);
        let kp = KeyPair::from_seed(&[6; 32]);
        let other = KeyPair::from_seed(&[7; 32]);

        for i in 0..2u64 {
            let event = kp.sign_event(now() + i, 1, vec![], vec![]);
            assert!(relay.publish(event).is_ok());
        }
        let third = kp.sign_event(now() + 9, 1, vec![], vec![]);
        assert_eq!(relay.publish(third), Err(Reject::RateLimited));

        // A different publisher is unaffected.
        let theirs = other.sign_event(now(), 1, vec![], vec![]);
        assert!(relay.publish(theirs).is_ok());
    }

    #[test]
    fn forward_hook_sees_accepted_events() {
        let relay = relay();
        let mut tap = relay.subscribe_forward();

        let kp = KeyPair::from_seed(&[8; 32]);
        let event = kp.sign_event(now(), 1, vec![], b"mesh".to_vec());
        relay.publish(event.clone()).unwrap();
        relay.publish(event.clone()).unwrap(); // duplicate: not forwarded

        assert_eq!(tap.try_recv().unwrap().event_id, event.event_id);
        assert!(tap.try_recv().is_err());
    }
}
