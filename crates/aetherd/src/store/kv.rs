//! Embedded KV store on sled
//!
//! A single tree holds every record under key-prefix namespaces, so one
//! sled transaction covers the event body and all of its index entries;
//! after a crash either the whole put is visible or none of it.
//!
//! Key layout (all integers big-endian so range scans sort by time):
//!   e <id>                      -> postcard(Event)
//!   c <created> <id>            -> []          time order
//!   k <kind> <created> <id>     -> []          kind + time order
//!   t <key> 00 <value> 00 <id>  -> []          tag pairs
//!   r <pubkey> <kind>           -> id          replaceable incumbent
//!   p <pubkey> <kind> <d-value> -> id          parameterized incumbent

use super::{sort_backfill, PutOutcome, Store, StoreError};
use aether_core::{supersedes, Event, EventId, Filter, KindClass};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::path::Path;

fn event_key(id: &EventId) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'e');
    key.extend_from_slice(&id.0);
    key
}

fn created_key(event: &Event) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'c');
    key.extend_from_slice(&event.created_at.to_be_bytes());
    key.extend_from_slice(&event.event_id.0);
    key
}

fn kind_key(event: &Event) -> Vec<u8> {
    let mut key = Vec::with_capacity(43);
    key.push(b'k');
    key.extend_from_slice(&event.kind.to_be_bytes());
    key.extend_from_slice(&event.created_at.to_be_bytes());
    key.extend_from_slice(&event.event_id.0);
    key
}

fn tag_keys(event: &Event) -> Vec<Vec<u8>> {
    event
        .tag_pairs()
        .map(|(k, v)| {
            let mut key = Vec::with_capacity(3 + k.len() + v.len() + 32);
            key.push(b't');
            key.extend_from_slice(k.as_bytes());
            key.push(0);
            key.extend_from_slice(v.as_bytes());
            key.push(0);
            key.extend_from_slice(&event.event_id.0);
            key
        })
        .collect()
}

fn slot_key(event: &Event, class: KindClass) -> Option<Vec<u8>> {
    match class {
        KindClass::Replaceable => {
            let mut key = Vec::with_capacity(35);
            key.push(b'r');
            key.extend_from_slice(&event.pubkey.0);
            key.extend_from_slice(&event.kind.to_be_bytes());
            Some(key)
        }
        KindClass::ParameterizedReplaceable => {
            let d = event.d_value();
            let mut key = Vec::with_capacity(35 + d.len());
            key.push(b'p');
            key.extend_from_slice(&event.pubkey.0);
            key.extend_from_slice(&event.kind.to_be_bytes());
            key.extend_from_slice(d.as_bytes());
            Some(key)
        }
        _ => None,
    }
}

const EMPTY: &[u8] = &[];

type TxError = ConflictableTransactionError<StoreError>;

fn abort(err: StoreError) -> TxError {
    ConflictableTransactionError::Abort(err)
}

fn tx_insert(tree: &TransactionalTree, event: &Event) -> Result<(), TxError> {
    let body = postcard::to_allocvec(event).map_err(|e| abort(e.into()))?;
    tree.insert(event_key(&event.event_id), body)?;
    tree.insert(created_key(event), EMPTY)?;
    tree.insert(kind_key(event), EMPTY)?;
    for key in tag_keys(event) {
        tree.insert(key, EMPTY)?;
    }
    Ok(())
}

fn tx_remove(tree: &TransactionalTree, event: &Event) -> Result<(), TxError> {
    tree.remove(event_key(&event.event_id))?;
    tree.remove(created_key(event))?;
    tree.remove(kind_key(event))?;
    for key in tag_keys(event) {
        tree.remove(key)?;
    }
    Ok(())
}

pub struct KvStore {
    db: sled::Db,
    tree: sled::Tree,
    ttl_ns: u64,
}

impl KvStore {
    pub fn open(path: &Path, ttl_ns: u64) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("relay")?;
        Ok(Self { db, tree, ttl_ns })
    }

    fn decode_event(bytes: &[u8]) -> Result<Event, StoreError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn get_by_id_bytes(&self, id: &[u8]) -> Result<Option<Event>, StoreError> {
        let mut key = Vec::with_capacity(33);
        key.push(b'e');
        key.extend_from_slice(id);
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(Self::decode_event(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove one stored event and all of its index entries atomically.
    fn remove_event(&self, event: &Event) -> Result<(), StoreError> {
        let result = self.tree.transaction(|tx| {
            tx_remove(tx, event)?;
            Ok(())
        });
        flatten_tx(result)
    }
}

fn flatten_tx<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match result {
        Ok(v) => Ok(v),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

impl Store for KvStore {
    fn put(&self, event: &Event) -> Result<PutOutcome, StoreError> {
        let class = event
            .class()
            .ok_or(StoreError::UnclassifiedKind(event.kind))?;

        if class == KindClass::Ephemeral {
            // Never persisted; dedupe cannot apply without a trace.
            return Ok(PutOutcome::Inserted);
        }

        let result = self.tree.transaction(|tx| {
            if tx.get(event_key(&event.event_id))?.is_some() {
                return Ok(PutOutcome::Duplicate);
            }

            let Some(slot) = slot_key(event, class) else {
                tx_insert(tx, event)?;
                return Ok(PutOutcome::Inserted);
            };

            match tx.get(&slot)? {
                None => {
                    tx_insert(tx, event)?;
                    tx.insert(slot, &event.event_id.0[..])?;
                    Ok(PutOutcome::Inserted)
                }
                Some(old_id_bytes) => {
                    let old_id = EventId(
                        <[u8; 32]>::try_from(old_id_bytes.as_ref())
                            .map_err(|_| abort(StoreError::Corrupt("slot id width".into())))?,
                    );
                    let old_bytes = tx
                        .get(event_key(&old_id))?
                        .ok_or_else(|| abort(StoreError::Corrupt("dangling slot".into())))?;
                    let old = postcard::from_bytes::<Event>(&old_bytes)
                        .map_err(|e| abort(e.into()))?;

                    if supersedes(event, &old) {
                        tx_remove(tx, &old)?;
                        tx_insert(tx, event)?;
                        tx.insert(slot, &event.event_id.0[..])?;
                        Ok(PutOutcome::Replaced(old_id))
                    } else {
                        Ok(PutOutcome::Duplicate)
                    }
                }
            }
        });
        flatten_tx(result)
    }

    fn get(&self, event_id: &EventId) -> Result<Option<Event>, StoreError> {
        self.get_by_id_bytes(&event_id.0)
    }

    fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        match &filter.kinds {
            Some(kinds) => {
                // Per-kind scans come back time-ascending; gather, then
                // sort across kinds.
                let mut candidates = Vec::new();
                for kind in kinds {
                    let mut prefix = vec![b'k'];
                    prefix.extend_from_slice(&kind.to_be_bytes());
                    for entry in self.tree.scan_prefix(&prefix) {
                        let (key, _) = entry?;
                        candidates.push(key[key.len() - 32..].to_vec());
                    }
                }
                for id in candidates {
                    if let Some(event) = self.get_by_id_bytes(&id)? {
                        if filter.matches(&event) {
                            out.push(event);
                        }
                    }
                }
            }
            None => {
                for entry in self.tree.scan_prefix([b'c']).rev() {
                    let (key, _) = entry?;
                    if let Some(event) = self.get_by_id_bytes(&key[key.len() - 32..])? {
                        if filter.matches(&event) {
                            out.push(event);
                        }
                    }
                    if out.len() >= limit {
                        break;
                    }
                }
            }
        }

        sort_backfill(&mut out);
        out.truncate(limit);
        Ok(out)
    }

    fn gc(&self, now_ns: u64) -> Result<usize, StoreError> {
        if self.ttl_ns == 0 {
            return Ok(0);
        }
        let cutoff = now_ns.saturating_sub(self.ttl_ns);

        let mut expired = Vec::new();
        for entry in self.tree.scan_prefix([b'c']) {
            let (key, _) = entry?;
            let mut created_bytes = [0u8; 8];
            created_bytes.copy_from_slice(&key[1..9]);
            if u64::from_be_bytes(created_bytes) >= cutoff {
                break;
            }
            if let Some(event) = self.get_by_id_bytes(&key[key.len() - 32..])? {
                if event.class() == Some(KindClass::Immutable) {
                    expired.push(event);
                }
            }
        }
        for event in &expired {
            self.remove_event(event)?;
        }
        Ok(expired.len())
    }

    fn event_count(&self) -> usize {
        self.tree.scan_prefix([b'e']).count()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use tempfile::tempdir;

    const TTL: u64 = 1_000_000;

    fn store() -> (KvStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (KvStore::open(dir.path(), TTL).unwrap(), dir)
    }

    #[test]
    fn immutable_put_and_dedupe() {
        let (store, _dir) = store();
        contract::immutable_put_and_dedupe(&store);
    }

    #[test]
    fn replaceable_conflict() {
        let (store, _dir) = store();
        contract::replaceable_conflict(&store);
    }

    #[test]
    fn parameterized_replacement() {
        let (store, _dir) = store();
        contract::parameterized_replacement(&store);
    }

    #[test]
    fn ephemeral_leaves_no_trace() {
        let (store, _dir) = store();
        contract::ephemeral_leaves_no_trace(&store);
    }

    #[test]
    fn query_order_and_limit() {
        let (store, _dir) = store();
        contract::query_order_and_limit(&store);
    }

    #[test]
    fn query_ties_break_on_id() {
        let (store, _dir) = store();
        contract::query_ties_break_on_id(&store);
    }

    #[test]
    fn query_by_tag() {
        let (store, _dir) = store();
        contract::query_by_tag(&store);
    }

    #[test]
    fn gc_expires_only_immutable() {
        let (store, _dir) = store();
        contract::gc_expires_only_immutable(&store, TTL);
    }

    #[test]
    fn state_survives_reopen() {
        use aether_core::crypto::KeyPair;

        let dir = tempdir().unwrap();
        let kp = KeyPair::from_seed(&[11; 32]);
        let event = kp.sign_event(1, 1, vec![], b"durable".to_vec());

        {
            let store = KvStore::open(dir.path(), TTL).unwrap();
            store.put(&event).unwrap();
            store.flush().unwrap();
        }

        let store = KvStore::open(dir.path(), TTL).unwrap();
        assert_eq!(store.get(&event.event_id).unwrap().unwrap(), event);
    }
}
