//! Subscription filters and matching
//!
//! A filter is a conjunction of optional predicates; within a predicate
//! the listed alternatives combine as disjunction. `limit` is not a
//! match predicate; it only bounds historical backfill.

use crate::error::Reject;
use crate::types::Event;
use crate::wire::{de_opt_kinds_flex, de_opt_u64_flex, de_opt_usize_flex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A normalized filter. Built from [`FilterWire`] at ingress; every
/// later stage sees only this shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub kinds: Option<BTreeSet<u16>>,
    pub pubkey_prefixes: Option<Vec<Vec<u8>>>,
    /// Required (key, values) pairs: AND across keys, OR within a key
    pub tags: Option<BTreeMap<String, BTreeSet<String>>>,
    /// Closed lower bound on `created_at`
    pub since: Option<u64>,
    /// Closed upper bound on `created_at`
    pub until: Option<u64>,
    /// Maximum historical events returned during backfill
    pub limit: Option<usize>,
}

impl Filter {
    /// True iff every present predicate holds for the event.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(prefixes) = &self.pubkey_prefixes {
            if !prefixes.iter().any(|p| event.pubkey.0.starts_with(p)) {
                return false;
            }
        }
        if let Some(required) = &self.tags {
            for (key, wanted) in required {
                let hit = event
                    .tags
                    .iter()
                    .filter(|t| &t.key == key)
                    .any(|t| t.values.iter().any(|v| wanted.contains(v)));
                if !hit {
                    return false;
                }
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

/// Tag filters arrive either as a list of `[key, value]` pairs or as a
/// `{key: [values]}` mapping; both normalize to the same set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TagsWire {
    Map(BTreeMap<String, Vec<String>>),
    Pairs(Vec<Vec<String>>),
}

/// The filter as supplied on the wire, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterWire {
    #[serde(
        deserialize_with = "de_opt_kinds_flex",
        skip_serializing_if = "Option::is_none"
    )]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey_prefixes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagsWire>,
    #[serde(
        deserialize_with = "de_opt_u64_flex",
        skip_serializing_if = "Option::is_none"
    )]
    pub since: Option<u64>,
    #[serde(
        deserialize_with = "de_opt_u64_flex",
        skip_serializing_if = "Option::is_none"
    )]
    pub until: Option<u64>,
    #[serde(
        deserialize_with = "de_opt_usize_flex",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit: Option<usize>,
}

impl FilterWire {
    pub fn normalize(self) -> Result<Filter, Reject> {
        let kinds = self.kinds.map(|k| k.into_iter().collect::<BTreeSet<_>>());

        let pubkey_prefixes = match self.pubkey_prefixes {
            Some(raw) => {
                let mut out = Vec::with_capacity(raw.len());
                for s in raw {
                    let bytes = hex::decode(&s).map_err(|_| Reject::InvalidMessage)?;
                    if bytes.len() > 32 {
                        return Err(Reject::InvalidMessage);
                    }
                    out.push(bytes);
                }
                Some(out)
            }
            None => None,
        };

        let tags = match self.tags {
            Some(TagsWire::Map(map)) => {
                let mut out = BTreeMap::new();
                for (key, values) in map {
                    out.entry(key)
                        .or_insert_with(BTreeSet::new)
                        .extend(values);
                }
                Some(out)
            }
            Some(TagsWire::Pairs(pairs)) => {
                let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
                for pair in pairs {
                    let mut it = pair.into_iter();
                    let (key, value) = match (it.next(), it.next()) {
                        (Some(k), Some(v)) => (k, v),
                        _ => return Err(Reject::InvalidMessage),
                    };
                    out.entry(key).or_default().insert(value);
                }
                Some(out)
            }
            None => None,
        };

        Ok(Filter {
            kinds,
            pubkey_prefixes,
            tags,
            since: self.since,
            until: self.until,
            limit: self.limit,
        })
    }

    pub fn from_filter(filter: &Filter) -> Self {
        Self {
            kinds: filter.kinds.as_ref().map(|k| k.iter().copied().collect()),
            pubkey_prefixes: filter
                .pubkey_prefixes
                .as_ref()
                .map(|p| p.iter().map(hex::encode).collect()),
            tags: filter.tags.as_ref().map(|t| {
                TagsWire::Map(
                    t.iter()
                        .map(|(k, vs)| (k.clone(), vs.iter().cloned().collect()))
                        .collect(),
                )
            }),
            since: filter.since,
            until: filter.until,
            limit: filter.limit,
        }
    }
}
