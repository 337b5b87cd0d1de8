//! Answers repeated and predictable queries without touching the peers.
//!
//! Three tiers, consulted in order:
//!
//! 1. exact: every recorded query and each of its proper prefixes
//! 2. fast path: a query whose prefix is known to end in an absorbing
//!    sentinel is answered by padding with that sentinel
//! 3. plaid: queries whose fuzz digests are equal are assumed to leave
//!    the peers in the same state, so a prefix can be swapped for an
//!    equivalent one and the result looked up in tiers 1 and 2
//!
//! Tier 3 is a heuristic. Equal digests do not prove equal behaviour.

use std::collections::{BTreeSet, HashMap};

use mitmlearn_alphabet::{Query, Response, Sentinel};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub fast_path: bool,
    pub plaid: bool,
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Exact,
    FastPath,
    Plaid,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    config: CacheConfig,
    exact: HashMap<String, Response>,
    fast_path: HashMap<String, (Response, Sentinel)>,
    digest_of: HashMap<String, String>,
    equivalent: HashMap<String, BTreeSet<String>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn lookup(&self, query: &Query) -> Option<(Response, CacheTier)> {
        if let Some(hit) = self.lookup_direct(query) {
            return Some(hit);
        }
        if self.config.plaid {
            return self
                .lookup_equivalent(query)
                .map(|response| (response, CacheTier::Plaid));
        }
        None
    }

    fn lookup_direct(&self, query: &Query) -> Option<(Response, CacheTier)> {
        if let Some(response) = self.exact.get(&query.key()) {
            return Some((response.clone(), CacheTier::Exact));
        }
        if self.config.fast_path {
            for cut in 1..query.len() {
                let keep = query.len() - cut;
                if let Some((response, sentinel)) = self.fast_path.get(&query.prefix(keep).key()) {
                    let padded = response.clone().padded(*sentinel, query.len());
                    return Some((padded, CacheTier::FastPath));
                }
            }
        }
        None
    }

    fn lookup_equivalent(&self, query: &Query) -> Option<Response> {
        for cut in 1..query.len() {
            let keep = query.len() - cut;
            let prefix = query.prefix(keep).key();
            let Some(digest) = self.digest_of.get(&prefix) else {
                continue;
            };
            let Some(class) = self.equivalent.get(digest) else {
                continue;
            };
            let tail = query.suffix(cut);
            for other in class.iter().filter(|other| **other != prefix) {
                let Ok(other) = other.parse::<Query>() else {
                    continue;
                };
                let candidate = other.concat(&tail);
                if candidate.len() != query.len() {
                    continue;
                }
                if let Some((response, _)) = self.lookup_direct(&candidate) {
                    return Some(response);
                }
            }
        }
        None
    }

    /// Remember `response` for `query`. `digest` may be empty.
    /// Responses without exactly one element per action are dropped.
    pub fn record(&mut self, query: &Query, response: &Response, digest: &str) {
        if response.len() != query.len() {
            warn!(
                query = %query,
                response = %response,
                "response length does not match query, not caching"
            );
            return;
        }
        for n in 1..=query.len() {
            self.exact
                .insert(query.prefix(n).key(), response.prefix(n));
        }

        if self.config.fast_path {
            if let Some((i, sentinel)) = response.first_absorption() {
                if i < query.len() {
                    self.fast_path.insert(
                        query.prefix(i + 1).key(),
                        (response.prefix(i + 1), sentinel),
                    );
                }
            }
        }

        if self.config.plaid && !digest.is_empty() {
            let key = query.key();
            self.digest_of.insert(key.clone(), digest.to_string());
            self.equivalent
                .entry(digest.to_string())
                .or_default()
                .insert(key);
        }
    }
}
