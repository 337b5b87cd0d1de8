use serde::Serialize;
use tracing::info;

use crate::cache::CacheTier;

/// Counters for one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Queries answered to the learner, replayed ones included.
    pub queries: u64,
    /// Queries run against the live peers.
    pub executed: u64,
    pub exact_hits: u64,
    pub fast_path_hits: u64,
    pub plaid_hits: u64,
    /// Stored records answered again on resume.
    pub replayed: u64,
    /// Stored records cached without being asked for.
    pub cached_only: u64,
}

impl EngineStats {
    pub fn record_hit(&mut self, tier: CacheTier) {
        match tier {
            CacheTier::Exact => self.exact_hits += 1,
            CacheTier::FastPath => self.fast_path_hits += 1,
            CacheTier::Plaid => self.plaid_hits += 1,
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.exact_hits + self.fast_path_hits + self.plaid_hits
    }

    pub fn log_summary(&self) {
        info!(
            queries = self.queries,
            executed = self.executed,
            exact = self.exact_hits,
            fast_path = self.fast_path_hits,
            plaid = self.plaid_hits,
            replayed = self.replayed,
            cached_only = self.cached_only,
            "engine statistics"
        );
    }
}
