//! Query execution and caching engine for mitm-based automata learning.
//!
//! A [`LearningEngine`] takes queries from a [`Learner`], answers them from
//! the [`QueryCache`] when it can, runs them against the live peers
//! otherwise, and appends every answer to the [`SessionLog`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod learner;
pub mod limits;
pub mod log;
pub mod stats;

pub use cache::{CacheConfig, CacheTier, QueryCache};
pub use config::{ConfigError, EngineConfig, InterceptionPointConfig};
pub use engine::{EngineError, LearningEngine};
pub use learner::{Learner, LearnerError, ReplayLearner, TcpLearner};
pub use limits::{HostProbe, HostUsage, LimitViolation, ResourceGuard, ResourceLimits, SysinfoProbe};
pub use log::{LogError, LogRecord, SessionLog};
pub use stats::EngineStats;
