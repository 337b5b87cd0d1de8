//! The learning loop: learner queries in, cached or executed answers out.

use chrono::Utc;
use mitmlearn_alphabet::{AlphabetError, Query, Response};
use mitmlearn_explore::{
    DriverError, EncoderError, InteractionEncoder, SessionDriver, SessionOutcome, SutControl,
};
use mitmlearn_transport::Transport;
use tracing::{debug, error, info, warn};

use crate::cache::QueryCache;
use crate::config::{ConfigError, EngineConfig};
use crate::learner::{Learner, LearnerError};
use crate::limits::{HostProbe, LimitViolation, ResourceGuard, SysinfoProbe};
use crate::log::{LogError, LogRecord, SessionLog};
use crate::stats::EngineStats;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Malformed query: {0}")]
    Query(#[from] AlphabetError),

    #[error("Session error: {0}")]
    Driver(#[from] DriverError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Learner error: {0}")]
    Learner(#[from] LearnerError),

    #[error("Resource limit exceeded: {0}")]
    Resources(#[from] LimitViolation),

    #[error("SUT control error: {0}")]
    Sut(std::io::Error),
}

pub struct LearningEngine<T: Transport, L: Learner, P: HostProbe = SysinfoProbe> {
    encoder: InteractionEncoder<T>,
    driver: SessionDriver,
    cache: QueryCache,
    log: SessionLog,
    learner: L,
    sut: Box<dyn SutControl>,
    guard: ResourceGuard<P>,
    stats: EngineStats,
}

impl<T: Transport, L: Learner, P: HostProbe> LearningEngine<T, L, P> {
    pub fn new(
        config: &EngineConfig,
        encoder: InteractionEncoder<T>,
        log: SessionLog,
        learner: L,
        sut: Box<dyn SutControl>,
        guard: ResourceGuard<P>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            encoder,
            driver: SessionDriver::new(config.driver_config()?),
            cache: QueryCache::new(config.cache_config()),
            log,
            learner,
            sut,
            guard,
            stats: EngineStats::default(),
        })
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn encoder(&self) -> &InteractionEncoder<T> {
        &self.encoder
    }

    /// Resume from the log backlog, then serve the learner until it is
    /// done. The log and alphabet table are flushed on every exit.
    pub fn run(&mut self) -> Result<EngineStats, EngineError> {
        let served = self.resume().and_then(|()| self.serve());
        if let Err(e) = &served {
            error!(error = %e, "learning loop stopped");
        }
        let closed = self.close();
        self.stats.log_summary();
        served?;
        closed?;
        Ok(self.stats.clone())
    }

    /// Replay stored records while the learner asks the same queries in
    /// the same order. From the first divergence on, the remaining
    /// records only warm the cache.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        let mut diverged = false;
        while let Some(mut record) = self.log.resume_next()? {
            let query: Query = match record.query.parse() {
                Ok(query) => query,
                Err(e) => {
                    error!(query = %record.query, error = %e, "unreadable stored query, stopping resume");
                    break;
                }
            };
            let response: Response = record.response.parse().unwrap_or_default();
            if response.len() != query.len() {
                warn!(query = %query, response = %record.response, "stored response does not cover the query, skipping");
                continue;
            }

            if !diverged {
                match self.learner.listen()? {
                    Some(live) if same_query(&live, &query) => {
                        debug!(query = %query, "replaying stored answer");
                        record.used_query = true;
                        record.stamp("replayed");
                        self.log.append(&record)?;
                        self.cache
                            .record(&query, &response, &record.equivalence_digest);
                        self.learner.send(&response.to_string())?;
                        self.stats.queries += 1;
                        self.stats.replayed += 1;
                        continue;
                    }
                    Some(live) => {
                        info!(stored = %query, live = %live, "learner diverged from the stored run");
                        self.learner.push(live);
                        diverged = true;
                    }
                    None => diverged = true,
                }
            }

            record.used_query = false;
            self.log.append(&record)?;
            self.cache
                .record(&query, &response, &record.equivalence_digest);
            self.stats.cached_only += 1;
        }
        if self.stats.replayed + self.stats.cached_only > 0 {
            info!(
                replayed = self.stats.replayed,
                cached = self.stats.cached_only,
                "resume finished"
            );
        }
        Ok(())
    }

    pub fn serve(&mut self) -> Result<(), EngineError> {
        loop {
            self.guard.check()?;
            let Some(raw) = self.learner.listen()? else {
                info!("learner finished");
                return Ok(());
            };
            let response = self.answer(&raw)?;
            self.learner.send(&response.to_string())?;
        }
    }

    /// Resolve one query from cache or by execution, and log it.
    pub fn answer(&mut self, raw: &str) -> Result<Response, EngineError> {
        let query: Query = raw.parse()?;
        self.stats.queries += 1;
        let started = Utc::now();

        if let Some((response, tier)) = self.cache.lookup(&query) {
            debug!(query = %query, response = %response, ?tier, "cache hit");
            self.stats.record_hit(tier);
            let mut record = LogRecord::new(query.key(), response.to_string());
            record.timestamps.insert("started".into(), started);
            record.stamp("resolved");
            self.log.append(&record)?;
            self.cache.record(&query, &response, "");
            return Ok(response);
        }

        info!(query = %query, "executing query");
        let (outcome, digest) = self.execute(&query)?;
        info!(query = %query, response = %outcome.response, "query resolved");

        let mut record = LogRecord::new(query.key(), outcome.response.to_string())
            .with_times(&outcome.transition_times)
            .with_digest(digest.clone())
            .with_traces(outcome.traces);
        record.timestamps.insert("started".into(), started);
        record.stamp("resolved");
        self.log.append(&record)?;
        self.cache.record(&query, &outcome.response, &digest);
        Ok(outcome.response)
    }

    /// Run `query` against a freshly started SUT. Once started, the SUT is
    /// killed whatever happens in between.
    fn execute(&mut self, query: &Query) -> Result<(SessionOutcome, String), EngineError> {
        self.encoder.clear_queues();
        self.encoder.clear_flows()?;
        self.sut.start().map_err(EngineError::Sut)?;

        let session = self.run_session(query);
        let cleared = self.encoder.clear_flows();
        let killed = self.sut.kill();

        let (outcome, digest) = session?;
        cleared?;
        killed.map_err(EngineError::Sut)?;
        self.stats.executed += 1;
        Ok((outcome, digest))
    }

    fn run_session(&mut self, query: &Query) -> Result<(SessionOutcome, String), EngineError> {
        self.encoder.reset()?;
        let outcome = self.driver.run(query, &mut self.encoder, &mut *self.sut);
        let digest = self.encoder.digest();
        Ok((outcome?, digest))
    }

    fn close(&mut self) -> Result<(), EngineError> {
        let log = self.log.flush();
        self.encoder.close()?;
        log?;
        Ok(())
    }
}

fn same_query(live: &str, stored: &Query) -> bool {
    live.parse::<Query>()
        .map(|live| live == *stored)
        .unwrap_or(false)
}
