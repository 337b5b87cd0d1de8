//! Query sources: a live learner over TCP or a recorded query list.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;

use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LearnerError {
    #[error("Learner IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Replay file error: {0}")]
    Csv(#[from] csv::Error),
}

/// The side of the conversation that asks queries.
pub trait Learner {
    /// Next query, `None` once the learner is done.
    fn listen(&mut self) -> Result<Option<String>, LearnerError>;

    fn send(&mut self, response: &str) -> Result<(), LearnerError>;

    /// Return a query so the next `listen` yields it again.
    fn push(&mut self, query: String);
}

impl<T: Learner + ?Sized> Learner for Box<T> {
    fn listen(&mut self) -> Result<Option<String>, LearnerError> {
        (**self).listen()
    }

    fn send(&mut self, response: &str) -> Result<(), LearnerError> {
        (**self).send(response)
    }

    fn push(&mut self, query: String) {
        (**self).push(query)
    }
}

/// One learner client on a newline framed TCP connection.
pub struct TcpLearner {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    pushed: Vec<String>,
}

impl TcpLearner {
    /// Wait on `localhost:<port>` for the learner to connect.
    pub fn accept(port: u16) -> Result<Self, LearnerError> {
        let listener = TcpListener::bind(("localhost", port))?;
        info!(port, "waiting for learner");
        Self::accept_on(&listener)
    }

    pub fn accept_on(listener: &TcpListener) -> Result<Self, LearnerError> {
        let (stream, peer) = listener.accept()?;
        info!(%peer, "learner connected");
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            pushed: Vec::new(),
        })
    }
}

impl Learner for TcpLearner {
    fn listen(&mut self) -> Result<Option<String>, LearnerError> {
        if let Some(query) = self.pushed.pop() {
            return Ok(Some(query));
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            debug!("learner closed the connection");
            return Ok(None);
        }
        let query = line.trim();
        if query.is_empty() {
            return Ok(None);
        }
        Ok(Some(query.to_string()))
    }

    fn send(&mut self, response: &str) -> Result<(), LearnerError> {
        self.writer.write_all(response.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn push(&mut self, query: String) {
        self.pushed.push(query);
    }
}

/// Replays queries from a previous run and keeps the answers.
#[derive(Debug, Default)]
pub struct ReplayLearner {
    queries: VecDeque<String>,
    responses: Vec<String>,
}

impl ReplayLearner {
    pub fn new(queries: impl IntoIterator<Item = String>) -> Self {
        Self {
            queries: queries.into_iter().collect(),
            responses: Vec::new(),
        }
    }

    /// Queries from the first column of a headerless CSV file such as
    /// `log.csv`.
    pub fn from_csv(path: &Path) -> Result<Self, LearnerError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut queries = VecDeque::new();
        for row in reader.records() {
            if let Some(query) = row?.get(0).filter(|q| !q.trim().is_empty()) {
                queries.push_back(query.trim().to_string());
            }
        }
        info!(count = queries.len(), path = %path.display(), "loaded replay queries");
        Ok(Self {
            queries,
            responses: Vec::new(),
        })
    }

    pub fn responses(&self) -> &[String] {
        &self.responses
    }

    pub fn remaining(&self) -> usize {
        self.queries.len()
    }
}

impl Learner for ReplayLearner {
    fn listen(&mut self) -> Result<Option<String>, LearnerError> {
        Ok(self.queries.pop_front())
    }

    fn send(&mut self, response: &str) -> Result<(), LearnerError> {
        self.responses.push(response.to_string());
        Ok(())
    }

    fn push(&mut self, query: String) {
        self.queries.push_front(query);
    }
}
