//! Turns one learner action into one output symbol.
//!
//! An action takes up to two round trips with the interception layer. The
//! first decides the message intercepted last and waits for whatever the
//! peers send next. If that was a response, a second round trip decides it
//! and waits for the next request. The output symbol combines the fuzz
//! codes of both trips with the symbols of the response and request seen.

use std::collections::BTreeMap;
use std::time::Duration;

use mitmlearn_alphabet::{OutputSymbol, Sentinel};
use mitmlearn_fuzz::{
    FuzzError, FuzzTransform, HistoryEntry, HistoryLog, MessageParser, Rewrite, SessionContext,
    SymbolTable,
};
use mitmlearn_transport::{
    Decision, InterceptEvent, Listen, Pair, PhaseKind, Transport, TransportError, Verdict,
};
use tracing::{debug, warn};

/// Command recorded for the message that opens a session.
const RESET_COMMAND: &str = "session_reset";

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Invalid command for interception point: {0}")]
    InvalidCommand(String),

    #[error("No interception points configured")]
    NoInterceptionPoints,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fuzzer error: {0}")]
    Fuzz(#[from] FuzzError),
}

/// Parser and fuzzer attached to one named interception point.
pub struct PointHandlers {
    pub parser: Box<dyn MessageParser>,
    pub fuzzer: Box<dyn FuzzTransform>,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Listen timeout while the session is alive.
    pub mitm_timeout: Duration,
    /// Listen timeout once a session went quiet.
    pub noflow_timeout: Duration,
    /// Answer `term` as soon as a fuzz code is non-zero.
    pub early_termination: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            mitm_timeout: Duration::from_secs(2),
            noflow_timeout: Duration::from_secs(4),
            early_termination: false,
        }
    }
}

/// What the last listen produced; selects the decision vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastEvent {
    Request,
    Response,
    Timeout,
    Error,
}

enum Observed {
    Event(InterceptEvent),
    Timeout,
    Error,
    Undecodable,
}

/// Learner action after fuzzing.
enum Command<'a> {
    Named(&'a str),
    Replace {
        message: String,
        cookies: Option<Vec<Pair>>,
    },
}

pub struct InteractionEncoder<T: Transport> {
    transport: T,
    points: BTreeMap<String, PointHandlers>,
    table: SymbolTable,
    session: SessionContext,
    history_log: Option<HistoryLog>,
    config: EncoderConfig,
    timeout: Duration,
    last_mitm: String,
    last_event: LastEvent,
}

impl<T: Transport> InteractionEncoder<T> {
    pub fn new(
        transport: T,
        points: BTreeMap<String, PointHandlers>,
        table: SymbolTable,
        config: EncoderConfig,
    ) -> Result<Self, EncoderError> {
        let last_mitm = points
            .keys()
            .next()
            .cloned()
            .ok_or(EncoderError::NoInterceptionPoints)?;
        Ok(Self {
            transport,
            points,
            table,
            session: SessionContext::new(),
            history_log: None,
            timeout: config.mitm_timeout,
            config,
            last_mitm,
            last_event: LastEvent::Timeout,
        })
    }

    /// Append each finished session history to `log`.
    pub fn with_history_log(mut self, log: HistoryLog) -> Self {
        self.history_log = Some(log);
        self
    }

    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Equivalence digest of the current session.
    pub fn digest(&self) -> String {
        self.session.digest()
    }

    /// Release every intercepted flow.
    pub fn clear_flows(&mut self) -> Result<(), EncoderError> {
        self.transport.send(&Decision::ClearFlows.to_payload()?)?;
        Ok(())
    }

    /// Drop stale payloads in both directions.
    pub fn clear_queues(&mut self) {
        self.transport.clear();
    }

    /// Start a session: archive the previous history and wait for the
    /// first intercepted message.
    pub fn reset(&mut self) -> Result<(), EncoderError> {
        self.timeout = self.config.mitm_timeout;
        self.archive_session()?;
        match self.listen() {
            Observed::Event(event) => {
                self.record_event(event, RESET_COMMAND);
            }
            Observed::Timeout => warn!("no message intercepted at session start"),
            Observed::Error | Observed::Undecodable => {
                warn!("interception error at session start")
            }
        }
        Ok(())
    }

    /// Persist the alphabet table and the current session history.
    pub fn close(&mut self) -> Result<(), EncoderError> {
        self.archive_session()?;
        self.table.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), EncoderError> {
        self.table.flush()?;
        Ok(())
    }

    fn archive_session(&mut self) -> Result<(), EncoderError> {
        let finished = self.session.reset();
        if let Some(log) = self.history_log.as_mut() {
            log.append(&finished)?;
        }
        Ok(())
    }

    pub fn process_action(&mut self, action: &str) -> Result<OutputSymbol, EncoderError> {
        let null = Sentinel::Null.as_str();
        let (mut code, first) = self.round_trip(action)?;
        let mut response = null.to_string();
        let mut request = null.to_string();

        let second_trip = match first {
            Observed::Timeout => {
                self.timeout = self.config.noflow_timeout;
                debug!(action, "no flow, switching to dead-session timeout");
                return Ok(Sentinel::NoFlow.into());
            }
            Observed::Event(event) if event.kind == PhaseKind::Response => {
                response = self.record_event(event, action);
                true
            }
            Observed::Error => {
                response = Sentinel::ProxyError.as_str().to_string();
                true
            }
            Observed::Event(event) => {
                request = self.record_event(event, action);
                false
            }
            Observed::Undecodable => {
                response = Sentinel::MsgError.as_str().to_string();
                false
            }
        };

        if second_trip {
            let (code2, next) = self.round_trip(action)?;
            code += code2;
            request = match next {
                Observed::Timeout => null.to_string(),
                Observed::Error => Sentinel::ProxyError.as_str().to_string(),
                Observed::Event(event) if event.kind == PhaseKind::Request => {
                    self.record_event(event, action)
                }
                Observed::Event(_) | Observed::Undecodable => {
                    Sentinel::MsgError.as_str().to_string()
                }
            };
        }

        if self.config.early_termination && code != 0 {
            return Ok(Sentinel::Term.into());
        }
        Ok(OutputSymbol::composite(code, response, request))
    }

    /// Fuzz, decide the pending message and listen for the next one.
    fn round_trip(&mut self, action: &str) -> Result<(i32, Observed), EncoderError> {
        let outcome = match self.points.get(&self.last_mitm) {
            Some(handlers) => handlers.fuzzer.fuzz(action, &mut self.session),
            None => mitmlearn_fuzz::FuzzOutcome::passthrough(),
        };
        let command = match outcome.rewrite {
            None => Command::Named(action),
            Some(Rewrite::Allow) => Command::Named("allow"),
            Some(Rewrite::Replace { message, cookies }) => Command::Replace { message, cookies },
        };
        let decision = self.decision(action, command)?;
        self.transport.clear();
        if let Err(e) = self.transport.send(&decision.to_payload()?) {
            warn!(error = %e, "could not send decision");
            self.last_event = LastEvent::Error;
            return Ok((outcome.code, Observed::Error));
        }
        Ok((outcome.code, self.listen()))
    }

    fn decision(&self, action: &str, command: Command<'_>) -> Result<Decision, EncoderError> {
        let invalid = || EncoderError::InvalidCommand(action.to_string());
        let at_response = self.last_event == LastEvent::Response;
        let (msg, replacement, cookies) = match command {
            Command::Named(name) => {
                let verdict = if at_response {
                    match name {
                        "killres" => Verdict::KillRes,
                        "lowergetreq" => Verdict::AllowRes,
                        "allow" | "allowres" => Verdict::AllowRes,
                        _ => return Err(invalid()),
                    }
                } else {
                    match name {
                        "killreq" => Verdict::KillReq,
                        "killres" => Verdict::AllowReq,
                        "lowergetreq" => Verdict::LowerGetReq,
                        "allow" | "allowreq" => Verdict::AllowReq,
                        _ => return Err(invalid()),
                    }
                };
                (verdict, None, None)
            }
            Command::Replace { message, .. } if at_response => {
                (Verdict::ReplaceRes, Some(message), None)
            }
            Command::Replace { message, cookies } => (Verdict::ReplaceReq, Some(message), cookies),
        };
        Ok(Decision::Cmd {
            mitm: self.last_mitm.clone(),
            msg,
            replacement,
            cookies,
        })
    }

    fn listen(&mut self) -> Observed {
        match self.transport.listen(Some(self.timeout)) {
            Listen::Timeout => {
                self.last_event = LastEvent::Timeout;
                Observed::Timeout
            }
            Listen::Error => {
                self.last_event = LastEvent::Error;
                Observed::Error
            }
            Listen::Payload(payload) => match InterceptEvent::from_payload(&payload) {
                Ok(event) if self.points.contains_key(&event.mitm) => {
                    self.last_mitm = event.mitm.clone();
                    self.last_event = match event.kind {
                        PhaseKind::Request => LastEvent::Request,
                        PhaseKind::Response => LastEvent::Response,
                    };
                    Observed::Event(event)
                }
                Ok(event) => {
                    warn!(mitm = %event.mitm, "event from unknown interception point");
                    self.last_event = LastEvent::Error;
                    Observed::Undecodable
                }
                Err(e) => {
                    warn!(error = %e, "undecodable interception payload");
                    self.last_event = LastEvent::Error;
                    Observed::Undecodable
                }
            },
        }
    }

    /// Parse an event into its output symbol and append it to the history.
    fn record_event(&mut self, event: InterceptEvent, cmd: &str) -> String {
        let symbol = match self.points.get(&event.mitm) {
            Some(handlers) => {
                self.table
                    .symbol(handlers.parser.as_ref(), &event.msg, event.kind, &event.mitm)
            }
            None => Sentinel::MsgError.as_str().to_string(),
        };
        debug!(mitm = %event.mitm, kind = event.kind.as_str(), symbol = %symbol, "intercepted");
        self.session.record(HistoryEntry {
            cmd: cmd.to_string(),
            message: event.msg,
            cookies: event.cookies,
            kind: event.kind,
            symbol: symbol.clone(),
            mitm: event.mitm,
            msg_mod: None,
        });
        symbol
    }
}

/// Executes one `m-` action of a session.
pub trait ActionExecutor {
    fn execute(&mut self, action: &str) -> Result<OutputSymbol, EncoderError>;
}

impl<T: Transport> ActionExecutor for InteractionEncoder<T> {
    fn execute(&mut self, action: &str) -> Result<OutputSymbol, EncoderError> {
        self.process_action(action)
    }
}
