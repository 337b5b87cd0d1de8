//! Correlator between interception hooks and the engine.
//!
//! A proxy delivers request and response hooks on independent threads,
//! racing each other and the next session's first request. Each
//! [`InterceptionPoint`] pushes its hooks into one channel per phase; a
//! single correlator thread forwards them to the engine one at a time and
//! hands the engine's decision back to the waiting hook.
//!
//! After a request is allowed (or replaced), the correlator only accepts
//! responses until that response has been decided, the request was
//! killed, or the gate timeout expires. On expiry it proceeds with a
//! warning; the next interaction may then observe reordered events.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::message::{Decision, InterceptEvent, Pair, PhaseKind, Verdict, ERROR_PAYLOAD};
use crate::transport::ChannelTransport;

/// What an interception hook should do with its flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    Allow,
    Kill,
    Replace {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cookies: Option<Vec<Pair>>,
    },
    /// Downgrade the request method to lowercase `get`.
    LowerGet,
}

struct Pending {
    event: InterceptEvent,
    reply: Sender<HookAction>,
}

/// Hook-side handle for one named interception point.
#[derive(Clone)]
pub struct InterceptionPoint {
    name: String,
    requests: Sender<Pending>,
    responses: Sender<Pending>,
}

impl InterceptionPoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called by the proxy when a full request has been read. Blocks until
    /// the engine decides.
    pub fn on_request(&self, msg: &str, cookies: Vec<Pair>, headers: Vec<Pair>) -> HookAction {
        let mut event = InterceptEvent::request(self.name.clone(), msg);
        event.cookies = cookies;
        event.headers = headers;
        self.submit(&self.requests, event)
    }

    /// Called by the proxy when a full response has been read. Blocks until
    /// the engine decides.
    pub fn on_response(&self, msg: &str, cookies: Vec<Pair>, headers: Vec<Pair>) -> HookAction {
        let mut event = InterceptEvent::response(self.name.clone(), msg);
        event.cookies = cookies;
        event.headers = headers;
        self.submit(&self.responses, event)
    }

    fn submit(&self, queue: &Sender<Pending>, event: InterceptEvent) -> HookAction {
        let (reply, decided) = channel::bounded(1);
        if queue.send(Pending { event, reply }).is_err() {
            // Hub is gone; let traffic through untouched.
            return HookAction::Allow;
        }
        decided.recv().unwrap_or(HookAction::Allow)
    }
}

/// Owns the correlator thread.
pub struct InterceptionHub {
    requests: Sender<Pending>,
    responses: Sender<Pending>,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl InterceptionHub {
    /// Spawn the correlator and return the engine-side transport for it.
    pub fn start(config: HubConfig) -> (Self, ChannelTransport) {
        let (requests, request_rx) = channel::unbounded();
        let (responses, response_rx) = channel::unbounded();
        let (stop, stop_rx) = channel::bounded(0);
        let (to_engine, engine_inbound) = channel::unbounded();
        let (decision_tx, decisions) = channel::unbounded();

        let transport = ChannelTransport::new(decision_tx, decisions.clone(), engine_inbound);
        let correlator = Correlator {
            requests: request_rx,
            responses: response_rx,
            stop: stop_rx,
            to_engine,
            decisions,
            gate_timeout: config.gate_timeout(),
            gate: None,
        };
        let worker = std::thread::spawn(move || correlator.run());

        (
            Self {
                requests,
                responses,
                stop: Some(stop),
                worker: Some(worker),
            },
            transport,
        )
    }

    /// A hook handle for the interception point called `name`.
    pub fn point(&self, name: impl Into<String>) -> InterceptionPoint {
        InterceptionPoint {
            name: name.into(),
            requests: self.requests.clone(),
            responses: self.responses.clone(),
        }
    }

    /// Stop the correlator and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        // Dropping the sender disconnects the stop channel, which the
        // correlator treats as shutdown.
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for InterceptionHub {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

struct Correlator {
    requests: Receiver<Pending>,
    responses: Receiver<Pending>,
    stop: Receiver<()>,
    to_engine: Sender<String>,
    decisions: Receiver<String>,
    gate_timeout: Duration,
    /// Deadline while an allowed request still waits for its response.
    gate: Option<Instant>,
}

impl Correlator {
    fn run(mut self) {
        while let Some(pending) = self.next_pending() {
            if !self.forward(pending) {
                break;
            }
        }
        self.release_waiting();
        debug!("interception correlator stopped");
    }

    fn next_pending(&mut self) -> Option<Pending> {
        loop {
            if let Ok(pending) = self.responses.try_recv() {
                return Some(pending);
            }
            match self.gate {
                Some(deadline) => {
                    channel::select! {
                        recv(self.responses) -> p => return p.ok(),
                        recv(self.decisions) -> d => self.idle_decision(d.ok()?),
                        recv(self.stop) -> _ => return None,
                        recv(channel::at(deadline)) -> _ => {
                            warn!(
                                timeout = ?self.gate_timeout,
                                "response never arrived, releasing interception gate"
                            );
                            self.gate = None;
                        }
                    }
                }
                None => {
                    channel::select! {
                        recv(self.responses) -> p => return p.ok(),
                        recv(self.requests) -> p => return p.ok(),
                        recv(self.decisions) -> d => self.idle_decision(d.ok()?),
                        recv(self.stop) -> _ => return None,
                    }
                }
            }
        }
    }

    /// A decision that arrived while no flow was waiting for one.
    fn idle_decision(&mut self, raw: String) {
        match Decision::from_payload(&raw) {
            Ok(Decision::ClearFlows) => {
                self.gate = None;
                self.release_waiting();
            }
            _ => warn!(payload = %raw, "dropping decision with no intercepted flow"),
        }
    }

    /// Forward one hook to the engine and relay the decision. Returns
    /// false once the engine side is gone.
    fn forward(&mut self, pending: Pending) -> bool {
        let Pending { event, reply } = pending;
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "could not encode intercepted event");
                let _ = reply.send(HookAction::Allow);
                return true;
            }
        };
        if self.to_engine.send(payload).is_err() {
            let _ = reply.send(HookAction::Allow);
            return false;
        }

        let raw = channel::select! {
            recv(self.decisions) -> d => d.ok(),
            recv(self.stop) -> _ => None,
        };
        let Some(raw) = raw else {
            let _ = reply.send(HookAction::Allow);
            return false;
        };

        let action = match Decision::from_payload(&raw) {
            Ok(Decision::ClearFlows) => {
                self.gate = None;
                let _ = reply.send(HookAction::Kill);
                self.release_waiting();
                return true;
            }
            Ok(Decision::Cmd {
                mitm,
                msg,
                replacement,
                cookies,
            }) if mitm == event.mitm && msg.phase() == event.kind => {
                self.gate = match (event.kind, msg) {
                    (PhaseKind::Request, Verdict::KillReq) | (PhaseKind::Response, _) => None,
                    (PhaseKind::Request, _) => Some(Instant::now() + self.gate_timeout),
                };
                match msg {
                    Verdict::AllowReq | Verdict::AllowRes => HookAction::Allow,
                    Verdict::KillReq | Verdict::KillRes => HookAction::Kill,
                    Verdict::ReplaceReq | Verdict::ReplaceRes => HookAction::Replace {
                        body: replacement.unwrap_or_default(),
                        cookies,
                    },
                    Verdict::LowerGetReq => HookAction::LowerGet,
                }
            }
            _ => {
                warn!(
                    mitm = %event.mitm,
                    kind = event.kind.as_str(),
                    payload = %raw,
                    "decision does not match intercepted flow"
                );
                self.gate = None;
                let _ = self.to_engine.send(ERROR_PAYLOAD.to_string());
                HookAction::Kill
            }
        };
        let _ = reply.send(action);
        true
    }

    /// Kill every hook still queued, without forwarding it.
    fn release_waiting(&mut self) {
        for pending in self.responses.try_iter().chain(self.requests.try_iter()) {
            let _ = pending.reply.send(HookAction::Kill);
        }
    }
}
