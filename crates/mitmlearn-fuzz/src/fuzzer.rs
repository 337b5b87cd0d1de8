//! Fuzz transforms: rewrite the in-flight message before a decision is sent.
//!
//! Return codes are bit flags, summed over the two round trips of an
//! action:
//!
//! - `1`: the action does not apply to the message
//! - `2`: the action targets a response; wait for it
//!
//! A response-phase rewrite contributes `-2`, cancelling the `2` recorded
//! when the same action was first seen at the request.

use mitmlearn_transport::{Pair, PhaseKind};
use regex::Regex;

use crate::session::SessionContext;
use crate::FuzzError;

/// Replacement for the action the learner asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Let the message through unchanged.
    Allow,
    /// Forward `message` in place of the intercepted body.
    Replace {
        message: String,
        cookies: Option<Vec<Pair>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzOutcome {
    pub code: i32,
    /// `None` forwards the original action.
    pub rewrite: Option<Rewrite>,
}

impl FuzzOutcome {
    pub fn passthrough() -> Self {
        Self {
            code: 0,
            rewrite: None,
        }
    }
}

pub trait FuzzTransform: Send {
    /// Registry name of this fuzzer.
    fn name(&self) -> &'static str;

    /// Apply `action` to the last message in `session`, recording the
    /// digest part and any modification.
    fn fuzz(&self, action: &str, session: &mut SessionContext) -> FuzzOutcome;
}

/// Forwards every action untouched and contributes no digest.
pub struct NoFuzz;

impl FuzzTransform for NoFuzz {
    fn name(&self) -> &'static str {
        "no_fuzz"
    }

    fn fuzz(&self, _action: &str, _session: &mut SessionContext) -> FuzzOutcome {
        FuzzOutcome::passthrough()
    }
}

/// Replays, replacements and blanking of request/response bodies.
pub struct SimpleFuzzer {
    int_element: Regex,
    trailing_int: Regex,
}

/// Value written over every `<int>` element by `replacereq`.
const REPLACED_INT: &str = "<int>117</int>";

struct Plan {
    code: i32,
    rewrite: Option<Rewrite>,
    digest: String,
}

impl Plan {
    fn allow(code: i32, digest: impl Into<String>) -> Self {
        Self {
            code,
            rewrite: Some(Rewrite::Allow),
            digest: digest.into(),
        }
    }

    fn replace(
        code: i32,
        message: impl Into<String>,
        cookies: Option<Vec<Pair>>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            code,
            rewrite: Some(Rewrite::Replace {
                message: message.into(),
                cookies,
            }),
            digest: digest.into(),
        }
    }
}

impl SimpleFuzzer {
    pub fn new() -> Result<Self, FuzzError> {
        Ok(Self {
            int_element: Regex::new(r"<int>\d+</int>")?,
            trailing_int: Regex::new(r"\d+$")?,
        })
    }

    /// Replay distance encoded at the end of an action, 1 when absent.
    fn distance(&self, action: &str) -> usize {
        self.trailing_int
            .find(action)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(1)
            .max(1)
    }

    /// Replay the `n`th previous message of `kind`. `real` prefers the
    /// body that was actually forwarded.
    fn replay(&self, session: &SessionContext, action: &str, kind: PhaseKind, real: bool) -> Plan {
        let tag = match kind {
            PhaseKind::Request => "replayreq",
            PhaseKind::Response => "replayres",
        };
        let n = self.distance(action);
        let end = (session.history().len() + 1).saturating_sub(2 * n);
        match session.search(end, Some(kind), None) {
            Some(i) => self.replay_entry(session, kind, i, real, tag),
            None => Plan::allow(1, action),
        }
    }

    fn replay_entry(
        &self,
        session: &SessionContext,
        kind: PhaseKind,
        i: usize,
        real: bool,
        tag: &str,
    ) -> Plan {
        let entry = &session.history()[i];
        let (message, variant) = match (&entry.msg_mod, real) {
            (Some(modified), true) => (modified.clone(), "mod"),
            _ => (entry.message.clone(), "msg"),
        };
        let digest = format!("{tag}#{i}#{variant}");
        match kind {
            PhaseKind::Request => Plan::replace(0, message, Some(entry.cookies.clone()), digest),
            PhaseKind::Response => Plan::replace(-2, message, None, digest),
        }
    }

    fn plan(&self, action: &str, session: &SessionContext) -> Option<Plan> {
        let last = session.last();
        let at = |kind: PhaseKind| last.map_or(false, |e| e.kind == kind);
        let at_request = at(PhaseKind::Request);
        let at_response = at(PhaseKind::Response);

        let plan = if action == "replacereq" {
            match last.filter(|_| at_request) {
                Some(entry) => {
                    let body = self
                        .int_element
                        .replace_all(&entry.message, REPLACED_INT)
                        .into_owned();
                    let code = if body.contains(REPLACED_INT) { 0 } else { 1 };
                    Plan::replace(code, body, None, action)
                }
                None => Plan::allow(0, action),
            }
        } else if let Some(real) = replay_kind(action, "replayreq") {
            if at_request {
                self.replay(session, action, PhaseKind::Request, real)
            } else {
                Plan::allow(0, "replayed")
            }
        } else if let Some(real) = replay_kind(action, "replayres") {
            if at_response {
                self.replay(session, action, PhaseKind::Response, real)
            } else {
                Plan::allow(2, "pending")
            }
        } else if action == "smartreplayreq" {
            match last.filter(|_| at_request) {
                Some(entry) => {
                    let end = session.history().len() - 1;
                    match session.search(end, Some(PhaseKind::Request), Some(&entry.symbol)) {
                        Some(i) => {
                            self.replay_entry(session, PhaseKind::Request, i, false, "replayreq")
                        }
                        None => Plan::allow(1, action),
                    }
                }
                None => Plan::allow(0, "replayed"),
            }
        } else if action == "smartreplayres" {
            match last.filter(|_| at_response) {
                Some(entry) => {
                    let end = session.history().len() - 1;
                    match session.search(end, None, Some(&entry.symbol)) {
                        Some(i) => {
                            self.replay_entry(session, PhaseKind::Response, i, false, "replayres")
                        }
                        None => Plan::allow(1, action),
                    }
                }
                None => Plan::allow(2, "pending"),
            }
        } else if let Some((kind, body)) = junk_body(action) {
            match kind {
                Some(PhaseKind::Request) if at_request => Plan::replace(0, body, None, action),
                Some(PhaseKind::Request) => Plan::allow(0, action),
                Some(PhaseKind::Response) if at_response => Plan::replace(-2, body, None, action),
                Some(PhaseKind::Response) => Plan::allow(2, action),
                None => Plan::replace(0, body, None, action),
            }
        } else {
            return None;
        };
        Some(plan)
    }
}

/// `Some(real)` when `action` is a plain or "real" replay of `base`.
fn replay_kind(action: &str, base: &str) -> Option<bool> {
    if action.starts_with(base) {
        Some(false)
    } else if action.strip_prefix("real").is_some_and(|rest| rest.starts_with(base)) {
        Some(true)
    } else {
        None
    }
}

/// Fixed-body actions: the phase they target (`None` for both) and the body.
fn junk_body(action: &str) -> Option<(Option<PhaseKind>, &'static str)> {
    match action {
        "spamreq" => Some((Some(PhaseKind::Request), "spam")),
        "spamres" => Some((Some(PhaseKind::Response), "spam")),
        "blankreq" => Some((Some(PhaseKind::Request), "")),
        "blankres" => Some((Some(PhaseKind::Response), "")),
        "blankboth" => Some((None, "")),
        _ => None,
    }
}

impl FuzzTransform for SimpleFuzzer {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn fuzz(&self, action: &str, session: &mut SessionContext) -> FuzzOutcome {
        let Some(plan) = self.plan(action, session) else {
            session.push_digest(action);
            return FuzzOutcome::passthrough();
        };
        session.push_digest(plan.digest);
        if let Some(Rewrite::Replace { message, cookies }) = &plan.rewrite {
            session.mark_modified(message, cookies.as_deref());
        }
        FuzzOutcome {
            code: plan.code,
            rewrite: plan.rewrite,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HistoryEntry;

    fn seen(session: &mut SessionContext, kind: PhaseKind, symbol: &str, message: &str) {
        session.record(HistoryEntry {
            cmd: "allow".into(),
            message: message.into(),
            cookies: vec![("sid".into(), message.into())],
            kind,
            symbol: symbol.into(),
            mitm: "ep".into(),
            msg_mod: None,
        });
    }

    fn replaced(outcome: &FuzzOutcome) -> Option<&str> {
        match &outcome.rewrite {
            Some(Rewrite::Replace { message, .. }) => Some(message),
            _ => None,
        }
    }

    #[test]
    fn test_unknown_action_passes_through() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "a");
        let outcome = fuzzer.fuzz("killreq", &mut session);
        assert_eq!(outcome, FuzzOutcome::passthrough());
        assert_eq!(session.digest(), "killreq");
    }

    #[test]
    fn test_replacereq_rewrites_ints() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "<a><int>5</int></a>");
        let outcome = fuzzer.fuzz("replacereq", &mut session);
        assert_eq!(outcome.code, 0);
        assert_eq!(replaced(&outcome), Some("<a><int>117</int></a>"));
        assert_eq!(
            session.last().unwrap().msg_mod.as_deref(),
            Some("<a><int>117</int></a>")
        );
    }

    #[test]
    fn test_replacereq_without_ints_is_not_applicable() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "plain");
        assert_eq!(fuzzer.fuzz("replacereq", &mut session).code, 1);
    }

    #[test]
    fn test_replayreq_uses_previous_request() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "first");
        seen(&mut session, PhaseKind::Response, "2", "reply");
        seen(&mut session, PhaseKind::Request, "1", "second");
        let outcome = fuzzer.fuzz("replayreq", &mut session);
        assert_eq!(replaced(&outcome), Some("first"));
        assert_eq!(session.digest(), "replayreq#0#msg");
    }

    #[test]
    fn test_replayreq_with_nothing_to_replay() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "only");
        let outcome = fuzzer.fuzz("replayreq", &mut session);
        assert_eq!(outcome.code, 1);
        assert_eq!(outcome.rewrite, Some(Rewrite::Allow));
    }

    #[test]
    fn test_response_action_at_request_is_pending() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "req");
        let outcome = fuzzer.fuzz("spamres", &mut session);
        assert_eq!(outcome.code, 2);
        assert_eq!(outcome.rewrite, Some(Rewrite::Allow));

        seen(&mut session, PhaseKind::Response, "2", "res");
        let outcome = fuzzer.fuzz("spamres", &mut session);
        assert_eq!(outcome.code, -2);
        assert_eq!(replaced(&outcome), Some("spam"));
    }

    #[test]
    fn test_replay_at_response_records_replayed() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Response, "2", "res");
        fuzzer.fuzz("replayreq", &mut session);
        fuzzer.fuzz("replayres", &mut session);
        assert_eq!(session.digest(), "replayed###replayres");
    }

    #[test]
    fn test_realreplay_prefers_modified_body() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "1", "orig");
        session.mark_modified("changed", None);
        seen(&mut session, PhaseKind::Response, "2", "reply");
        seen(&mut session, PhaseKind::Request, "1", "next");
        let outcome = fuzzer.fuzz("realreplayreq", &mut session);
        assert_eq!(replaced(&outcome), Some("changed"));
        assert_eq!(session.digest(), "replayreq#0#mod");
    }

    #[test]
    fn test_smartreplayreq_matches_symbol() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        seen(&mut session, PhaseKind::Request, "7", "login");
        seen(&mut session, PhaseKind::Request, "8", "other");
        seen(&mut session, PhaseKind::Request, "7", "login again");
        let outcome = fuzzer.fuzz("smartreplayreq", &mut session);
        assert_eq!(replaced(&outcome), Some("login"));
    }

    #[test]
    fn test_empty_history_is_graceful() {
        let fuzzer = SimpleFuzzer::new().unwrap();
        let mut session = SessionContext::new();
        assert_eq!(
            fuzzer.fuzz("replacereq", &mut session).rewrite,
            Some(Rewrite::Allow)
        );
        assert_eq!(fuzzer.fuzz("blankres", &mut session).code, 2);
    }

    #[test]
    fn test_no_fuzz_leaves_no_digest() {
        let mut session = SessionContext::new();
        assert_eq!(NoFuzz.fuzz("spamreq", &mut session), FuzzOutcome::passthrough());
        assert_eq!(session.digest(), "");
    }
}
