//! Wire records exchanged between the engine and the interception layer.
//!
//! Payloads are JSON strings. The engine only interprets the fields
//! below; interception points may attach more, which are ignored.

use serde::{Deserialize, Serialize};

/// Raw payload the interception layer sends for protocol-role mismatches.
pub const ERROR_PAYLOAD: &str = "ERROR";

/// A `(name, value)` pair, used for both cookies and headers.
pub type Pair = (String, String);

/// Which phase of a flow an event was intercepted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Request,
    Response,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Request => "request",
            PhaseKind::Response => "response",
        }
    }
}

/// A message intercepted by a named interception point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptEvent {
    #[serde(rename = "type")]
    pub kind: PhaseKind,
    /// Name of the interception point that saw the message.
    pub mitm: String,
    /// Message body.
    pub msg: String,
    #[serde(default)]
    pub cookies: Vec<Pair>,
    #[serde(default)]
    pub headers: Vec<Pair>,
}

impl InterceptEvent {
    pub fn request(mitm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: PhaseKind::Request,
            mitm: mitm.into(),
            msg: msg.into(),
            cookies: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn response(mitm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: PhaseKind::Response,
            mitm: mitm.into(),
            msg: msg.into(),
            cookies: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn to_payload(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// What to do with the intercepted flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    AllowReq,
    KillReq,
    ReplaceReq,
    LowerGetReq,
    AllowRes,
    KillRes,
    ReplaceRes,
}

impl Verdict {
    /// The phase this verdict applies to.
    pub fn phase(&self) -> PhaseKind {
        match self {
            Verdict::AllowReq | Verdict::KillReq | Verdict::ReplaceReq | Verdict::LowerGetReq => {
                PhaseKind::Request
            }
            Verdict::AllowRes | Verdict::KillRes | Verdict::ReplaceRes => PhaseKind::Response,
        }
    }
}

/// A decision sent back to the interception layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Cmd {
        mitm: String,
        msg: Verdict,
        /// Replacement body for the replace verdicts.
        #[serde(rename = "msg+", default, skip_serializing_if = "Option::is_none")]
        replacement: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cookies: Option<Vec<Pair>>,
    },
    /// Release every intercepted flow without forwarding it.
    ClearFlows,
}

impl Decision {
    pub fn cmd(mitm: impl Into<String>, verdict: Verdict) -> Self {
        Decision::Cmd {
            mitm: mitm.into(),
            msg: verdict,
            replacement: None,
            cookies: None,
        }
    }

    pub fn to_payload(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Outcome of a bounded `listen`.
#[derive(Debug, Clone, PartialEq)]
pub enum Listen {
    Payload(String),
    Timeout,
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport disconnected")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = InterceptEvent::request("ep", "{\"a\":1}");
        let payload = event.to_payload().unwrap();
        assert!(payload.contains("\"type\":\"request\""));
        assert!(payload.contains("\"mitm\":\"ep\""));
        assert_eq!(InterceptEvent::from_payload(&payload).unwrap(), event);
    }

    #[test]
    fn test_event_tolerates_missing_optional_fields() {
        let event =
            InterceptEvent::from_payload(r#"{"type":"response","mitm":"ep","msg":"ok","url":"x"}"#)
                .unwrap();
        assert_eq!(event.kind, PhaseKind::Response);
        assert!(event.cookies.is_empty());
    }

    #[test]
    fn test_decision_replacement_field_name() {
        let decision = Decision::Cmd {
            mitm: "ep".into(),
            msg: Verdict::ReplaceReq,
            replacement: Some("body".into()),
            cookies: None,
        };
        let payload = decision.to_payload().unwrap();
        assert!(payload.contains("\"type\":\"cmd\""));
        assert!(payload.contains("\"msg\":\"replacereq\""));
        assert!(payload.contains("\"msg+\":\"body\""));
        assert!(!payload.contains("cookies"));
    }

    #[test]
    fn test_clear_flows_payload() {
        let payload = Decision::ClearFlows.to_payload().unwrap();
        assert_eq!(payload, r#"{"type":"clear_flows"}"#);
    }

    #[test]
    fn test_verdict_phase() {
        assert_eq!(Verdict::LowerGetReq.phase(), PhaseKind::Request);
        assert_eq!(Verdict::KillRes.phase(), PhaseKind::Response);
    }
}
