use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AlphabetError;

/// Where an input symbol is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Routed through an interception point (`m`).
    Mitm,
    /// Routed to the SUT directly (`s`).
    Sut,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Mitm => "m",
            Origin::Sut => "s",
        }
    }
}

/// Which halves of an interaction the output symbol reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputKind {
    /// Request and response (`rr`).
    RequestResponse,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::RequestResponse => "rr",
        }
    }
}

/// One input alphabet symbol: `<origin>-[<target>-]<action>-<outputKind>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSymbol {
    pub origin: Origin,
    /// Named interception point, if the symbol pins one.
    pub target: Option<String>,
    /// Fuzz or allow command handed to the interaction encoder.
    pub action: String,
    pub output_kind: OutputKind,
}

impl InputSymbol {
    /// A mitm-routed request/response symbol without a target.
    pub fn mitm(action: impl Into<String>) -> Self {
        Self {
            origin: Origin::Mitm,
            target: None,
            action: action.into(),
            output_kind: OutputKind::RequestResponse,
        }
    }
}

impl FromStr for InputSymbol {
    type Err = AlphabetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AlphabetError::EmptySymbol);
        }
        let malformed = |reason: &str| AlphabetError::MalformedInput {
            symbol: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split('-').collect();
        let origin = match parts[0] {
            "m" => Origin::Mitm,
            "s" => Origin::Sut,
            _ => return Err(malformed("origin must be 'm' or 's'")),
        };
        let target = match parts.len() {
            4 => Some(parts[1].to_string()),
            3 if origin == Origin::Mitm => None,
            3 => return Err(malformed("sut-routed symbols need a target")),
            _ => return Err(malformed("expected 3 or 4 '-' separated parts")),
        };
        let action = parts[parts.len() - 2];
        if action.is_empty() {
            return Err(malformed("empty action"));
        }
        let output_kind = match parts[parts.len() - 1] {
            "rr" => OutputKind::RequestResponse,
            _ => return Err(malformed("output kind must be 'rr'")),
        };

        Ok(Self {
            origin,
            target,
            action: action.to_string(),
            output_kind,
        })
    }
}

impl fmt::Display for InputSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.origin.as_str())?;
        if let Some(target) = &self.target {
            write!(f, "{target}-")?;
        }
        write!(f, "{}-{}", self.action, self.output_kind.as_str())
    }
}

/// Reserved output symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentinel {
    /// Session terminated early (non-zero fuzz code under early termination).
    Term,
    /// Nothing was intercepted before the listen timeout.
    NoFlow,
    /// A half of the interaction was never observed.
    Null,
    /// Transport timed out outside the encoder.
    Timeout,
    /// Transport or protocol-role error.
    Error,
    /// The symbol parser failed on a message.
    ParseError,
    /// An event of the wrong kind arrived.
    MsgError,
    /// The interception layer reported an error.
    ProxyError,
}

impl Sentinel {
    pub const ALL: [Sentinel; 8] = [
        Sentinel::Term,
        Sentinel::NoFlow,
        Sentinel::Null,
        Sentinel::Timeout,
        Sentinel::Error,
        Sentinel::ParseError,
        Sentinel::MsgError,
        Sentinel::ProxyError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Term => "term",
            Sentinel::NoFlow => "noflow",
            Sentinel::Null => "null",
            Sentinel::Timeout => "TIMEOUT",
            Sentinel::Error => "ERROR",
            Sentinel::ParseError => "PARSE_ERROR",
            Sentinel::MsgError => "msgerror",
            Sentinel::ProxyError => "proxyerror",
        }
    }

    pub fn from_name(s: &str) -> Option<Sentinel> {
        Self::ALL.into_iter().find(|sentinel| sentinel.as_str() == s)
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output alphabet symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputSymbol {
    Sentinel(Sentinel),
    /// `<code>-<responseSymbol>-<requestSymbol>`.
    Composite {
        code: i32,
        response: String,
        request: String,
    },
    /// Anything else read back from a log or handed over by a learner.
    Other(String),
}

impl OutputSymbol {
    pub fn composite(code: i32, response: impl Into<String>, request: impl Into<String>) -> Self {
        OutputSymbol::Composite {
            code,
            response: response.into(),
            request: request.into(),
        }
    }

    /// The sentinel this symbol absorbs the rest of a session into, if any.
    ///
    /// `term` and `noflow` absorb into themselves. A symbol whose trailing
    /// component is `null` means no further request arrived, so it absorbs
    /// into `noflow`.
    pub fn absorption(&self) -> Option<Sentinel> {
        match self {
            OutputSymbol::Sentinel(Sentinel::Term) => Some(Sentinel::Term),
            OutputSymbol::Sentinel(Sentinel::NoFlow) => Some(Sentinel::NoFlow),
            OutputSymbol::Sentinel(Sentinel::Null) => Some(Sentinel::NoFlow),
            OutputSymbol::Composite { request, .. } if request == Sentinel::Null.as_str() => {
                Some(Sentinel::NoFlow)
            }
            OutputSymbol::Other(s) if s.rsplit('-').next() == Some(Sentinel::Null.as_str()) => {
                Some(Sentinel::NoFlow)
            }
            _ => None,
        }
    }

    pub fn is_sentinel(&self, sentinel: Sentinel) -> bool {
        matches!(self, OutputSymbol::Sentinel(s) if *s == sentinel)
    }
}

impl From<Sentinel> for OutputSymbol {
    fn from(sentinel: Sentinel) -> Self {
        OutputSymbol::Sentinel(sentinel)
    }
}

impl FromStr for OutputSymbol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(sentinel) = Sentinel::from_name(s) {
            return Ok(OutputSymbol::Sentinel(sentinel));
        }
        // The code may be negative, so its separator is the first '-' after index 0.
        let split = s
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '-')
            .map(|(i, _)| i);
        if let Some(split) = split {
            let (code, rest) = (&s[..split], &s[split + 1..]);
            if let (Ok(code), Some((response, request))) = (code.parse::<i32>(), rest.rsplit_once('-')) {
                return Ok(OutputSymbol::composite(code, response, request));
            }
        }
        Ok(OutputSymbol::Other(s.to_string()))
    }
}

impl fmt::Display for OutputSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSymbol::Sentinel(s) => f.write_str(s.as_str()),
            OutputSymbol::Composite {
                code,
                response,
                request,
            } => write!(f, "{code}-{response}-{request}"),
            OutputSymbol::Other(s) => f.write_str(s),
        }
    }
}
