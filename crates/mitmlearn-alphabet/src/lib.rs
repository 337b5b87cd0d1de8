//! Input and output alphabets for mitm-driven learning sessions.
//!
//! Symbols travel as hyphen/semicolon strings on the learner wire and in
//! the logs; everywhere else they are the tagged types in this crate.

pub mod query;
pub mod symbol;

pub use query::{Query, Response};
pub use symbol::{InputSymbol, Origin, OutputKind, OutputSymbol, Sentinel};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlphabetError {
    #[error("Malformed input symbol '{symbol}': {reason}")]
    MalformedInput { symbol: String, reason: String },

    #[error("Empty input symbol")]
    EmptySymbol,

    #[error("Empty query")]
    EmptyQuery,
}
