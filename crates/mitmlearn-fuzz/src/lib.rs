//! Message abstraction and fuzzing for intercepted traffic.

pub mod fuzzer;
pub mod parser;
pub mod registry;
pub mod session;
pub mod table;

pub use fuzzer::{FuzzOutcome, FuzzTransform, NoFuzz, Rewrite, SimpleFuzzer};
pub use parser::MessageParser;
pub use session::{HistoryEntry, HistoryLog, SessionContext};
pub use table::{SymbolExample, SymbolTable, PARSE_ERROR};

#[derive(Debug, thiserror::Error)]
pub enum FuzzError {
    #[error("Unknown message parser: {0}")]
    UnknownParser(String),

    #[error("Unknown message fuzzer: {0}")]
    UnknownFuzzer(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Output alphabet files disagree at symbol {0}")]
    InconsistentAlphabet(String),

    #[error("Output alphabet is empty")]
    EmptyAlphabet,

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
