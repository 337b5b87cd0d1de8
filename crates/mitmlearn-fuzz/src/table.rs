//! Output alphabet: abstraction keys mapped to compact symbol ids.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use mitmlearn_transport::PhaseKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::parser::MessageParser;
use crate::FuzzError;

pub const ALPHABET_FILE: &str = "output_alphabet.json";
pub const EXAMPLES_FILE: &str = "output_alphabet_examples.json";
pub const PARSER_ERRORS_FILE: &str = "parser_errors.csv";

/// Symbol emitted when a parser rejects a message.
pub const PARSE_ERROR: &str = "PARSE_ERROR";

/// Messages looked up as their own key, bypassing the parser.
const VERBATIM_MESSAGES: [&str; 2] = ["MITM_TIMEOUT", ""];

/// First message seen for a symbol, kept for humans reading the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolExample {
    pub example: String,
    pub parsed: String,
    pub source: String,
    /// Seen in the request phase.
    pub request: bool,
    /// Seen in the response phase.
    pub response: bool,
    /// Free text for annotating the learned model.
    #[serde(default)]
    pub legend: String,
}

#[derive(Debug)]
pub struct SymbolTable {
    ids: BTreeMap<String, String>,
    examples: BTreeMap<String, SymbolExample>,
    parser_errors: Vec<String>,
    dir: Option<PathBuf>,
    numeric: bool,
}

impl SymbolTable {
    /// A table that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            ids: BTreeMap::new(),
            examples: BTreeMap::new(),
            parser_errors: Vec::new(),
            dir: None,
            numeric: true,
        }
    }

    /// An empty table persisted under `dir` on every new symbol.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::in_memory()
        }
    }

    /// Reload a table written by a previous run.
    ///
    /// Both files must exist, be non-empty and agree with each other.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, FuzzError> {
        let dir = dir.into();
        let ids: BTreeMap<String, String> =
            serde_json::from_reader(File::open(dir.join(ALPHABET_FILE))?)?;
        let examples: BTreeMap<String, SymbolExample> =
            serde_json::from_reader(File::open(dir.join(EXAMPLES_FILE))?)?;
        if ids.is_empty() {
            return Err(FuzzError::EmptyAlphabet);
        }
        for (key, id) in &ids {
            match examples.get(id) {
                Some(example) if &example.parsed == key => {}
                _ => return Err(FuzzError::InconsistentAlphabet(id.clone())),
            }
        }
        for (id, example) in &examples {
            if ids.get(&example.parsed) != Some(id) {
                return Err(FuzzError::InconsistentAlphabet(id.clone()));
            }
        }
        debug!(symbols = ids.len(), dir = %dir.display(), "loaded output alphabet");
        Ok(Self {
            ids,
            examples,
            parser_errors: Vec::new(),
            dir: Some(dir),
            numeric: true,
        })
    }

    /// Use abstraction keys as symbols instead of numeric ids.
    pub fn verbatim(mut self) -> Self {
        self.numeric = false;
        self
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn examples(&self) -> &BTreeMap<String, SymbolExample> {
        &self.examples
    }

    pub fn parser_errors(&self) -> &[String] {
        &self.parser_errors
    }

    /// Output symbol for `message`. Never fails: a parser failure is
    /// recorded and answered with [`PARSE_ERROR`].
    pub fn symbol(
        &mut self,
        parser: &dyn MessageParser,
        message: &str,
        kind: PhaseKind,
        source: &str,
    ) -> String {
        let key = if VERBATIM_MESSAGES.contains(&message) {
            Ok(message.to_string())
        } else {
            parser.key(message, kind)
        };
        match key {
            Ok(key) => {
                let id = self.lookup(&key, message, source);
                if let Some(example) = self.examples.get_mut(&id) {
                    match kind {
                        PhaseKind::Request => example.request = true,
                        PhaseKind::Response => example.response = true,
                    }
                }
                id
            }
            Err(e) => {
                warn!(parser = parser.name(), source, error = %e, "message did not parse");
                self.parser_errors
                    .push(format!("{}:{}", kind.as_str(), message));
                if let Err(e) = self.write_parser_errors() {
                    warn!(error = %e, "could not write parser errors");
                }
                PARSE_ERROR.to_string()
            }
        }
    }

    fn lookup(&mut self, key: &str, message: &str, source: &str) -> String {
        if let Some(id) = self.ids.get(key) {
            return id.clone();
        }
        let id = if self.numeric {
            (self.ids.len() + 1).to_string()
        } else {
            key.to_string()
        };
        self.ids.insert(key.to_string(), id.clone());
        self.examples.insert(
            id.clone(),
            SymbolExample {
                example: message.to_string(),
                parsed: key.to_string(),
                source: source.to_string(),
                request: false,
                response: false,
                legend: String::new(),
            },
        );
        debug!(id = %id, key, "new output symbol");
        if let Err(e) = self.write_alphabet() {
            warn!(error = %e, "could not persist output alphabet");
        }
        id
    }

    /// Write every table file now.
    pub fn flush(&self) -> Result<(), FuzzError> {
        self.write_alphabet()?;
        self.write_parser_errors()
    }

    fn write_alphabet(&self) -> Result<(), FuzzError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        write_json(&dir.join(ALPHABET_FILE), &self.ids)?;
        write_json(&dir.join(EXAMPLES_FILE), &self.examples)
    }

    fn write_parser_errors(&self) -> Result<(), FuzzError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(dir.join(PARSER_ERRORS_FILE))?;
        for error in &self.parser_errors {
            writer.write_record([error])?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FuzzError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{JsonParser, StringParser};

    #[test]
    fn test_ids_assigned_in_first_seen_order() {
        let mut table = SymbolTable::in_memory();
        assert_eq!(table.symbol(&StringParser, "a", PhaseKind::Request, "ep"), "1");
        assert_eq!(table.symbol(&StringParser, "b", PhaseKind::Response, "ep"), "2");
        assert_eq!(table.symbol(&StringParser, "a", PhaseKind::Response, "ep"), "1");
        let example = &table.examples()["1"];
        assert!(example.request && example.response);
    }

    #[test]
    fn test_parse_failure_is_recorded() {
        let mut table = SymbolTable::in_memory();
        let parser = JsonParser::new().unwrap();
        assert_eq!(
            table.symbol(&parser, "oops", PhaseKind::Request, "ep"),
            PARSE_ERROR
        );
        assert_eq!(table.parser_errors(), ["request:oops".to_string()]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_timeout_marker_bypasses_parser() {
        let mut table = SymbolTable::in_memory();
        let parser = JsonParser::new().unwrap();
        assert_eq!(
            table.symbol(&parser, "MITM_TIMEOUT", PhaseKind::Request, "ep"),
            "1"
        );
        assert_eq!(table.symbol(&parser, "", PhaseKind::Response, "ep"), "2");
    }

    #[test]
    fn test_verbatim_uses_keys() {
        let mut table = SymbolTable::in_memory().verbatim();
        assert_eq!(
            table.symbol(&StringParser, "allow", PhaseKind::Request, "ep"),
            "allow"
        );
    }
}
