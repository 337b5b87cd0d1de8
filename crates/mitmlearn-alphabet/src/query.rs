use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::symbol::{InputSymbol, OutputSymbol, Sentinel};
use crate::AlphabetError;

/// Separator between symbols on the learner wire and in cache keys.
pub const SEPARATOR: char = ';';

/// An ordered sequence of input symbols.
///
/// Its `Display` form is the semicolon-joined wire string, which is also
/// the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    symbols: Vec<InputSymbol>,
}

impl Query {
    pub fn new(symbols: Vec<InputSymbol>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> &[InputSymbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// The first `n` symbols.
    pub fn prefix(&self, n: usize) -> Query {
        Query::new(self.symbols[..n.min(self.symbols.len())].to_vec())
    }

    /// The last `n` symbols.
    pub fn suffix(&self, n: usize) -> Query {
        let n = n.min(self.symbols.len());
        Query::new(self.symbols[self.symbols.len() - n..].to_vec())
    }

    /// `self ++ other`.
    pub fn concat(&self, other: &Query) -> Query {
        let mut symbols = self.symbols.clone();
        symbols.extend(other.symbols.iter().cloned());
        Query::new(symbols)
    }

    /// The cache key for this query.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Query {
    type Err = AlphabetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AlphabetError::EmptyQuery);
        }
        let symbols = s
            .split(SEPARATOR)
            .map(str::parse)
            .collect::<Result<Vec<InputSymbol>, _>>()?;
        Ok(Query::new(symbols))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, sym) in self.symbols.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            write!(f, "{sym}")?;
        }
        Ok(())
    }
}

/// An ordered sequence of output symbols, one per query position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    symbols: Vec<OutputSymbol>,
}

impl Response {
    pub fn new(symbols: Vec<OutputSymbol>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> &[OutputSymbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn push(&mut self, symbol: OutputSymbol) {
        self.symbols.push(symbol);
    }

    /// The first `n` symbols.
    pub fn prefix(&self, n: usize) -> Response {
        Response::new(self.symbols[..n.min(self.symbols.len())].to_vec())
    }

    /// Drop the first `n` symbols.
    pub fn skip(&self, n: usize) -> Response {
        Response::new(self.symbols[n.min(self.symbols.len())..].to_vec())
    }

    /// Extend with `sentinel` until the response holds `len` symbols.
    pub fn padded(mut self, sentinel: Sentinel, len: usize) -> Response {
        while self.symbols.len() < len {
            self.symbols.push(OutputSymbol::Sentinel(sentinel));
        }
        self
    }

    /// First position holding an absorbing symbol, with the sentinel it absorbs into.
    pub fn first_absorption(&self) -> Option<(usize, Sentinel)> {
        self.symbols
            .iter()
            .enumerate()
            .find_map(|(i, sym)| sym.absorption().map(|s| (i, s)))
    }
}

impl FromStr for Response {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Response::default());
        }
        let symbols = s
            .split(SEPARATOR)
            .map(|sym| sym.parse::<OutputSymbol>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Response::new(symbols))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, sym) in self.symbols.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            write!(f, "{sym}")?;
        }
        Ok(())
    }
}

impl FromIterator<OutputSymbol> for Response {
    fn from_iter<I: IntoIterator<Item = OutputSymbol>>(iter: I) -> Self {
        Response::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_display_matches_wire() {
        let q: Query = "m-allow-rr;m-ep-killreq-rr".parse().unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.key(), "m-allow-rr;m-ep-killreq-rr");
    }

    #[test]
    fn test_empty_query_rejected() {
        assert!(matches!(
            "".parse::<Query>(),
            Err(AlphabetError::EmptyQuery)
        ));
    }

    #[test]
    fn test_malformed_symbol_in_query() {
        let err = "m-allow-rr;m-allow".parse::<Query>().unwrap_err();
        assert!(matches!(err, AlphabetError::MalformedInput { .. }));
    }

    #[test]
    fn test_prefix_and_suffix() {
        let q: Query = "m-a-rr;m-b-rr;m-c-rr".parse().unwrap();
        assert_eq!(q.prefix(2).key(), "m-a-rr;m-b-rr");
        assert_eq!(q.suffix(1).key(), "m-c-rr");
        assert_eq!(q.prefix(1).concat(&q.suffix(2)), q);
    }

    #[test]
    fn test_response_padding() {
        let r: Response = "0-1-2;term".parse().unwrap();
        let padded = r.padded(Sentinel::Term, 4);
        assert_eq!(padded.to_string(), "0-1-2;term;term;term");
    }

    #[test]
    fn test_first_absorption() {
        let r: Response = "0-1-2;0-3-null;noflow".parse().unwrap();
        assert_eq!(r.first_absorption(), Some((1, Sentinel::NoFlow)));
        let r: Response = "0-1-2;0-3-4".parse().unwrap();
        assert_eq!(r.first_absorption(), None);
    }
}
