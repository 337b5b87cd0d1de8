//! Name lookup for parsers and fuzzers, resolved once at startup.

use crate::fuzzer::{FuzzTransform, NoFuzz, SimpleFuzzer};
use crate::parser::{
    JsonParser, MessageParser, StringLenParser, StringParser, XmlParser, XmlStringParser,
};
use crate::FuzzError;

pub const PARSERS: [&str; 5] = ["json", "string", "string_len", "xml", "xml_string"];
pub const FUZZERS: [&str; 2] = ["no_fuzz", "simple"];

/// Build the parser registered as `name`. A trailing `_parser` is ignored.
pub fn parser(name: &str) -> Result<Box<dyn MessageParser>, FuzzError> {
    let base = name.strip_suffix("_parser").unwrap_or(name);
    Ok(match base {
        "json" => Box::new(JsonParser::new()?),
        "string" => Box::new(StringParser),
        "string_len" => Box::new(StringLenParser),
        "xml" => Box::new(XmlParser::new()?),
        "xml_string" => Box::new(XmlStringParser::new()?),
        _ => return Err(FuzzError::UnknownParser(name.to_string())),
    })
}

/// Build the fuzzer registered as `name`. A trailing `_fuzzer` is ignored.
pub fn fuzzer(name: &str) -> Result<Box<dyn FuzzTransform>, FuzzError> {
    let base = name.strip_suffix("_fuzzer").unwrap_or(name);
    Ok(match base {
        "no_fuzz" => Box::new(NoFuzz),
        "simple" => Box::new(SimpleFuzzer::new()?),
        _ => return Err(FuzzError::UnknownFuzzer(name.to_string())),
    })
}
