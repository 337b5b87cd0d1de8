use std::fs;

use mitmlearn_fuzz::registry;
use mitmlearn_fuzz::table::{ALPHABET_FILE, EXAMPLES_FILE, PARSER_ERRORS_FILE};
use mitmlearn_fuzz::{FuzzError, SymbolTable, PARSE_ERROR};
use mitmlearn_transport::PhaseKind;

#[test]
fn test_table_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let parser = registry::parser("json").unwrap();
    {
        let mut table = SymbolTable::persistent(dir.path());
        assert_eq!(
            table.symbol(parser.as_ref(), r#"{"hello":1}"#, PhaseKind::Request, "ep"),
            "1"
        );
        assert_eq!(
            table.symbol(parser.as_ref(), r#"{"bye":1}"#, PhaseKind::Response, "ep"),
            "2"
        );
    }

    let mut table = SymbolTable::load(dir.path()).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(
        table.symbol(parser.as_ref(), r#"{"hello":2}"#, PhaseKind::Request, "ep"),
        "1"
    );
    assert_eq!(
        table.symbol(parser.as_ref(), r#"[{"new":0}]"#, PhaseKind::Request, "ep"),
        "3"
    );
}

#[test]
fn test_load_rejects_empty_alphabet() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(ALPHABET_FILE), "{}").unwrap();
    fs::write(dir.path().join(EXAMPLES_FILE), "{}").unwrap();
    assert!(matches!(
        SymbolTable::load(dir.path()),
        Err(FuzzError::EmptyAlphabet)
    ));
}

#[test]
fn test_load_rejects_inconsistent_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(ALPHABET_FILE), r#"{"[\"a\"]":"1"}"#).unwrap();
    fs::write(
        dir.path().join(EXAMPLES_FILE),
        r#"{"1":{"example":"{}","parsed":"[\"b\"]","source":"ep","request":true,"response":false}}"#,
    )
    .unwrap();
    assert!(matches!(
        SymbolTable::load(dir.path()),
        Err(FuzzError::InconsistentAlphabet(id)) if id == "1"
    ));
}

#[test]
fn test_load_requires_files() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(SymbolTable::load(dir.path()), Err(FuzzError::Io(_))));
}

#[test]
fn test_parser_errors_written_as_csv() {
    let dir = tempfile::tempdir().unwrap();
    let parser = registry::parser("json_parser").unwrap();
    let mut table = SymbolTable::persistent(dir.path());
    assert_eq!(
        table.symbol(parser.as_ref(), "7", PhaseKind::Response, "ep"),
        PARSE_ERROR
    );
    let text = fs::read_to_string(dir.path().join(PARSER_ERRORS_FILE)).unwrap();
    assert_eq!(text.trim(), "response:7");
}
