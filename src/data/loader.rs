//! Loading raw instruction records from disk

use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};
use crate::prompt::RawRecord;

/// Load raw records from a JSONL file or a JSON array file.
///
/// Files whose first non-blank character is `[` are read as a single array;
/// anything else as one object per line, skipping blank lines.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::invalid_input(format!(
            "dataset not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let records = parse_records(&content)?;
    info!(
        "Loaded {} records from {}",
        records.len(),
        path.display()
    );
    Ok(records)
}

/// Parse raw records from JSONL or JSON array text
pub fn parse_records(content: &str) -> Result<Vec<RawRecord>> {
    if content.trim_start().starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(content)?;
        return values
            .iter()
            .enumerate()
            .map(|(i, value)| RawRecord::from_value(i, value))
            .collect();
    }

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let value: Value = serde_json::from_str(line).map_err(|e| {
                Error::invalid_input(format!("record {}: invalid JSON: {}", i, e))
            })?;
            RawRecord::from_value(i, &value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const JSONL: &str = r#"{"instruction": "Name a primary color.", "context": "", "response": "Red.", "category": "open_qa"}

{"instruction": "Summarize.", "context": "Rust has no GC.", "response": "No GC.", "category": "summarization"}
"#;

    #[test]
    fn test_parse_jsonl_skips_blank_lines() {
        let records = parse_records(JSONL).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].context, "Rust has no GC.");
    }

    #[test]
    fn test_parse_json_array() {
        let records = parse_records(
            r#"[{"instruction": "a", "response": "b"}, {"instruction": "c", "response": "d"}]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].instruction, "c");
    }

    #[test]
    fn test_missing_field_fails_whole_load() {
        let content = "{\"instruction\": \"a\", \"response\": \"b\"}\n{\"response\": \"d\"}\n";
        match parse_records(content) {
            Err(Error::MissingField { field, index }) => {
                assert_eq!(field, "instruction");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_json_line() {
        assert!(matches!(
            parse_records("{not json}\n"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_load_records_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(JSONL.as_bytes()).unwrap();

        let records = load_records(file.path()).unwrap();
        assert_eq!(records[0].category, "open_qa");
    }

    #[test]
    fn test_missing_file() {
        assert!(load_records("/nonexistent/dolly.jsonl").is_err());
    }
}
