//! JSON-with-comments front-end for configuration files.
//!
//! Instance configs may carry `//` line comments and `/* */` block
//! comments. Both are stripped before the data is handed to serde.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Parse JSONC input into a value.
pub fn from_str<T: DeserializeOwned>(input: &str) -> Result<T> {
    let stripped = strip_comments(input);
    serde_json::from_str(&stripped).context("parsing configuration JSON")
}

/// Remove `//` line comments and `/* */` block comments.
pub fn strip_comments(input: &str) -> String {
    // Line comments run to end of line.
    let mut without_lines = String::with_capacity(input.len());
    for line in input.split('\n') {
        match line.find("//") {
            Some(idx) => without_lines.push_str(&line[..idx]),
            None => without_lines.push_str(line),
        }
        without_lines.push('\n');
    }

    // Block comments may span lines.
    let bytes = without_lines.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut in_comment = false;
    let mut i = 0;
    while i < bytes.len() {
        if !in_comment && i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            in_comment = true;
            i += 2;
            continue;
        }
        if in_comment && i + 1 < bytes.len() && bytes[i] == b'*' && bytes[i + 1] == b'/' {
            in_comment = false;
            i += 2;
            continue;
        }
        if !in_comment {
            out.push(bytes[i]);
        }
        i += 1;
    }

    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn strips_line_comments() {
        let input = "{\n  \"name\": \"srv\" // the instance\n}";
        let value: Value = from_str(input).unwrap();
        assert_eq!(value["name"], "srv");
    }

    #[test]
    fn strips_block_comments() {
        let input = "{ /* header\n spans lines */ \"port\": 34197 }";
        let value: Value = from_str(input).unwrap();
        assert_eq!(value["port"], 34197);
    }

    #[test]
    fn plain_json_passes_through() {
        let input = r#"{"a": [1, 2, 3], "b": {"c": true}}"#;
        let value: Value = from_str(input).unwrap();
        assert_eq!(value["a"][2], 3);
        assert_eq!(value["b"]["c"], true);
    }

    #[test]
    fn rejects_garbage() {
        assert!(from_str::<Value>("// only a comment").is_err());
    }
}
