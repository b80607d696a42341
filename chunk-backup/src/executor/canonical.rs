//! Canonical JSON encoding for backup metadata.
//!
//! Metadata objects must be byte-identical no matter which implementation
//! wrote them, so the layout is fixed: keys in sorted order (struct fields are
//! declared alphabetically), two-space indentation, `,` and `: ` separators,
//! no trailing newline, and every character outside printable ASCII escaped
//! as lowercase `\uXXXX`.

use serde::Serialize;
use serde_json::ser::Formatter;
use std::io::{self, Write};

const INDENT: &[u8] = b"  ";

#[derive(Default)]
struct CanonicalFormatter {
    depth: usize,
    has_value: bool,
}

impl CanonicalFormatter {
    fn newline<W: ?Sized + Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b"\n")?;
        for _ in 0..self.depth {
            writer.write_all(INDENT)?;
        }
        Ok(())
    }
}

impl Formatter for CanonicalFormatter {
    fn begin_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth += 1;
        self.has_value = false;
        writer.write_all(b"[")
    }

    fn end_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth -= 1;
        if self.has_value {
            self.newline(writer)?;
        }
        writer.write_all(b"]")
    }

    fn begin_array_value<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if !first {
            writer.write_all(b",")?;
        }
        self.newline(writer)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth += 1;
        self.has_value = false;
        writer.write_all(b"{")
    }

    fn end_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth -= 1;
        if self.has_value {
            self.newline(writer)?;
        }
        writer.write_all(b"}")
    }

    fn begin_object_key<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if !first {
            writer.write_all(b",")?;
        }
        self.newline(writer)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn write_string_fragment<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                let mut buf = [0u8; 1];
                writer.write_all(ch.encode_utf8(&mut buf).as_bytes())?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Serialize `value` in the canonical metadata layout.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut output = Vec::with_capacity(256);
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut output, CanonicalFormatter::default());
    value.serialize(&mut serializer)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: &serde_json::Value) -> String {
        String::from_utf8(to_canonical_json(value).unwrap()).unwrap()
    }

    #[test]
    fn test_nested_layout() {
        // serde_json's map is ordered by key unless preserve_order is enabled
        let value = json!({"b": [1, 2], "a": {"x": null}, "c": []});
        assert_eq!(
            encode(&value),
            "{\n  \"a\": {\n    \"x\": null\n  },\n  \"b\": [\n    1,\n    2\n  ],\n  \"c\": []\n}"
        );
    }

    #[test]
    fn test_empty_containers() {
        assert_eq!(encode(&json!({})), "{}");
        assert_eq!(encode(&json!([])), "[]");
    }

    #[test]
    fn test_non_ascii_is_escaped() {
        assert_eq!(encode(&json!("caf\u{e9}")), "\"caf\\u00e9\"");
        assert_eq!(encode(&json!("\u{1F600}")), "\"\\ud83d\\ude00\"");
        assert_eq!(encode(&json!("a\u{7f}b")), "\"a\\u007fb\"");
    }

    #[test]
    fn test_control_characters_keep_short_escapes() {
        assert_eq!(encode(&json!("a\nb\t\"c\"")), "\"a\\nb\\t\\\"c\\\"\"");
    }
}
