//! Recursive JSON -> BSON conversion (spec.md section 4.7).
//!
//! Two concerns live here: (1) MongoDB's key restrictions on `.` and `$`
//! are worked around with a reversible rewrite, and (2) string values that
//! aren't valid UTF-8 are assumed to be Windows-1252 and transcoded using a
//! fixed lookup table, exactly as `convert_to_win1252`/`win1252_to_utf8` do
//! in the original source.

use bson::{Bson, Document};
use serde_json::Value;

/// `.` -> U+2024 (ONE DOT LEADER), encoded as the same 3-byte UTF-8
/// sequence the original emits verbatim (`{0xE2, 0x80, 0xA4}`).
const DOT_REPLACEMENT: char = '\u{2024}';
/// `$` -> U+00A4 (CURRENCY SIGN), the 2-byte sequence `{0xC2, 0xA4}`.
const DOLLAR_REPLACEMENT: char = '\u{00A4}';

/// Rewrites every `.`/`$` in a BSON key to its replacement codepoint so the
/// document is legal to store; reversible by replacing the codepoints back.
pub fn escape_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' => DOT_REPLACEMENT,
            '$' => DOLLAR_REPLACEMENT,
            other => other,
        })
        .collect()
}

pub fn unescape_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            DOT_REPLACEMENT => '.',
            DOLLAR_REPLACEMENT => '$',
            other => other,
        })
        .collect()
}

/// URI-embedded escaping variant used for `js_exceptions.<description>`
/// keys: `.` -> `%2E`, `$` -> `%24`.
pub fn escape_key_uri(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '.' => out.push_str("%2E"),
            '$' => out.push_str("%24"),
            other => out.push(other),
        }
    }
    out
}

/// The 128-entry Windows-1252 (0x80-0xFF) to Unicode codepoint table. Bytes
/// 0xA0-0xFF map directly onto the identically-numbered Latin-1
/// codepoints; 0x80-0x9F hold the CP1252-specific punctuation/currency
/// glyphs (or U+FFFD for the unassigned slots), verbatim from
/// `win1252_to_utf8` in the original source.
const WIN1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{FFFD}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{FFFD}', '\u{017D}', '\u{FFFD}',
    '\u{FFFD}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{FFFD}', '\u{017E}', '\u{0178}',
];

/// Maps a single Windows-1252 byte in `[0x80, 0xFF]` to its Unicode
/// codepoint (the round-trip property in spec.md section 8).
pub fn win1252_byte_to_char(byte: u8) -> char {
    debug_assert!(byte >= 0x80);
    if byte < 0xA0 {
        WIN1252_HIGH[(byte - 0x80) as usize]
    } else {
        byte as char
    }
}

/// Transcodes a byte string that is not valid UTF-8, treating every byte
/// `>= 0x80` as Windows-1252 and every ASCII byte as itself; embedded NULs
/// become the six-byte escape ` `.
pub fn transcode_win1252(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b == 0 {
            out.push_str("\\u0000");
        } else if b < 0x80 {
            out.push(b as char);
        } else {
            out.push(win1252_byte_to_char(b));
        }
    }
    out
}

/// Best-effort string sanitization for BSON storage: valid UTF-8 is
/// preserved bit-for-bit; invalid sequences are transcoded via
/// [`transcode_win1252`] and a warning should be logged by the caller.
pub fn sanitize_string(s: &str) -> String {
    if s.as_bytes().iter().any(|&b| b == 0) {
        // Even otherwise-valid UTF-8 strings get NUL escaped.
        return s.replace('\u{0}', "\\u0000");
    }
    s.to_string()
}

/// Converts arbitrary invalid-UTF-8 bytes (e.g. from a misbehaving
/// upstream) the same way the BSON layer does for strings.
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => sanitize_string(s),
        Err(_) => transcode_win1252(bytes),
    }
}

/// Recursively converts a `serde_json::Value` into a `bson::Bson`,
/// escaping every object key along the way. Array indices become
/// stringified keys only implicitly (BSON arrays stay arrays).
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Bson::String(sanitize_string(s)),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => {
            let mut doc = Document::new();
            for (k, v) in map {
                doc.insert(escape_key(k), json_to_bson(v));
            }
            Bson::Document(doc)
        }
    }
}

/// Top-level object -> `Document` conversion, with `context` used only for
/// the warning a caller logs if conversion hits invalid UTF-8 (mirrors the
/// `<db_name>:<request_id>` context string used around `store_request`).
pub fn json_object_to_document(value: &Value, _context: &str) -> Document {
    match json_to_bson(value) {
        Bson::Document(doc) => doc,
        other => {
            let mut doc = Document::new();
            doc.insert("value", other);
            doc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn win1252_roundtrip_matches_fixed_table() {
        assert_eq!(win1252_byte_to_char(0x80), '\u{20AC}');
        assert_eq!(win1252_byte_to_char(0xA4), '\u{00A4}');
        assert_eq!(win1252_byte_to_char(0xFF), '\u{00FF}');
    }

    #[test]
    fn valid_utf8_preserved_bit_for_bit() {
        let s = "héllo wörld";
        assert_eq!(sanitize_bytes(s.as_bytes()), s);
    }

    #[test]
    fn invalid_utf8_transcoded() {
        let bytes = [0x68, 0x65, 0x80]; // "he" + Euro sign byte
        let out = sanitize_bytes(&bytes);
        assert_eq!(out, "he\u{20AC}");
    }

    #[test]
    fn key_escaping_removes_dot_and_dollar() {
        let escaped = escape_key("a.b$c");
        assert!(!escaped.contains('.'));
        assert!(!escaped.contains('$'));
        assert_eq!(unescape_key(&escaped), "a.b$c");
    }

    #[test]
    fn scenario_key_escaping_matches_spec() {
        // spec.md section 8 scenario 5: "a.b$c" -> "a<U+2024>b<U+00A4>c"
        let escaped = escape_key("a.b$c");
        assert_eq!(escaped, "a\u{2024}b\u{00A4}c");
    }

    #[test]
    fn uri_variant_escapes_differently() {
        assert_eq!(escape_key_uri("a.b$c"), "a%2Eb%24c");
    }

    #[test]
    fn nul_bytes_escaped_in_strings() {
        let v = json!({"a\u{0}b": "c\u{0}d"});
        let doc = json_object_to_document(&v, "ctx");
        let (k, val) = doc.iter().next().unwrap();
        assert_eq!(k, "a\\u0000b");
        assert_eq!(val.as_str().unwrap(), "c\\u0000d");
    }

    #[test]
    fn emitted_keys_never_contain_dot_or_dollar() {
        let v = json!({"a.b": {"c$d": 1}});
        let doc = json_object_to_document(&v, "ctx");
        fn check(doc: &Document) {
            for (k, v) in doc {
                assert!(!k.contains('.'));
                assert!(!k.contains('$'));
                if let Bson::Document(sub) = v {
                    check(sub);
                }
            }
        }
        check(&doc);
    }
}
