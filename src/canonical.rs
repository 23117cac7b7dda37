//! Canonical, deterministic JSON serialization. Two documents with the same
//! logical content must canonicalize to byte-identical output under the
//! same [`CanonicalOptions`], regardless of how their `serde_json::Value`
//! was built or in what order its keys were inserted.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

/// How object keys are ordered when writing canonical output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrder {
    /// Unicode code point order (`str::cmp` on the key).
    CodePoint,
    /// The order keys were inserted in, as carried by `serde_json`'s
    /// `preserve_order`-enabled `Map`.
    Preserve,
    /// Named keys first, in the given order, then all remaining keys in
    /// code point order.
    Priority(Vec<String>),
}

/// Line ending used when writing canonical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eol {
    Lf,
    Crlf,
}

#[derive(Debug, Clone)]
pub struct CanonicalOptions {
    pub indent: usize,
    pub key_order: KeyOrder,
    pub eol: Eol,
    pub trailing_newline: bool,
}

impl Default for CanonicalOptions {
    fn default() -> Self {
        Self {
            indent: 2,
            key_order: KeyOrder::CodePoint,
            eol: Eol::Lf,
            trailing_newline: true,
        }
    }
}

/// Recursion depth past which a value is treated as pathologically deep.
/// `serde_json::Value` is an owned tree and cannot contain a true reference
/// cycle, but unbounded depth (e.g. a value built by code with a runaway
/// recursive constructor) is indistinguishable in effect from one, so this
/// guard stands in for the cycle check on an owned-tree representation.
const MAX_DEPTH: usize = 500;

/// Serializes `value` to canonical bytes under `opts`.
pub fn canonicalize(value: &Value, opts: &CanonicalOptions) -> Result<Vec<u8>> {
    let mut out = String::new();
    write_value(value, opts, 0, &mut out)?;
    if opts.eol == Eol::Crlf {
        out = lf_to_crlf(&out);
    }
    let mut bytes = out.into_bytes();
    if opts.trailing_newline {
        let newline: &[u8] = if opts.eol == Eol::Crlf { b"\r\n" } else { b"\n" };
        if !bytes.ends_with(newline) {
            bytes.extend_from_slice(newline);
        }
    }
    Ok(bytes)
}

/// Parses `bytes` as JSON, returning a [`StoreError::Parse`] on failure
/// rather than propagating `serde_json::Error` directly.
pub fn safe_parse(path: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Parse {
        path: path.to_string(),
        source,
    })
}

/// SHA-256 content hash of already-canonicalized bytes, lowercase hex.
pub fn content_hash(canonical_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Compact (no indentation, `KeyOrder::CodePoint`, no trailing newline)
/// canonical form used as an index sidecar bucket key for object values.
pub fn canonical_compact_string(value: &Value) -> Result<String> {
    let opts = CanonicalOptions {
        indent: 0,
        key_order: KeyOrder::CodePoint,
        eol: Eol::Lf,
        trailing_newline: false,
    };
    let mut out = String::new();
    write_compact(value, &opts, 0, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, opts: &CanonicalOptions, depth: usize, out: &mut String) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(StoreError::Cycle);
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return Ok(());
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline_and_indent(opts, depth + 1, out);
                write_value(item, opts, depth + 1, out)?;
            }
            newline_and_indent(opts, depth, out);
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            out.push('{');
            let keys = ordered_keys(map, &opts.key_order);
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline_and_indent(opts, depth + 1, out);
                write_json_string(key, out);
                out.push(':');
                out.push(' ');
                write_value(&map[*key], opts, depth + 1, out)?;
            }
            newline_and_indent(opts, depth, out);
            out.push('}');
        }
    }
    Ok(())
}

fn write_compact(value: &Value, opts: &CanonicalOptions, depth: usize, out: &mut String) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(StoreError::Cycle);
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_compact(item, opts, depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let keys = ordered_keys(map, &KeyOrder::CodePoint);
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_compact(&map[*key], opts, depth + 1, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn ordered_keys<'a>(map: &'a Map<String, Value>, order: &KeyOrder) -> Vec<&'a String> {
    match order {
        KeyOrder::Preserve => map.keys().collect(),
        KeyOrder::CodePoint => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys
        }
        KeyOrder::Priority(priority) => {
            let mut seen = std::collections::HashSet::new();
            let mut keys: Vec<&String> = Vec::with_capacity(map.len());
            for p in priority {
                if let Some((k, _)) = map.get_key_value(p.as_str()) {
                    if seen.insert(k.as_str()) {
                        keys.push(k);
                    }
                }
            }
            let mut rest: Vec<&String> = map
                .keys()
                .filter(|k| !seen.contains(k.as_str()))
                .collect();
            rest.sort();
            keys.extend(rest);
            keys
        }
    }
}

fn newline_and_indent(opts: &CanonicalOptions, depth: usize, out: &mut String) {
    out.push('\n');
    out.push_str(&" ".repeat(opts.indent * depth));
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn lf_to_crlf(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + s.len() / 32);
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            out.push('\r');
        }
        out.push(c);
    }
    out
}

/// A bounded-depth `serde_json::Value` generator for the property tests
/// below. Recursion is capped well under [`MAX_DEPTH`] so these tests
/// exercise everyday documents, not the depth guard itself (that has its
/// own dedicated unit test).
#[cfg(test)]
fn arb_value() -> impl proptest::strategy::Strategy<Value = Value> {
    use proptest::prelude::*;

    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9_]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(|items| Value::Array(items)),
            prop::collection::hash_map("[a-zA-Z_]{1,6}", inner, 0..4).prop_map(|map| {
                let mut object = Map::new();
                for (k, v) in map {
                    object.insert(k, v);
                }
                Value::Object(object)
            }),
        ]
    })
}
