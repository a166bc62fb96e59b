// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-canon
#![deny(unsafe_code)]
#![warn(missing_docs)]

use apg_core::Action;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors from canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonError {
    /// A number was NaN or infinite and has no canonical form.
    #[error("non-finite number has no canonical form")]
    NonFiniteNumber,
}

/// Produce the canonical JSON form of a value.
///
/// Rules:
/// - object keys sorted lexicographically (byte order), regardless of
///   insertion order;
/// - compact separators (`,` and `:`), no whitespace;
/// - every non-ASCII and control character escaped as `\uXXXX`
///   (surrogate pairs for characters outside the BMP);
/// - integers serialized as integers, finite floats in their shortest
///   round-trip form; NaN and infinity rejected.
///
/// Canonicalization is idempotent and two structurally equal values always
/// produce identical bytes.
///
/// # Errors
///
/// Returns [`CanonError::NonFiniteNumber`] for NaN or infinite floats.
///
/// # Examples
///
/// ```
/// let a = serde_json::json!({"b": 1, "a": {"y": [1, 2], "x": "é"}});
/// let s = apg_canon::canonicalize(&a).unwrap();
/// assert_eq!(s, "{\"a\":{\"x\":\"\\u00e9\",\"y\":[1,2]},\"b\":1}");
/// ```
pub fn canonicalize(value: &Value) -> Result<String, CanonError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

fn write_value(out: &mut String, value: &Value) -> Result<(), CanonError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                let f = n.as_f64().ok_or(CanonError::NonFiniteNumber)?;
                if !f.is_finite() {
                    return Err(CanonError::NonFiniteNumber);
                }
                // Rust's Display for f64 is the shortest representation that
                // round-trips; integral floats render without a fraction.
                out.push_str(&f.to_string());
            }
        }
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// SHA-256 over the canonical form of `value`.
///
/// # Errors
///
/// Returns [`CanonError::NonFiniteNumber`] if the value cannot be
/// canonicalized.
pub fn hash_value(value: &Value) -> Result<[u8; 32], CanonError> {
    let canonical = canonicalize(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

/// The cryptographic identity of an action.
///
/// Hashes the canonical form of the `{type, tool, params, amount?,
/// currency?}` object. Absent optionals are omitted rather than serialized as
/// null, and `description`, counterparty, and request context never
/// participate.
///
/// # Examples
///
/// ```
/// use apg_core::Action;
///
/// let a: Action = serde_json::from_value(serde_json::json!({
///     "type": "email", "tool": "send_email", "params": {"to": "u@x.com"},
/// })).unwrap();
/// let mut b = a.clone();
/// b.description = Some("weekly digest".into());
/// assert_eq!(apg_canon::action_hash(&a), apg_canon::action_hash(&b));
/// ```
#[must_use]
pub fn action_hash(action: &Action) -> [u8; 32] {
    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), Value::String(action.action_type.clone()));
    obj.insert("tool".into(), Value::String(action.tool.clone()));
    obj.insert("params".into(), Value::Object(action.params.clone()));
    if let Some(amount) = action.amount {
        if let Some(n) = serde_json::Number::from_f64(amount) {
            obj.insert("amount".into(), Value::Number(n));
        }
    }
    if let Some(currency) = &action.currency {
        obj.insert("currency".into(), Value::String(currency.clone()));
    }
    // Params came through serde_json and amounts are finite by construction,
    // so canonicalization cannot fail here.
    hash_value(&Value::Object(obj)).unwrap_or([0u8; 32])
}

/// Hex form of [`action_hash`].
#[must_use]
pub fn action_hash_hex(action: &Action) -> String {
    to_hex(&action_hash(action))
}

/// Lowercase hex encoding of a 32-byte digest.
#[must_use]
pub fn to_hex(digest: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in digest {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// SHA-256 over raw bytes, hex encoded. Used for token hashes and chain links.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    to_hex(&digest)
}
