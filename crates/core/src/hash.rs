//! Content hashing of invocation arguments.
//!
//! The hash of an invocation's canonicalized argument mapping is the idempotency key
//! used by resume. Canonical form: objects with keys sorted bytewise, no whitespace,
//! scalars in serde_json's compact encoding. The index key is excluded, so identical
//! inputs at different positions hash the same.

use core::fmt::Write as _;

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::assemble::{Args, INDEX_KEY};

/// Canonical JSON text of `value`, independent of map insertion order.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Content hash of an invocation's arguments, ignoring [`INDEX_KEY`].
pub fn content_hash(args: &Args) -> String {
    let mut canonical = args.clone();
    canonical.remove(INDEX_KEY);
    sha256_hex(canonical_json(&JsonValue::Object(canonical)).as_bytes())
}
