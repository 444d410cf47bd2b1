//! Cache key construction.
//!
//! Keys are `server:tool:namespace:fingerprint` where the fingerprint is a
//! truncated digest of the canonicalized arguments, so argument object key
//! order never affects the key.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const FINGERPRINT_LEN: usize = 16;

/// Renders a JSON value with object keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Short deterministic digest of a tool-call argument object.
pub fn args_fingerprint(args: &Value) -> String {
    let digest = Sha256::digest(canonical_json(args).as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded[..FINGERPRINT_LEN].to_string()
}

/// Full cache key for one tool invocation.
pub fn cache_key(
    server_uuid: Uuid,
    tool_name: &str,
    namespace_uuid: Option<Uuid>,
    args: &Value,
) -> String {
    let namespace = namespace_uuid
        .map(|ns| ns.to_string())
        .unwrap_or_else(|| "default".to_string());
    format!(
        "{server_uuid}:{tool_name}:{namespace}:{}",
        args_fingerprint(args)
    )
}
