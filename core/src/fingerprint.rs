//! Content fingerprints for findings and idempotency keys for events.
//!
//! A finding fingerprint is the SHA-256 (hex) of a canonical JSON document
//! `{"evidence": …, "finding_type": …, "url": scheme://host/path}`. Object
//! keys are emitted in lexicographic order at every depth and null members
//! are dropped, so evidence key order never changes the digest.

use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::model::NewFinding;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical JSON encoding: sorted keys, nulls omitted from objects, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.iter().filter(|(_, v)| !v.is_null()).map(|(k, _)| k).collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// `scheme://host/path` with scheme and host lowercased; port, query and fragment dropped.
pub fn url_identity(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(u) => format!("{}://{}{}", u.scheme(), u.host_str().unwrap_or("").to_ascii_lowercase(), u.path()),
        Err(_) => raw.trim().to_string(),
    }
}

pub fn finding_fingerprint(finding_type: &str, url: &str, evidence: &Value) -> String {
    let doc = serde_json::json!({
        "finding_type": finding_type,
        "url": url_identity(url),
        "evidence": evidence,
    });
    sha256_hex(canonical_json(&doc).as_bytes())
}

impl NewFinding {
    pub fn fingerprint(&self) -> String {
        finding_fingerprint(&self.finding_type, &self.url, &self.evidence)
    }
}

pub fn payload_hash(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

fn join_key(parts: &[&str]) -> String {
    sha256_hex(parts.join("\u{1f}").as_bytes())
}

/// Key for an externally triggered transition.
pub fn event_key(audit_id: &str, event_type: &str, resource_id: &str, payload_hash: &str) -> String {
    join_key(&[audit_id, event_type, resource_id, payload_hash])
}

/// Key for one detector task execution.
pub fn task_key(audit_id: &str, detector_name: &str, inputs: &Value) -> String {
    join_key(&[audit_id, detector_name, &payload_hash(inputs)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evidence_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"header":"csp","value":{"b":1,"a":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"value":{"a":2,"b":1},"header":"csp"}"#).unwrap();
        assert_eq!(
            finding_fingerprint("missing_csp", "https://Example.com/x", &a),
            finding_fingerprint("missing_csp", "https://example.com/x", &b)
        );
    }

    #[test]
    fn nulls_are_omitted() {
        let a = json!({"header": "csp", "note": null});
        let b = json!({"header": "csp"});
        assert_eq!(finding_fingerprint("t", "https://a.test/", &a), finding_fingerprint("t", "https://a.test/", &b));
    }

    #[test]
    fn query_and_port_do_not_split_identity() {
        assert_eq!(url_identity("https://A.test:8443/p?q=1#f"), "https://a.test/p");
    }

    #[test]
    fn fingerprint_is_64_hex() {
        let fp = finding_fingerprint("t", "https://a.test/", &json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn canonical_sorts_nested() {
        assert_eq!(canonical_json(&json!({"b": [1, {"d": 1, "c": 2}], "a": "x"})), r#"{"a":"x","b":[1,{"c":2,"d":1}]}"#);
    }

    #[test]
    fn keys_distinguish_parts() {
        assert_ne!(event_key("a", "b", "c", "d"), event_key("a", "bc", "", "d"));
        assert_eq!(task_key("a", "headers", &json!({"x": 1})), task_key("a", "headers", &json!({"x": 1})));
    }
}
