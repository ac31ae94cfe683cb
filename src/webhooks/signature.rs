//! Payload canonicalization and HMAC signing.
//!
//! The wire payload is canonical JSON: UTF-8, lexicographically sorted
//! object keys, no insignificant whitespace. The signature is
//! HMAC-SHA256 over the canonical bytes *with the `signature` member
//! omitted*, hex-encoded lowercase, then inserted as the `signature`
//! member. Receivers reverse the process and compare in constant time.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Build the unsigned wire payload for one delivery attempt.
///
/// Keys sort canonically at serialization time; this function only decides
/// the members: `id`, `event`, `timestamp`, `data`, `webhookId`, `userId`,
/// `attempt`.
pub fn build_payload(
    delivery_id: &str,
    event_type: &str,
    timestamp: DateTime<Utc>,
    data: &Value,
    webhook_id: &str,
    user_id: &str,
    attempt: u32,
) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(delivery_id.to_string()));
    map.insert("event".to_string(), Value::String(event_type.to_string()));
    map.insert(
        "timestamp".to_string(),
        Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    map.insert("data".to_string(), data.clone());
    map.insert("webhookId".to_string(), Value::String(webhook_id.to_string()));
    map.insert("userId".to_string(), Value::String(user_id.to_string()));
    map.insert("attempt".to_string(), Value::Number(attempt.into()));
    Value::Object(map)
}

/// Canonical bytes of a JSON value: compact, keys sorted (the crate's map
/// is ordered, so serialization is already canonical).
pub fn canonical_bytes(value: &Value) -> CoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CoreError::Internal(e.to_string()))
}

/// HMAC-SHA256 over bytes, lowercase hex.
pub fn sign(secret: &[u8], canonical: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(canonical);
    hex::encode(mac.finalize().into_bytes())
}

/// Produce the signed payload string and its signature for one attempt.
pub fn signed_payload(unsigned: &Value, secret: &[u8]) -> CoreResult<(String, String)> {
    let canonical = canonical_bytes(unsigned)?;
    let signature = sign(secret, &canonical);

    let mut signed = unsigned.clone();
    match signed.as_object_mut() {
        Some(map) => {
            map.insert("signature".to_string(), Value::String(signature.clone()));
        }
        None => {
            return Err(CoreError::Internal("payload must be an object".into()));
        }
    }
    let payload = serde_json::to_string(&signed).map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok((payload, signature))
}

/// Re-sign an existing payload for a new attempt number. Everything but
/// `attempt` and `signature` is byte-identical across retries.
pub fn resign_for_attempt(payload: &str, secret: &[u8], attempt: u32) -> CoreResult<(String, String)> {
    let mut value: Value = serde_json::from_str(payload)
        .map_err(|e| CoreError::MalformedInput(format!("payload is not JSON: {}", e)))?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| CoreError::MalformedInput("payload is not an object".into()))?;
    map.remove("signature");
    map.insert("attempt".to_string(), Value::Number(attempt.into()));
    signed_payload(&value, secret)
}

/// Verify a signed payload string. Parses, removes `signature`, recomputes,
/// and compares in constant time.
pub fn verify_payload(payload: &str, secret: &[u8]) -> bool {
    let Ok(mut value) = serde_json::from_str::<Value>(payload) else {
        return false;
    };
    let Some(map) = value.as_object_mut() else {
        return false;
    };
    let Some(Value::String(claimed)) = map.remove("signature") else {
        return false;
    };
    let Ok(canonical) = canonical_bytes(&value) else {
        return false;
    };
    constant_time_eq(sign(secret, &canonical).as_bytes(), claimed.as_bytes())
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a fresh webhook secret: 32 random bytes, lowercase hex.
pub fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_unsigned() -> Value {
        build_payload(
            "dl-1",
            "goal.completed",
            Utc.with_ymd_and_hms(2025, 4, 1, 9, 30, 0).unwrap(),
            &json!({"goalId": "g1", "title": "ship it"}),
            "wh-1",
            "user-1",
            1,
        )
    }

    #[test]
    fn canonical_keys_are_sorted() {
        let (payload, _) = signed_payload(&sample_unsigned(), b"secret").unwrap();
        let positions: Vec<usize> = [
            "\"attempt\"",
            "\"data\"",
            "\"event\"",
            "\"id\"",
            "\"signature\"",
            "\"timestamp\"",
            "\"userId\"",
            "\"webhookId\"",
        ]
        .iter()
        .map(|k| payload.find(k).unwrap())
        .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "members must appear in sorted order");
        assert!(!payload.contains(": "), "no insignificant whitespace");
    }

    #[test]
    fn signature_round_trips() {
        let (payload, signature) = signed_payload(&sample_unsigned(), b"topsecret").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(verify_payload(&payload, b"topsecret"));
        assert!(!verify_payload(&payload, b"wrong"));
    }

    #[test]
    fn tampering_breaks_verification() {
        let (payload, _) = signed_payload(&sample_unsigned(), b"topsecret").unwrap();
        let tampered = payload.replace("ship it", "ship it twice");
        assert!(!verify_payload(&tampered, b"topsecret"));
    }

    #[test]
    fn resign_changes_only_attempt_and_signature() {
        let secret = b"topsecret";
        let (first, sig1) = signed_payload(&sample_unsigned(), secret).unwrap();
        let (second, sig2) = resign_for_attempt(&first, secret, 2).unwrap();

        assert_ne!(sig1, sig2);
        assert!(verify_payload(&second, secret));

        let a: Value = serde_json::from_str(&first).unwrap();
        let b: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(b["attempt"], json!(2));
        assert_eq!(a["data"], b["data"]);
        assert_eq!(a["id"], b["id"]);
        assert_eq!(a["timestamp"], b["timestamp"]);
    }

    #[test]
    fn resigning_same_attempt_is_deterministic() {
        let secret = b"topsecret";
        let (first, sig1) = signed_payload(&sample_unsigned(), secret).unwrap();
        let (again, sig_again) = resign_for_attempt(&first, secret, 1).unwrap();
        assert_eq!(first, again);
        assert_eq!(sig1, sig_again);
    }

    #[test]
    fn generated_secrets_are_64_hex_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_secret(), secret);
    }

    #[test]
    fn verify_rejects_garbage() {
        assert!(!verify_payload("not json", b"secret"));
        assert!(!verify_payload("{}", b"secret"));
        assert!(!verify_payload("[1,2,3]", b"secret"));
    }
}
