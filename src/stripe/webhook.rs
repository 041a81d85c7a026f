// Stripe webhook signature verification and event parsing

use crate::stripe::errors::WebhookError;
use crate::stripe::types::StripeEvent;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verifies the signature and decodes the event. Nothing downstream sees an unverified payload.
pub fn construct_event(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<StripeEvent, WebhookError> {
    verify_signature(payload, headers, webhook_secret, tolerance_seconds)?;
    serde_json::from_slice(payload)
        .map_err(|e| WebhookError::MalformedPayload(format!("JSON parse error: {}", e)))
}

/// Verify Stripe webhook signature using HMAC SHA-256
pub fn verify_signature(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<(), WebhookError> {
    if webhook_secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|e| WebhookError::InvalidSignature(format!("Invalid header encoding: {}", e)))?;

    // t=timestamp,v1=signature[,v1=signature2,...]
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {} // v0 and unknown schemes
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        WebhookError::InvalidSignature("Missing timestamp in signature header".to_string())
    })?;

    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature(
            "No v1 signature found".to_string(),
        ));
    }

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WebhookError::InvalidSignature(format!("System time error: {}", e)))?
        .as_secs() as i64;

    let time_diff = current_time.saturating_sub(timestamp).saturating_abs();
    if time_diff > tolerance_seconds {
        return Err(WebhookError::TimestampTolerance(format!(
            "Timestamp {} differs from current time {} by {} seconds (tolerance: {})",
            timestamp, current_time, time_diff, tolerance_seconds
        )));
    }

    let expected_signature = compute_signature(webhook_secret, timestamp, payload)?;

    let signature_valid = signatures.iter().any(|sig| {
        expected_signature.len() == sig.len()
            && expected_signature
                .as_bytes()
                .iter()
                .zip(sig.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    });

    if !signature_valid {
        return Err(WebhookError::InvalidSignature(
            "No signatures found matching the expected signature for payload".to_string(),
        ));
    }

    debug!(
        timestamp = timestamp,
        time_diff = time_diff,
        "Webhook signature verified successfully"
    );

    Ok(())
}

/// Hex HMAC-SHA256 over `"<timestamp>.<raw body>"`.
pub fn compute_signature(
    webhook_secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("HMAC init error: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn headers_for(value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, value.parse().unwrap());
        headers
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn test_verify_signature_valid() {
        let payload = br#"{"id":"evt_test","type":"checkout.session.completed","data":{"object":{}}}"#;
        let timestamp = 1234567890i64;
        let signature = compute_signature(SECRET, timestamp, payload).unwrap();
        let headers = headers_for(&format!("t={},v1={}", timestamp, signature));

        // With very large tolerance for testing
        let result = verify_signature(payload, &headers, SECRET, i64::MAX);
        assert!(result.is_ok());
    }

    #[test]
    fn test_verify_signature_accepts_any_matching_v1() {
        let payload = b"{}";
        let timestamp = now();
        let signature = compute_signature(SECRET, timestamp, payload).unwrap();
        let headers = headers_for(&format!("t={timestamp},v1=deadbeef,v0=ignored,v1={signature}"));

        assert!(verify_signature(payload, &headers, SECRET, 300).is_ok());
    }

    #[test]
    fn test_verify_signature_invalid() {
        let payload = br#"{"id":"evt_test","type":"checkout.session.completed"}"#;
        let timestamp = now();
        let signature = compute_signature("whsec_other", timestamp, payload).unwrap();
        let headers = headers_for(&format!("t={},v1={}", timestamp, signature));

        let result = verify_signature(payload, &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_signature_tampered_payload() {
        let timestamp = now();
        let signature = compute_signature(SECRET, timestamp, br#"{"amount":1}"#).unwrap();
        let headers = headers_for(&format!("t={},v1={}", timestamp, signature));

        let result = verify_signature(br#"{"amount":2}"#, &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_signature_missing_header() {
        let headers = http::HeaderMap::new();
        let result = verify_signature(b"test", &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn test_verify_signature_missing_timestamp() {
        let headers = headers_for("v1=abc");
        let result = verify_signature(b"test", &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_signature_timestamp_tolerance() {
        let payload = b"test";
        let old_timestamp = 1000i64;
        let signature = compute_signature(SECRET, old_timestamp, payload).unwrap();
        let headers = headers_for(&format!("t={},v1={}", old_timestamp, signature));

        let result = verify_signature(payload, &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::TimestampTolerance(_))));
    }

    #[test]
    fn test_construct_event_parses_verified_payload() {
        let payload = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{"id":"cs_1"}}}"#;
        let timestamp = now();
        let signature = compute_signature(SECRET, timestamp, payload).unwrap();
        let headers = headers_for(&format!("t={},v1={}", timestamp, signature));

        let evt = construct_event(payload, &headers, SECRET, 300).unwrap();
        assert_eq!(evt.event_type, "checkout.session.completed");
        assert_eq!(evt.data.object["id"], "cs_1");
    }

    #[test]
    fn test_construct_event_rejects_non_json() {
        let payload = b"not json";
        let timestamp = now();
        let signature = compute_signature(SECRET, timestamp, payload).unwrap();
        let headers = headers_for(&format!("t={},v1={}", timestamp, signature));

        let result = construct_event(payload, &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::MalformedPayload(_))));
    }
}
