use axum::{body::Bytes, extract::Extension, http::HeaderMap, http::StatusCode};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, warn};

use crate::billing::{self, BillingEventProcessor};
use crate::config;

/// key: webhooks-billing -> signed provider entrypoint
///
/// Transport contract: 200 for processed or intentionally-ignored events,
/// 400 for anything unverifiable or malformed, 500 for processing failures
/// (the provider retries later, which is safe given idempotent handlers).
pub async fn stripe_webhook(
    Extension(processor): Extension<BillingEventProcessor>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;

    let now = Utc::now().timestamp();
    if let Err(err) = verify_signature(
        config::STRIPE_WEBHOOK_SECRET.as_str(),
        signature,
        &body,
        now,
        *config::WEBHOOK_SIGNATURE_TOLERANCE_SECS,
    ) {
        // Rejected before any processing; zero side effects.
        warn!(%err, "webhook signature rejected");
        return Err(StatusCode::BAD_REQUEST);
    }

    let event = billing::parse_event(&body).map_err(|err| {
        warn!(?err, "webhook payload rejected");
        StatusCode::BAD_REQUEST
    })?;

    let event_id = event.id.clone();
    let kind = event.kind.clone();
    if let Err(err) = processor.handle_event(event).await {
        error!(?err, %event_id, %kind, "billing event processing failed");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    Malformed,
    Expired,
    Mismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Malformed => write!(f, "malformed signature header"),
            SignatureError::Expired => write!(f, "signature timestamp outside tolerance"),
            SignatureError::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

/// Verify a `t=<timestamp>,v1=<hex>` signature header: HMAC-SHA256 over
/// `"{t}.{body}"` with the shared secret, within the timestamp tolerance.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(decoded) = hex::decode(value) {
                    candidates.push(decoded);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    for candidate in &candidates {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(candidate).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let header = sign("whsec_test", 1_700_000_000, b"{}");
        assert_eq!(
            verify_signature("whsec_test", &header, b"{}", 1_700_000_100, 300),
            Ok(())
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let header = sign("whsec_other", 1_700_000_000, b"{}");
        assert_eq!(
            verify_signature("whsec_test", &header, b"{}", 1_700_000_000, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign("whsec_test", 1_700_000_000, b"{\"a\":1}");
        assert_eq!(
            verify_signature("whsec_test", &header, b"{\"a\":2}", 1_700_000_000, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let header = sign("whsec_test", 1_700_000_000, b"{}");
        assert_eq!(
            verify_signature("whsec_test", &header, b"{}", 1_700_000_000 + 301, 300),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn garbage_header_is_malformed() {
        assert_eq!(
            verify_signature("whsec_test", "nonsense", b"{}", 0, 300),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature("whsec_test", "t=12,v2=ffff", b"{}", 12, 300),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn any_matching_v1_entry_passes() {
        let good = sign("whsec_test", 42, b"{}");
        let header = format!("t=42,v1=deadbeef,{}", good.split_once(',').unwrap().1);
        assert_eq!(verify_signature("whsec_test", &header, b"{}", 42, 300), Ok(()));
    }
}
