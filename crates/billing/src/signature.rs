//! Stripe webhook signature verification
//!
//! The `Stripe-Signature` header carries `t=<unix seconds>` and one or more
//! `v1=<hex hmac>` entries. The expected signature is HMAC-SHA256 over
//! `"{t}.{raw body}"` keyed with the endpoint secret. Comparison is constant
//! time and the timestamp must be recent, which bounds replay.
//!
//! The Stripe SDK check runs first. It only understands events for the API
//! version it was built against and a single `v1` entry, so a rejection falls
//! through to the manual HMAC check.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::Webhook;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::event::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
const TOLERANCE_SECS: i64 = 300;

/// Allowed clock skew for deliveries stamped in the future
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub v1_signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> BillingResult<Self> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                // Undecodable entries cannot match; skip them so a valid
                // sibling signature still verifies during secret rotation
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        v1_signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if v1_signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(Self {
            timestamp,
            v1_signatures,
        })
    }
}

/// Verifies webhook deliveries against the configured endpoint secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify a delivery and parse its envelope.
    ///
    /// The signature is checked over the exact request bytes before any JSON
    /// parsing happens.
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())?;

        serde_json::from_slice::<WebhookEvent>(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidPayload(e.to_string())
        })
    }

    fn verify_at(&self, payload: &[u8], signature: &str, now: i64) -> BillingResult<()> {
        let header = SignatureHeader::parse(signature)?;

        let age = now - header.timestamp;
        if age > TOLERANCE_SECS || age < -MAX_CLOCK_SKEW_SECS {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                age_secs = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookTimestampOutOfRange);
        }

        if self.sdk_accepts(payload, signature, now) {
            return Ok(());
        }

        let expected = self.compute_signature(header.timestamp, payload)?;
        let matched = header
            .v1_signatures
            .iter()
            .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())));

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    fn sdk_accepts(&self, payload: &[u8], signature: &str, now: i64) -> bool {
        let Ok(text) = std::str::from_utf8(payload) else {
            return false;
        };
        match Webhook::construct_event_with_timestamp(text, signature, &self.secret, now) {
            Ok(_) => {
                tracing::debug!("Stripe SDK verified webhook signature");
                true
            }
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Stripe SDK verification failed, trying manual verification"
                );
                false
            }
        }
    }

    fn compute_signature(&self, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::Config("webhook secret cannot key HMAC".to_string())
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Build a valid `Stripe-Signature` header for a payload (test fixtures)
#[cfg(any(test, feature = "testing"))]
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let verifier = WebhookVerifier::new(secret);
    let signature = verifier
        .compute_signature(timestamp, payload)
        .unwrap_or_default();
    format!("t={},v1={}", timestamp, hex::encode(signature))
}
