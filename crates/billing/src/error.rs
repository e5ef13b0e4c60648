//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing Stripe signature header")]
    WebhookSignatureMissing,

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook timestamp outside tolerance")]
    WebhookTimestampOutOfRange,

    #[error("Malformed webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported webhook event: {0}")]
    WebhookEventNotSupported(String),

    #[error("Missing metadata field: {0}")]
    MissingMetadata(&'static str),

    #[error("Invalid metadata field {field}: {value}")]
    InvalidMetadata { field: &'static str, value: String },

    #[error("No user found for Stripe customer {0}")]
    CustomerNotFound(String),

    #[error("No subscription found for {0}")]
    SubscriptionNotFound(String),

    #[error("Gallery not found: {0}")]
    GalleryNotFound(String),

    #[error("Identity provider error: {0}")]
    Identity(String),

    #[error("Identity already exists for {0}")]
    IdentityAlreadyExists(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Analytics tracking failed: {0}")]
    Analytics(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors caused by the request itself rather than by processing it.
    /// The boundary answers these with 400 so the provider stops retrying.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureMissing
                | BillingError::WebhookSignatureInvalid
                | BillingError::WebhookTimestampOutOfRange
                | BillingError::InvalidPayload(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Internal(format!("HTTP request failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_request_errors_only() {
        assert!(BillingError::WebhookSignatureMissing.is_rejection());
        assert!(BillingError::WebhookSignatureInvalid.is_rejection());
        assert!(BillingError::InvalidPayload("eof".into()).is_rejection());
        assert!(!BillingError::Database("down".into()).is_rejection());
        assert!(!BillingError::CustomerNotFound("cus_1".into()).is_rejection());
    }
}
