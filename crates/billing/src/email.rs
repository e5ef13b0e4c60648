//! Billing email notifications
//!
//! Sent through the Resend HTTP API. Every send is best-effort from the
//! pipeline's point of view: callers log failures and carry on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Notifications produced by the webhook pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEmail {
    /// Account created at checkout, carrying the temporary password
    WelcomeWithPassword {
        to: String,
        name: String,
        gallery_name: Option<String>,
        temporary_password: String,
        login_url: String,
    },
    /// First recurring payment confirmed
    PaymentReceipt {
        to: String,
        name: String,
        amount_cents: i64,
        currency: String,
        gallery_name: Option<String>,
    },
    /// Dunning notice after a failed invoice
    PaymentFailed {
        to: String,
        name: String,
        amount_due_cents: i64,
        currency: String,
        days_remaining: i64,
        months_remaining: i64,
        portal_url: String,
    },
    /// Gallery access restored after a suspended subscription paid
    AccessRestored {
        to: String,
        name: String,
        gallery_name: Option<String>,
        photographer_name: Option<String>,
        gallery_url: String,
    },
    /// Photographer joined the beta program
    BetaWelcome {
        to: String,
        name: String,
        locked_price_cents: i64,
        dashboard_url: String,
    },
}

impl BillingEmail {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingEmail::WelcomeWithPassword { .. } => "welcome_with_password",
            BillingEmail::PaymentReceipt { .. } => "payment_receipt",
            BillingEmail::PaymentFailed { .. } => "payment_failed",
            BillingEmail::AccessRestored { .. } => "access_restored",
            BillingEmail::BetaWelcome { .. } => "beta_welcome",
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            BillingEmail::WelcomeWithPassword { to, .. }
            | BillingEmail::PaymentReceipt { to, .. }
            | BillingEmail::PaymentFailed { to, .. }
            | BillingEmail::AccessRestored { to, .. }
            | BillingEmail::BetaWelcome { to, .. } => to,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            BillingEmail::WelcomeWithPassword { gallery_name, .. } => match gallery_name {
                Some(gallery) => format!("Your PhotoVault gallery \"{}\" is ready", gallery),
                None => "Welcome to PhotoVault".to_string(),
            },
            BillingEmail::PaymentReceipt { .. } => "Payment received - thank you".to_string(),
            BillingEmail::PaymentFailed { days_remaining, .. } => format!(
                "Action required: payment failed ({} days until suspension)",
                days_remaining
            ),
            BillingEmail::AccessRestored { .. } => "Your gallery access is restored".to_string(),
            BillingEmail::BetaWelcome { .. } => "Welcome to the PhotoVault beta".to_string(),
        }
    }

    pub fn html(&self) -> String {
        match self {
            BillingEmail::WelcomeWithPassword {
                name,
                gallery_name,
                temporary_password,
                login_url,
                ..
            } => {
                let gallery = gallery_name
                    .as_deref()
                    .map(|g| format!(" for <strong>{}</strong>", escape(g)))
                    .unwrap_or_default();
                format!(
                    "<p>Hi {},</p>\
                     <p>Thanks for your payment{}. We created a PhotoVault account so you can \
                     view your photos any time.</p>\
                     <p>Temporary password: <code>{}</code></p>\
                     <p><a href=\"{}\">Sign in</a> and change your password after your first login.</p>",
                    escape(name),
                    gallery,
                    escape(temporary_password),
                    login_url
                )
            }
            BillingEmail::PaymentReceipt {
                name,
                amount_cents,
                currency,
                gallery_name,
                ..
            } => format!(
                "<p>Hi {},</p><p>We received your payment of {}{}.</p>",
                escape(name),
                format_amount(*amount_cents, currency),
                gallery_name
                    .as_deref()
                    .map(|g| format!(" for {}", escape(g)))
                    .unwrap_or_default()
            ),
            BillingEmail::PaymentFailed {
                name,
                amount_due_cents,
                currency,
                days_remaining,
                months_remaining,
                portal_url,
                ..
            } => format!(
                "<p>Hi {},</p>\
                 <p>We couldn't process your payment of {}.</p>\
                 <p>Your galleries stay available for {} more days (about {} months). \
                 After that, access is suspended until the balance is paid.</p>\
                 <p><a href=\"{}\">Update your payment method</a></p>",
                escape(name),
                format_amount(*amount_due_cents, currency),
                days_remaining,
                months_remaining,
                portal_url
            ),
            BillingEmail::AccessRestored {
                name,
                gallery_name,
                photographer_name,
                gallery_url,
                ..
            } => {
                let gallery = gallery_name.as_deref().unwrap_or("your gallery");
                let by = photographer_name
                    .as_deref()
                    .map(|p| format!(" from {}", escape(p)))
                    .unwrap_or_default();
                format!(
                    "<p>Hi {},</p><p>Your payment went through and access to {}{} is restored.</p>\
                     <p><a href=\"{}\">Open your galleries</a></p>",
                    escape(name),
                    escape(gallery),
                    by,
                    gallery_url
                )
            }
            BillingEmail::BetaWelcome {
                name,
                locked_price_cents,
                dashboard_url,
                ..
            } => format!(
                "<p>Hi {},</p><p>You're in the PhotoVault beta. Your price is locked at {} per month \
                 for as long as you stay subscribed.</p><p><a href=\"{}\">Go to your dashboard</a></p>",
                escape(name),
                format_amount(*locked_price_cents, "usd"),
                dashboard_url
            ),
        }
    }
}

/// Render integer cents for humans
pub fn format_amount(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let value = format!("{}.{:02}", abs / 100, abs % 100);
    if currency.eq_ignore_ascii_case("usd") {
        format!("{}${}", sign, value)
    } else {
        format!("{}{} {}", sign, value, currency.to_uppercase())
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
pub trait BillingMailer: Send + Sync {
    async fn send(&self, email: &BillingEmail) -> BillingResult<()>;
}

/// Email configuration
#[derive(Clone)]
pub struct EmailConfig {
    /// Sending is disabled when unset
    pub resend_api_key: Option<String>,
    pub from_address: String,
    pub api_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "PhotoVault <billing@photovault.photo>".to_string()),
            api_url: RESEND_API_URL.to_string(),
        }
    }
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("resend_api_key", &self.resend_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("from_address", &self.from_address)
            .finish()
    }
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

/// Resend-backed mailer with retry on transient failures
#[derive(Clone)]
pub struct ResendMailer {
    config: EmailConfig,
    http: Client,
}

impl ResendMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    async fn post(&self, api_key: &str, request: &ResendRequest<'_>) -> BillingResult<()> {
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| BillingError::Email(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!("Resend returned {}: {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingMailer for ResendMailer {
    async fn send(&self, email: &BillingEmail) -> BillingResult<()> {
        let Some(api_key) = self.config.resend_api_key.as_deref() else {
            tracing::debug!(kind = email.kind(), "Email sending disabled, skipping");
            return Ok(());
        };

        let request = ResendRequest {
            from: &self.config.from_address,
            to: [email.recipient()],
            subject: email.subject(),
            html: email.html(),
        };

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .map(jitter)
            .take(2);
        Retry::start(strategy, || self.post(api_key, &request)).await?;

        tracing::info!(kind = email.kind(), "Billing email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dunning() -> BillingEmail {
        BillingEmail::PaymentFailed {
            to: "client@example.com".into(),
            name: "Sam".into(),
            amount_due_cents: 899,
            currency: "usd".into(),
            days_remaining: 180,
            months_remaining: 6,
            portal_url: "https://app.example.com/client/billing".into(),
        }
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(10000, "usd"), "$100.00");
        assert_eq!(format_amount(2205, "eur"), "22.05 EUR");
        assert_eq!(format_amount(-5, "USD"), "-$0.05");
    }

    #[test]
    fn test_dunning_renders_remaining_grace() {
        let email = dunning();
        assert!(email.subject().contains("180 days"));
        let html = email.html();
        assert!(html.contains("180 more days"));
        assert!(html.contains("about 6 months"));
        assert!(html.contains("/client/billing"));
        assert!(html.contains("$8.99"));
    }

    #[test]
    fn test_names_are_escaped() {
        let email = BillingEmail::AccessRestored {
            to: "x@example.com".into(),
            name: "<script>".into(),
            gallery_name: None,
            photographer_name: None,
            gallery_url: "https://app.example.com".into(),
        };
        assert!(!email.html().contains("<script>"));
    }

    #[tokio::test]
    async fn test_resend_gives_up_after_three_attempts() {
        let mut server = mockito::Server::new_async().await;
        let unavailable = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let mailer = ResendMailer::new(EmailConfig {
            resend_api_key: Some("re_test".into()),
            from_address: "billing@example.com".into(),
            api_url: format!("{}/emails", server.url()),
        });

        let result = mailer.send(&dunning()).await;
        assert!(matches!(result, Err(BillingError::Email(_))));
        unavailable.assert_async().await;
    }

    #[tokio::test]
    async fn test_resend_success() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/emails")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "to": ["client@example.com"],
                "from": "billing@example.com"
            })))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .expect(1)
            .create_async()
            .await;

        let mailer = ResendMailer::new(EmailConfig {
            resend_api_key: Some("re_test".into()),
            from_address: "billing@example.com".into(),
            api_url: format!("{}/emails", server.url()),
        });

        mailer.send(&dunning()).await.unwrap();
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_disabled_mailer_is_a_no_op() {
        let mailer = ResendMailer::new(EmailConfig {
            resend_api_key: None,
            from_address: "billing@example.com".into(),
            api_url: "http://127.0.0.1:9/emails".into(),
        });
        assert!(mailer.send(&dunning()).await.is_ok());
    }
}
