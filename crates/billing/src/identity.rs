//! Auth identity provisioning for buyers who check out without an account
//!
//! Backed by the Supabase GoTrue admin API, called with the service-role key
//! so the webhook can act on behalf of users without a session.

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Characters used for temporary passwords: no `0 O 1 l I`
pub const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789";

pub const TEMPORARY_PASSWORD_LEN: usize = 12;

/// Users fetched per page when scanning for an email
const LIST_PAGE_SIZE: usize = 1000;

/// Generate a temporary password for a provisioned identity
pub fn generate_temporary_password() -> String {
    let mut rng = rand::rng();
    (0..TEMPORARY_PASSWORD_LEN)
        .map(|_| PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
    pub role: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Case-insensitive lookup among all registered users
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Identity>>;

    /// Create an auto-confirmed identity.
    ///
    /// Returns [`BillingError::IdentityAlreadyExists`] when the email is
    /// already registered, which callers resolve by looking the user up again.
    async fn create(&self, identity: &NewIdentity) -> BillingResult<Identity>;
}

/// Identity provider configuration
#[derive(Clone)]
pub struct IdentityConfig {
    pub supabase_url: String,
    pub service_role_key: String,
}

impl IdentityConfig {
    pub fn from_env() -> BillingResult<Self> {
        let supabase_url = std::env::var("SUPABASE_URL")
            .map_err(|_| BillingError::Config("SUPABASE_URL not set".to_string()))?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| BillingError::Config("SUPABASE_SERVICE_ROLE_KEY not set".to_string()))?;

        Ok(Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            service_role_key,
        })
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("supabase_url", &self.supabase_url)
            .field("service_role_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ListUsersResponse {
    #[serde(default)]
    users: Vec<Identity>,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    email: &'a str,
    password: &'a str,
    email_confirm: bool,
    user_metadata: serde_json::Value,
}

/// Supabase GoTrue admin client
#[derive(Clone)]
pub struct SupabaseIdentityProvider {
    config: IdentityConfig,
    http: Client,
}

impl SupabaseIdentityProvider {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            http: Client::new(),
        }
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}/auth/v1/admin/{}", self.config.supabase_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.config.service_role_key)
            .bearer_auth(&self.config.service_role_key)
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentityProvider {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Identity>> {
        let needle = email.trim().to_lowercase();
        let mut page = 1usize;

        loop {
            let response = self
                .authorized(self.http.get(self.admin_url("users")))
                .query(&[("page", page), ("per_page", LIST_PAGE_SIZE)])
                .send()
                .await
                .map_err(|e| BillingError::Identity(format!("list users failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::error!(status = %status, body = %body, "Supabase list users failed");
                return Err(BillingError::Identity(format!(
                    "list users returned {}",
                    status
                )));
            }

            let listing: ListUsersResponse = response
                .json()
                .await
                .map_err(|e| BillingError::Identity(format!("list users response: {}", e)))?;

            let count = listing.users.len();
            if let Some(found) = listing.users.into_iter().find(|u| {
                u.email
                    .as_deref()
                    .is_some_and(|e| e.to_lowercase() == needle)
            }) {
                return Ok(Some(found));
            }

            if count < LIST_PAGE_SIZE {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn create(&self, identity: &NewIdentity) -> BillingResult<Identity> {
        let body = CreateUserRequest {
            email: &identity.email,
            password: &identity.password,
            email_confirm: true,
            user_metadata: serde_json::json!({
                "role": identity.role,
                "full_name": identity.full_name,
            }),
        };

        let response = self
            .authorized(self.http.post(self.admin_url("users")))
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Identity(format!("create user failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Identity>()
                .await
                .map_err(|e| BillingError::Identity(format!("create user response: {}", e)));
        }

        let text = response.text().await.unwrap_or_default();
        let duplicate = matches!(status, StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY)
            && (text.contains("already") || text.contains("email_exists"));
        if duplicate {
            return Err(BillingError::IdentityAlreadyExists(identity.email.clone()));
        }

        tracing::error!(status = %status, body = %text, "Supabase create user failed");
        Err(BillingError::Identity(format!(
            "create user returned {}",
            status
        )))
    }
}
