//! Per-provider token refresh drivers.
//!
//! A driver is a pure exchange over (account snapshot, HTTP client): it never
//! touches the pool. Callers decide what to do with the returned credential.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::account::{Account, Credential, KiroCredential, OAuthTokenCredential, ProviderKind};
use crate::constants::{interpolate_region, KiroConstants};
use crate::error::AuthError;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// HTTP client sized for refresh exchanges (5-minute upper bound).
pub fn refresh_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REFRESH_TIMEOUT)
        .build()
        .unwrap_or_default()
}

#[async_trait]
pub trait RefreshDriver: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// How long before expiry the scheduler should wake this provider.
    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    /// Exchange the refresh token for new token material.
    async fn refresh(
        &self,
        account: &Account,
        client: &reqwest::Client,
    ) -> Result<Credential, AuthError>;
}

// ---- Kiro ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KiroRefreshRequest<'a> {
    refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grant_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KiroRefreshResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    profile_arn: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Default)]
pub struct KiroRefreshDriver {
    constants: KiroConstants,
}

impl KiroRefreshDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute the URL table, e.g. to point at a scripted upstream.
    pub fn with_constants(constants: KiroConstants) -> Self {
        Self { constants }
    }

    fn refresh_url(&self, cred: &KiroCredential) -> String {
        let region = cred.region.as_deref().unwrap_or_default();
        // Social auth refreshes against the desktop back-channel; everything
        // else goes through the OIDC token endpoint.
        if cred.is_social() {
            interpolate_region(self.constants.refresh_url, region)
        } else {
            interpolate_region(self.constants.refresh_idc_url, region)
        }
    }
}

#[async_trait]
impl RefreshDriver for KiroRefreshDriver {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Kiro
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    async fn refresh(
        &self,
        account: &Account,
        client: &reqwest::Client,
    ) -> Result<Credential, AuthError> {
        let Credential::Kiro(cred) = &account.credential else {
            return Err(AuthError::InvalidCredential(
                "kiro refresh driver needs a kiro credential".to_string(),
            ));
        };
        if cred.refresh_token.is_empty() {
            return Err(AuthError::InvalidCredential(
                "refresh token is required".to_string(),
            ));
        }

        let is_social = cred.is_social();
        let body = KiroRefreshRequest {
            refresh_token: &cred.refresh_token,
            client_id: (!is_social).then_some(cred.client_id.as_deref().unwrap_or_default()),
            client_secret: (!is_social).then_some(cred.client_secret.as_deref().unwrap_or_default()),
            grant_type: (!is_social).then_some("refresh_token"),
        };

        let response = client
            .post(self.refresh_url(cred))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(AuthError::refresh_failed(status.as_u16(), &bytes));
        }
        let parsed: KiroRefreshResponse = serde_json::from_slice(&bytes)?;

        info!(account = %account.id, "kiro access token refreshed");

        let expires_at = (OffsetDateTime::now_utc() + Duration::from_secs(parsed.expires_in.max(0) as u64))
            .format(&Rfc3339)
            .ok();

        Ok(Credential::Kiro(KiroCredential {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            client_id: cred.client_id.clone(),
            client_secret: cred.client_secret.clone(),
            auth_method: cred.auth_method,
            expires_at,
            // Keep the stored ARN when the response omits it.
            profile_arn: parsed.profile_arn.or_else(|| cred.profile_arn.clone()),
            region: cred
                .region
                .clone()
                .or_else(|| Some(crate::constants::DEFAULT_REGION.to_string())),
        }))
    }
}

// ---- OAuth token endpoints (Qwen / iFlow / Antigravity style) ----

#[derive(Debug, Deserialize)]
struct OAuthRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct OAuthRefreshDriver {
    provider: ProviderKind,
    token_url: String,
    default_client_id: Option<String>,
}

impl OAuthRefreshDriver {
    pub fn new(
        provider: ProviderKind,
        token_url: impl Into<String>,
        default_client_id: Option<String>,
    ) -> Self {
        Self {
            provider,
            token_url: token_url.into(),
            default_client_id,
        }
    }
}

#[async_trait]
impl RefreshDriver for OAuthRefreshDriver {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    async fn refresh(
        &self,
        account: &Account,
        client: &reqwest::Client,
    ) -> Result<Credential, AuthError> {
        let Credential::OAuth(cred) = &account.credential else {
            return Err(AuthError::InvalidCredential(
                "oauth refresh driver needs an oauth credential".to_string(),
            ));
        };
        if cred.refresh_token.is_empty() {
            return Err(AuthError::InvalidCredential(
                "refresh token is required".to_string(),
            ));
        }

        let client_id = cred
            .client_id
            .clone()
            .or_else(|| self.default_client_id.clone())
            .unwrap_or_default();
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", cred.refresh_token.clone()),
            ("client_id", client_id),
        ];
        if let Some(secret) = cred.client_secret.clone() {
            form.push(("client_secret", secret));
        }

        let response = client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(AuthError::refresh_failed(status.as_u16(), &bytes));
        }
        let parsed: OAuthRefreshResponse = serde_json::from_slice(&bytes)?;

        info!(account = %account.id, provider = %self.provider.as_str(), "oauth access token refreshed");

        let expires_at = parsed.expires_in.and_then(|expires_in| {
            (OffsetDateTime::now_utc() + Duration::from_secs(expires_in.max(0) as u64))
                .format(&Rfc3339)
                .ok()
        });

        Ok(Credential::OAuth(OAuthTokenCredential {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_else(|| cred.refresh_token.clone()),
            expires_at: expires_at.or_else(|| cred.expires_at.clone()),
            client_id: cred.client_id.clone(),
            client_secret: cred.client_secret.clone(),
            user_email: cred.user_email.clone(),
        }))
    }
}
