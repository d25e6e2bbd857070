//! The account model: one stored credential bundle per provider identity.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Kiro,
    OpenAi,
    Claude,
    Gemini,
    Qwen,
    IFlow,
    Antigravity,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "kiro" => Some(ProviderKind::Kiro),
            "openai" => Some(ProviderKind::OpenAi),
            "claude" => Some(ProviderKind::Claude),
            "gemini" => Some(ProviderKind::Gemini),
            "qwen" => Some(ProviderKind::Qwen),
            "iflow" => Some(ProviderKind::IFlow),
            "antigravity" => Some(ProviderKind::Antigravity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Kiro => "kiro",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Qwen => "qwen",
            ProviderKind::IFlow => "iflow",
            ProviderKind::Antigravity => "antigravity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Disabled,
    Cooldown,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Social,
    Idc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroCredential {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<AuthMethod>,
    /// RFC3339 expiry of the current access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl KiroCredential {
    pub fn is_social(&self) -> bool {
        matches!(self.auth_method, Some(AuthMethod::Social))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthTokenCredential {
    #[serde(default, alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: String,
    #[serde(default, alias = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, alias = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, alias = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyCredential {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credential {
    Kiro(KiroCredential),
    OAuth(OAuthTokenCredential),
    ApiKey(ApiKeyCredential),
}

/// The unit the auth manager schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier; equals the credential file name.
    pub id: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// RFC3339 timestamp of the last successful refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    pub credential: Credential,
}

impl Account {
    pub fn new(id: impl Into<String>, provider: ProviderKind, credential: Credential) -> Self {
        Self {
            id: id.into(),
            provider,
            label: String::new(),
            priority: 0,
            disabled: false,
            unavailable: false,
            status: AccountStatus::Active,
            success_count: 0,
            failure_count: 0,
            last_refresh: None,
            credential,
        }
    }

    pub fn access_token(&self) -> &str {
        match &self.credential {
            Credential::Kiro(cred) => &cred.access_token,
            Credential::OAuth(cred) => &cred.access_token,
            Credential::ApiKey(cred) => &cred.api_key,
        }
    }

    pub fn refresh_token(&self) -> &str {
        match &self.credential {
            Credential::Kiro(cred) => &cred.refresh_token,
            Credential::OAuth(cred) => &cred.refresh_token,
            Credential::ApiKey(_) => "",
        }
    }

    /// An account with neither an access token nor a refresh token cannot be
    /// selected.
    pub fn has_usable_tokens(&self) -> bool {
        !self.access_token().is_empty() || !self.refresh_token().is_empty()
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let raw = match &self.credential {
            Credential::Kiro(cred) => cred.expires_at.as_deref()?,
            Credential::OAuth(cred) => cred.expires_at.as_deref()?,
            Credential::ApiKey(_) => return None,
        };
        OffsetDateTime::parse(raw, &Rfc3339).ok()
    }

    /// Replace token material after a refresh and stamp `last_refresh`.
    pub fn apply_refreshed(&mut self, credential: Credential) {
        self.credential = credential;
        self.last_refresh = Some(now_rfc3339());
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_tokens_requires_either_token() {
        let mut account = Account::new(
            "kiro-us-east-1.json",
            ProviderKind::Kiro,
            Credential::Kiro(KiroCredential::default()),
        );
        assert!(!account.has_usable_tokens());
        if let Credential::Kiro(cred) = &mut account.credential {
            cred.refresh_token = "r".to_string();
        }
        assert!(account.has_usable_tokens());
    }

    #[test]
    fn expires_at_parses_rfc3339() {
        let account = Account::new(
            "kiro-us-east-1.json",
            ProviderKind::Kiro,
            Credential::Kiro(KiroCredential {
                expires_at: Some("2030-01-01T00:00:00Z".to_string()),
                ..KiroCredential::default()
            }),
        );
        let parsed = account.expires_at().unwrap();
        assert_eq!(parsed.year(), 2030);
    }

    #[test]
    fn apply_refreshed_stamps_last_refresh() {
        let mut account = Account::new(
            "kiro-us-east-1.json",
            ProviderKind::Kiro,
            Credential::Kiro(KiroCredential::default()),
        );
        account.apply_refreshed(Credential::Kiro(KiroCredential {
            access_token: "t2".to_string(),
            ..KiroCredential::default()
        }));
        assert_eq!(account.access_token(), "t2");
        assert!(account.last_refresh.is_some());
    }
}
