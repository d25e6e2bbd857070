//! Flat-file credential persistence: one account per JSON file.
//!
//! The loader sniffs three on-disk schemas: the canonical flat form this
//! store writes, the account-manager export format, and the nested
//! token-bundle variant. Anything else is rejected as an invalid credential.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::account::{
    now_rfc3339, Account, AuthMethod, Credential, KiroCredential, OAuthTokenCredential,
    ProviderKind,
};
use crate::constants::DEFAULT_REGION;
use crate::error::AuthError;

/// Primary file of an AWS SSO cache directory.
const KIRO_AUTH_TOKEN_FILE: &str = "kiro-auth-token.json";

/// Canonical flat credential file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialFile {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "last_refresh", default, skip_serializing_if = "Option::is_none")]
    last_refresh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    disabled: Option<bool>,
}

pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Open (creating if needed) the credential directory. Mode 0700.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load a single credential file, sniffing its schema.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Account, AuthError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let file = sniff_credential_file(&data)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        file_to_account(name, file)
    }

    /// Load a split credential directory: the canonical primary file first,
    /// then sibling JSONs merged without overwriting fields the primary set.
    pub fn load_dir(&self, path: impl AsRef<Path>) -> Result<Vec<Account>, AuthError> {
        let path = path.as_ref();
        let mut merged = CredentialFile::default();

        let primary = path.join(KIRO_AUTH_TOKEN_FILE);
        if let Ok(data) = fs::read(&primary) {
            if let Ok(file) = sniff_credential_file(&data) {
                debug!(path = %primary.display(), "loaded primary credential file");
                merged = file;
            }
        }

        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || name == KIRO_AUTH_TOKEN_FILE {
                continue;
            }
            let Ok(data) = fs::read(entry.path()) else {
                continue;
            };
            let Ok(sibling) = sniff_credential_file(&data) else {
                continue;
            };
            merge_missing(&mut merged, sibling);
            debug!(file = %name, "merged sibling credential file");
        }

        if merged.access_token.is_empty() && merged.refresh_token.is_empty() {
            return Err(AuthError::InvalidCredential(format!(
                "no usable credentials in {}",
                path.display()
            )));
        }
        if merged.region.is_none() {
            merged.region = Some(DEFAULT_REGION.to_string());
        }

        let region = merged.region.clone().unwrap_or_default();
        let account = file_to_account(format!("kiro-{region}.json"), merged)?;
        Ok(vec![account])
    }

    /// Write-rename atomic save, mode 0600.
    pub fn save(&self, account: &Account) -> Result<(), AuthError> {
        let file = account_to_file(account);
        let data = serde_json::to_vec_pretty(&file)?;

        let target = self.dir.join(&account.id);
        let tmp = self.dir.join(format!(".{}.tmp", account.id));
        fs::write(&tmp, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &target)?;
        debug!(file = %account.id, "saved credential file");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), AuthError> {
        fs::remove_file(self.dir.join(name))?;
        Ok(())
    }

    /// All parseable accounts in the store directory.
    pub fn list(&self) -> Result<Vec<Account>, AuthError> {
        let mut accounts = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            match self.load(entry.path()) {
                Ok(account) => accounts.push(account),
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping unreadable credential file");
                }
            }
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    /// File name for a new login: `{provider}-{discriminator}.json`.
    pub fn assign_file_name(&self, provider: ProviderKind, credential: &Credential) -> String {
        match credential {
            Credential::Kiro(cred) => {
                let region = cred.region.as_deref().unwrap_or(DEFAULT_REGION);
                format!("{}-{}.json", provider.as_str(), region)
            }
            Credential::OAuth(cred) => {
                if let Some(email) = cred.user_email.as_deref().filter(|e| !e.is_empty()) {
                    let digest = Sha256::digest(email.as_bytes());
                    let hash = hex_prefix(&digest, 8);
                    return format!("{}-{}.json", provider.as_str(), hash);
                }
                self.next_indexed_name(provider)
            }
            Credential::ApiKey(_) => self.next_indexed_name(provider),
        }
    }

    fn next_indexed_name(&self, provider: ProviderKind) -> String {
        let mut index = 1;
        loop {
            let candidate = format!("{}-{}.json", provider.as_str(), index);
            if !self.dir.join(&candidate).exists() {
                return candidate;
            }
            index += 1;
        }
    }
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            out.truncate(chars);
            break;
        }
    }
    out
}

fn merge_missing(merged: &mut CredentialFile, other: CredentialFile) {
    if merged.access_token.is_empty() && !other.access_token.is_empty() {
        merged.access_token = other.access_token;
    }
    if merged.refresh_token.is_empty() && !other.refresh_token.is_empty() {
        merged.refresh_token = other.refresh_token;
    }
    if merged.client_id.is_none() {
        merged.client_id = other.client_id;
    }
    if merged.client_secret.is_none() {
        merged.client_secret = other.client_secret;
    }
    if merged.auth_method.is_none() {
        merged.auth_method = other.auth_method;
    }
    if merged.region.is_none() {
        merged.region = other.region;
    }
    if merged.profile_arn.is_none() {
        merged.profile_arn = other.profile_arn;
    }
}

/// Detect the schema of a credential file and normalize to the flat form.
fn sniff_credential_file(data: &[u8]) -> Result<CredentialFile, AuthError> {
    let value: JsonValue = serde_json::from_slice(data)
        .map_err(|err| AuthError::InvalidCredential(format!("not JSON: {err}")))?;
    let Some(object) = value.as_object() else {
        return Err(AuthError::InvalidCredential(
            "credential file is not an object".to_string(),
        ));
    };

    if is_account_manager_export(object) {
        return convert_account_manager_export(&value);
    }
    if object.get("token_data").map(JsonValue::is_object) == Some(true) {
        return convert_token_bundle(&value);
    }
    if object.contains_key("accessToken")
        || object.contains_key("refreshToken")
        || object.contains_key("type")
    {
        return serde_json::from_value(value)
            .map_err(|err| AuthError::InvalidCredential(err.to_string()));
    }

    Err(AuthError::InvalidCredential(
        "unrecognized credential schema".to_string(),
    ))
}

fn is_account_manager_export(object: &serde_json::Map<String, JsonValue>) -> bool {
    object.contains_key("provider")
        && (object.contains_key("clientIdHash")
            || object.contains_key("machineId")
            || object.contains_key("label"))
}

fn convert_account_manager_export(value: &JsonValue) -> Result<CredentialFile, AuthError> {
    // Token material lives under `credentials`; fall back to top level for
    // older exports.
    let tokens = value.get("credentials").unwrap_or(value);
    let mut file: CredentialFile = serde_json::from_value(tokens.clone())
        .map_err(|err| AuthError::InvalidCredential(err.to_string()))?;
    if file.access_token.is_empty() && file.refresh_token.is_empty() {
        return Err(AuthError::InvalidCredential(
            "account-manager export carries no tokens".to_string(),
        ));
    }
    file.kind = value
        .get("provider")
        .and_then(|p| p.as_str())
        .unwrap_or("kiro")
        .to_string();
    if let Some(label) = value.get("label").and_then(|l| l.as_str()) {
        file.label = Some(label.to_string());
    }
    Ok(file)
}

fn convert_token_bundle(value: &JsonValue) -> Result<CredentialFile, AuthError> {
    let tokens = value
        .get("token_data")
        .ok_or_else(|| AuthError::InvalidCredential("missing token_data".to_string()))?;
    let mut file: CredentialFile = serde_json::from_value(tokens.clone())
        .map_err(|err| AuthError::InvalidCredential(err.to_string()))?;
    if let Some(last_refresh) = value.get("last_refresh").and_then(|v| v.as_str()) {
        file.last_refresh = Some(last_refresh.to_string());
    }
    Ok(file)
}

fn parse_auth_method(value: Option<&str>) -> Option<AuthMethod> {
    match value {
        Some("social") => Some(AuthMethod::Social),
        Some("idc") => Some(AuthMethod::Idc),
        _ => None,
    }
}

fn file_to_account(id: String, file: CredentialFile) -> Result<Account, AuthError> {
    let provider = if file.kind.is_empty() {
        // SSO cache files carry no provider tag.
        ProviderKind::Kiro
    } else {
        ProviderKind::parse(&file.kind).ok_or_else(|| {
            AuthError::InvalidCredential(format!("unknown provider tag: {}", file.kind))
        })?
    };

    let credential = match provider {
        ProviderKind::Kiro => Credential::Kiro(KiroCredential {
            access_token: file.access_token,
            refresh_token: file.refresh_token,
            client_id: file.client_id,
            client_secret: file.client_secret,
            auth_method: parse_auth_method(file.auth_method.as_deref()),
            expires_at: file.expires_at,
            profile_arn: file.profile_arn,
            region: file.region,
        }),
        _ => Credential::OAuth(OAuthTokenCredential {
            access_token: file.access_token,
            refresh_token: file.refresh_token,
            expires_at: file.expires_at,
            client_id: file.client_id,
            client_secret: file.client_secret,
            user_email: file.user_email,
        }),
    };

    let mut account = Account::new(id, provider, credential);
    account.label = file.label.unwrap_or_default();
    account.priority = file.priority.unwrap_or(0);
    account.disabled = file.disabled.unwrap_or(false);
    account.last_refresh = file.last_refresh;
    Ok(account)
}

fn account_to_file(account: &Account) -> CredentialFile {
    let mut file = CredentialFile {
        kind: account.provider.as_str().to_string(),
        last_refresh: account
            .last_refresh
            .clone()
            .or_else(|| Some(now_rfc3339())),
        label: (!account.label.is_empty()).then(|| account.label.clone()),
        priority: (account.priority != 0).then_some(account.priority),
        disabled: account.disabled.then_some(true),
        ..CredentialFile::default()
    };
    match &account.credential {
        Credential::Kiro(cred) => {
            file.access_token = cred.access_token.clone();
            file.refresh_token = cred.refresh_token.clone();
            file.client_id = cred.client_id.clone();
            file.client_secret = cred.client_secret.clone();
            file.auth_method = cred.auth_method.map(|method| {
                match method {
                    AuthMethod::Social => "social",
                    AuthMethod::Idc => "idc",
                }
                .to_string()
            });
            file.expires_at = cred.expires_at.clone();
            file.profile_arn = cred.profile_arn.clone();
            file.region = cred.region.clone();
        }
        Credential::OAuth(cred) => {
            file.access_token = cred.access_token.clone();
            file.refresh_token = cred.refresh_token.clone();
            file.expires_at = cred.expires_at.clone();
            file.client_id = cred.client_id.clone();
            file.client_secret = cred.client_secret.clone();
            file.user_email = cred.user_email.clone();
        }
        Credential::ApiKey(cred) => {
            file.access_token = cred.api_key.clone();
        }
    }
    file
}
