//! Per-request usage accounting and per-account quota fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use llmux_auth::constants::{interpolate_region, ORIGIN_AI_EDITOR};
use llmux_auth::{Account, Credential, KiroConstants};

use crate::error::ExecuteError;
use crate::ExecContext;

const QUOTA_RETRY_ATTEMPTS: u32 = 3;
const QUOTA_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageOutcome {
    Success,
    Failure(String),
}

/// Emitted once per request; the host wires these into account counters.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub provider: String,
    pub model: String,
    pub account: String,
    pub outcome: UsageOutcome,
}

/// Publish-once guard around the per-request usage event.
pub struct UsageReporter {
    provider: String,
    model: String,
    account: String,
    sender: Option<tokio::sync::mpsc::UnboundedSender<UsageEvent>>,
    published: AtomicBool,
}

impl UsageReporter {
    pub fn new(ctx: &ExecContext, provider: &str, model: &str, account: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            account: account.to_string(),
            sender: ctx.usage.clone(),
            published: AtomicBool::new(false),
        }
    }

    pub fn publish_success(&self) {
        self.publish(UsageOutcome::Success);
    }

    pub fn publish_failure(&self, classification: &str) {
        self.publish(UsageOutcome::Failure(classification.to_string()));
    }

    fn publish(&self, outcome: UsageOutcome) {
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };
        let _ = sender.send(UsageEvent {
            provider: self.provider.clone(),
            model: self.model.clone(),
            account: self.account.clone(),
            outcome,
        });
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaBonus {
    pub name: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// One quota line for the management surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub resource_type: String,
    pub display_name: String,
    pub unit: String,
    pub current_usage: f64,
    pub usage_limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<String>,
    #[serde(default)]
    pub free_trial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bonuses: Vec<QuotaBonus>,
}

/// Fetch the Kiro usage limits for one account, with retry.
pub async fn fetch_kiro_quota(
    client: &reqwest::Client,
    account: &Account,
    constants: &KiroConstants,
) -> Result<Vec<QuotaSnapshot>, ExecuteError> {
    let Credential::Kiro(credential) = &account.credential else {
        return Err(ExecuteError::MissingCredential("kiro credential"));
    };
    if credential.access_token.is_empty() {
        return Err(ExecuteError::MissingCredential("access_token"));
    }
    let region = credential.region.as_deref().unwrap_or_default();
    let mut url = format!(
        "{}?isEmailRequired=true&origin={}&resourceType=AGENTIC_REQUEST",
        interpolate_region(constants.usage_limits_url, region),
        ORIGIN_AI_EDITOR,
    );
    if credential.is_social() {
        if let Some(profile_arn) = credential.profile_arn.as_deref() {
            if !profile_arn.is_empty() {
                url.push_str("&profileArn=");
                url.push_str(profile_arn);
            }
        }
    }

    let mut last_err: Option<ExecuteError> = None;
    for attempt in 1..=QUOTA_RETRY_ATTEMPTS {
        match fetch_quota_once(client, &url, &credential.access_token).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) => {
                debug!(attempt, error = %err, account = %account.id, "quota fetch attempt failed");
                last_err = Some(err);
                if attempt < QUOTA_RETRY_ATTEMPTS {
                    tokio::time::sleep(QUOTA_RETRY_DELAY).await;
                }
            }
        }
    }
    let err = last_err.unwrap_or(ExecuteError::Unsupported("usage_limits"));
    warn!(account = %account.id, error = %err, "quota fetch failed after retries");
    Err(err)
}

async fn fetch_quota_once(
    client: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<Vec<QuotaSnapshot>, ExecuteError> {
    let response = client
        .get(url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
        .send()
        .await?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    if !(200..300).contains(&status) {
        return Err(ExecuteError::upstream(status, &bytes));
    }
    let payload: JsonValue =
        serde_json::from_slice(&bytes).map_err(|err| ExecuteError::Decode(err.to_string()))?;
    Ok(parse_quota_payload(&payload))
}

/// Normalize the observed quota response shapes into snapshots:
/// a usage-breakdown list (with bonuses and free-trial markers), a
/// percent-based list, or a single absolute used/limit pair.
pub fn parse_quota_payload(payload: &JsonValue) -> Vec<QuotaSnapshot> {
    if let Some(list) = payload
        .get("usageBreakdownList")
        .and_then(|value| value.as_array())
    {
        return list.iter().map(parse_breakdown_entry).collect();
    }

    if let Some(list) = payload.get("quotas").and_then(|value| value.as_array()) {
        return list
            .iter()
            .map(|entry| {
                let name = string_field(entry, &["name", "displayName"]);
                QuotaSnapshot {
                    resource_type: name.clone(),
                    display_name: name,
                    unit: "percent".to_string(),
                    current_usage: number_field(entry, &["percentUsed", "percent_used"]),
                    usage_limit: 100.0,
                    reset_at: entry
                        .get("resetAt")
                        .or_else(|| entry.get("reset_time"))
                        .and_then(|value| value.as_str())
                        .map(str::to_owned),
                    free_trial: false,
                    bonuses: Vec::new(),
                }
            })
            .collect();
    }

    if payload.get("used").is_some() || payload.get("limit").is_some() {
        return vec![QuotaSnapshot {
            resource_type: string_field_or(payload, &["resourceType"], "REQUEST"),
            display_name: string_field_or(payload, &["displayName"], "Requests"),
            unit: "count".to_string(),
            current_usage: number_field(payload, &["used", "currentUsage"]),
            usage_limit: number_field(payload, &["limit", "usageLimit"]),
            reset_at: payload
                .get("resetAt")
                .and_then(|value| value.as_str())
                .map(str::to_owned),
            free_trial: false,
            bonuses: Vec::new(),
        }];
    }

    Vec::new()
}

fn parse_breakdown_entry(entry: &JsonValue) -> QuotaSnapshot {
    let resource_type = string_field_or(entry, &["resourceType"], "AGENTIC_REQUEST");
    let bonuses = entry
        .get("bonuses")
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .map(|bonus| QuotaBonus {
                    name: string_field_or(bonus, &["name", "bonusType"], "bonus"),
                    amount: number_field(bonus, &["amount", "usageLimitWithPrecision"]),
                    expires_at: bonus
                        .get("expiresAt")
                        .and_then(|value| value.as_str())
                        .map(str::to_owned),
                })
                .collect()
        })
        .unwrap_or_default();

    QuotaSnapshot {
        display_name: string_field_or(entry, &["displayName"], &resource_type),
        unit: "count".to_string(),
        current_usage: number_field(entry, &["currentUsage", "currentUsageWithPrecision"]),
        usage_limit: number_field(entry, &["usageLimitWithPrecision", "usageLimit"]),
        reset_at: entry
            .get("nextDateReset")
            .or_else(|| entry.get("resetAt"))
            .and_then(|value| value.as_str())
            .map(str::to_owned),
        free_trial: entry
            .get("freeTrialInfo")
            .and_then(|info| info.get("freeTrialStatus"))
            .and_then(|status| status.as_str())
            .map(|status| status == "ACTIVE")
            .unwrap_or(false),
        bonuses,
        resource_type,
    }
}

fn string_field(entry: &JsonValue, keys: &[&str]) -> String {
    for key in keys {
        if let Some(value) = entry.get(key).and_then(|value| value.as_str()) {
            return value.to_string();
        }
    }
    String::new()
}

fn string_field_or(entry: &JsonValue, keys: &[&str], fallback: &str) -> String {
    let value = string_field(entry, keys);
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn number_field(entry: &JsonValue, keys: &[&str]) -> f64 {
    for key in keys {
        if let Some(value) = entry.get(key).and_then(|value| value.as_f64()) {
            return value;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_publishes_exactly_once() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = ExecContext {
            usage: Some(tx),
            ..ExecContext::default()
        };
        let reporter = UsageReporter::new(&ctx, "kiro", "m", "kiro-1.json");
        reporter.publish_failure("upstream returned status 500");
        reporter.publish_success();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event.outcome, UsageOutcome::Failure(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn breakdown_shape_is_parsed() {
        let payload = serde_json::json!({
            "daysUntilReset": 12,
            "usageBreakdownList": [{
                "resourceType": "AGENTIC_REQUEST",
                "displayName": "Agentic requests",
                "currentUsage": 37.5,
                "usageLimitWithPrecision": 500.0,
                "nextDateReset": "2025-09-01T00:00:00Z",
                "freeTrialInfo": {"freeTrialStatus": "ACTIVE"},
                "bonuses": [{"name": "promo", "amount": 50.0}]
            }]
        });
        let snapshots = parse_quota_payload(&payload);
        assert_eq!(snapshots.len(), 1);
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.resource_type, "AGENTIC_REQUEST");
        assert_eq!(snapshot.current_usage, 37.5);
        assert_eq!(snapshot.usage_limit, 500.0);
        assert!(snapshot.free_trial);
        assert_eq!(snapshot.bonuses[0].amount, 50.0);
        assert_eq!(snapshot.reset_at.as_deref(), Some("2025-09-01T00:00:00Z"));
    }

    #[test]
    fn percent_shape_is_parsed() {
        let payload = serde_json::json!({
            "quotas": [{"name": "prompts", "percentUsed": 62.5, "resetAt": "2025-09-01T00:00:00Z"}]
        });
        let snapshots = parse_quota_payload(&payload);
        assert_eq!(snapshots[0].unit, "percent");
        assert_eq!(snapshots[0].current_usage, 62.5);
        assert_eq!(snapshots[0].usage_limit, 100.0);
    }

    #[test]
    fn absolute_shape_is_parsed() {
        let payload = serde_json::json!({"used": 10, "limit": 100});
        let snapshots = parse_quota_payload(&payload);
        assert_eq!(snapshots[0].current_usage, 10.0);
        assert_eq!(snapshots[0].usage_limit, 100.0);
        assert_eq!(snapshots[0].unit, "count");
    }

    #[test]
    fn unknown_shape_yields_nothing() {
        assert!(parse_quota_payload(&serde_json::json!({"hello": 1})).is_empty());
    }
}
