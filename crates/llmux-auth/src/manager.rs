//! The in-memory account pool and refresh scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStatus, ProviderKind};
use crate::error::AuthError;
use crate::refresh::{refresh_http_client, RefreshDriver};
use crate::store::CredentialStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Consecutive refresh failures before an account is marked unavailable.
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

struct Entry {
    account: Account,
    cooldown_until: Option<Instant>,
    last_selected: u64,
    refresh_failures: u32,
    success: Arc<AtomicU64>,
    failure: Arc<AtomicU64>,
    refresh_gate: Arc<Mutex<()>>,
}

impl Entry {
    fn new(account: Account) -> Self {
        let success = Arc::new(AtomicU64::new(account.success_count));
        let failure = Arc::new(AtomicU64::new(account.failure_count));
        Self {
            account,
            cooldown_until: None,
            last_selected: 0,
            refresh_failures: 0,
            success,
            failure,
            refresh_gate: Arc::new(Mutex::new(())),
        }
    }

    fn snapshot(&self) -> Account {
        let mut account = self.account.clone();
        account.success_count = self.success.load(Ordering::Relaxed);
        account.failure_count = self.failure.load(Ordering::Relaxed);
        account
    }
}

struct Inner {
    store: CredentialStore,
    entries: RwLock<HashMap<String, Entry>>,
    drivers: RwLock<HashMap<ProviderKind, Arc<dyn RefreshDriver>>>,
    selection_seq: AtomicU64,
    client: reqwest::Client,
}

/// Owns the credential directory and the live account pool.
///
/// `select` returns stable snapshots; executors never observe a half-rotated
/// token. Refresh is serialized per account through a dedicated gate.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<Inner>,
}

impl AuthManager {
    pub fn new(store: CredentialStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                entries: RwLock::new(HashMap::new()),
                drivers: RwLock::new(HashMap::new()),
                selection_seq: AtomicU64::new(1),
                client: refresh_http_client(),
            }),
        }
    }

    pub async fn register_driver(&self, driver: Arc<dyn RefreshDriver>) {
        self.inner
            .drivers
            .write()
            .await
            .insert(driver.provider(), driver);
    }

    /// Load every account from the store directory into the pool.
    pub async fn load_store(&self) -> Result<usize, AuthError> {
        let accounts = self.inner.store.list()?;
        let count = accounts.len();
        let mut entries = self.inner.entries.write().await;
        for account in accounts {
            debug!(account = %account.id, provider = %account.provider.as_str(), "registered account");
            entries.insert(account.id.clone(), Entry::new(account));
        }
        Ok(count)
    }

    /// Register or replace an account, persisting it to disk.
    pub async fn register(&self, account: Account) -> Result<(), AuthError> {
        self.inner.store.save(&account)?;
        let mut entries = self.inner.entries.write().await;
        match entries.get_mut(&account.id) {
            Some(entry) => entry.account = account,
            None => {
                entries.insert(account.id.clone(), Entry::new(account));
            }
        }
        Ok(())
    }

    /// Register an imported account, refreshing first when its token expires
    /// within five minutes. An import-time refresh failure degrades to a
    /// warning; the account still enters the pool and the scheduler retries.
    pub async fn import(&self, account: Account) -> Result<(), AuthError> {
        let expiring_soon = account
            .expires_at()
            .map(|expires_at| {
                expires_at - Duration::from_secs(5 * 60) <= time::OffsetDateTime::now_utc()
            })
            .unwrap_or(false);
        self.register(account.clone()).await?;
        if expiring_soon && !account.refresh_token().is_empty() {
            if let Err(err) = self.refresh_account(&account.id).await {
                warn!(account = %account.id, error = %err, "import-time refresh failed");
            }
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), AuthError> {
        self.inner.store.delete(id)?;
        self.inner.entries.write().await.remove(id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Account> {
        let entries = self.inner.entries.read().await;
        let mut accounts: Vec<Account> = entries.values().map(Entry::snapshot).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    pub async fn get(&self, id: &str) -> Option<Account> {
        self.inner.entries.read().await.get(id).map(Entry::snapshot)
    }

    /// Pick an eligible account for the provider.
    ///
    /// Highest priority wins; ties go to the least-recently-used account.
    /// Disabled, unavailable and cooling-down accounts are skipped, as are
    /// accounts with no usable tokens.
    pub async fn select(&self, provider: ProviderKind) -> Result<Account, AuthError> {
        let now = Instant::now();
        let mut entries = self.inner.entries.write().await;

        let mut best: Option<&mut Entry> = None;
        for entry in entries.values_mut() {
            if entry.account.provider != provider {
                continue;
            }
            if entry.account.disabled || entry.account.status == AccountStatus::Disabled {
                continue;
            }
            if entry.account.unavailable {
                continue;
            }
            if let Some(until) = entry.cooldown_until {
                if until > now {
                    continue;
                }
                // Cooldown expired; the account is selectable again.
                entry.cooldown_until = None;
                entry.account.status = AccountStatus::Active;
            }
            if !entry.account.has_usable_tokens() {
                continue;
            }

            best = match best {
                None => Some(entry),
                Some(current) => {
                    let better = entry.account.priority > current.account.priority
                        || (entry.account.priority == current.account.priority
                            && entry.last_selected < current.last_selected);
                    if better {
                        Some(entry)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let Some(entry) = best else {
            return Err(AuthError::NoAccount(provider.as_str().to_string()));
        };
        entry.last_selected = self.inner.selection_seq.fetch_add(1, Ordering::Relaxed);
        Ok(entry.snapshot())
    }

    /// Replace an account's state after an executor mutated its credential.
    pub async fn update(&self, account: Account) -> Result<(), AuthError> {
        self.inner.store.save(&account)?;
        let mut entries = self.inner.entries.write().await;
        match entries.get_mut(&account.id) {
            Some(entry) => entry.account = account,
            None => {
                entries.insert(account.id.clone(), Entry::new(account));
            }
        }
        Ok(())
    }

    pub async fn record_success(&self, id: &str) {
        if let Some(entry) = self.inner.entries.read().await.get(id) {
            entry.success.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn record_failure(&self, id: &str) {
        if let Some(entry) = self.inner.entries.read().await.get(id) {
            entry.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Put an account into cooldown (429 / 5xx backoff).
    pub async fn mark_cooldown(&self, id: &str, duration: Duration) {
        let mut entries = self.inner.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.cooldown_until = Some(Instant::now() + duration);
            entry.account.status = AccountStatus::Cooldown;
            warn!(account = %id, secs = duration.as_secs(), "account entered cooldown");
        }
    }

    pub async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), AuthError> {
        let mut entries = self.inner.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| AuthError::UnknownAccount(id.to_string()))?;
        entry.account.disabled = disabled;
        entry.account.status = if disabled {
            AccountStatus::Disabled
        } else {
            AccountStatus::Active
        };
        self.inner.store.save(&entry.account)?;
        Ok(())
    }

    /// Refresh one account through its provider driver, serialized per
    /// account. A caller that lost the race re-reads the winner's tokens
    /// instead of refreshing again.
    pub async fn refresh_account(&self, id: &str) -> Result<Account, AuthError> {
        let (gate, before_token, driver) = {
            let entries = self.inner.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| AuthError::UnknownAccount(id.to_string()))?;
            let drivers = self.inner.drivers.read().await;
            let driver = drivers
                .get(&entry.account.provider)
                .cloned()
                .ok_or_else(|| {
                    AuthError::InvalidCredential(format!(
                        "no refresh driver for provider {}",
                        entry.account.provider.as_str()
                    ))
                })?;
            (
                entry.refresh_gate.clone(),
                entry.account.access_token().to_string(),
                driver,
            )
        };

        let _guard = gate.lock().await;

        // Re-read after acquiring the gate: the winner may have rotated the
        // token while this caller waited.
        let current = self
            .get(id)
            .await
            .ok_or_else(|| AuthError::UnknownAccount(id.to_string()))?;
        if current.access_token() != before_token {
            return Ok(current);
        }

        match driver.refresh(&current, &self.inner.client).await {
            Ok(credential) => {
                let mut updated = current;
                updated.apply_refreshed(credential);
                self.update(updated.clone()).await?;
                self.note_refresh_outcome(id, true, 0).await;
                Ok(updated)
            }
            Err(err) => {
                warn!(account = %id, error = %err, "token refresh failed");
                Err(err)
            }
        }
    }

    async fn note_refresh_outcome(&self, id: &str, success: bool, threshold: u32) {
        let mut entries = self.inner.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            if success {
                entry.refresh_failures = 0;
            } else {
                entry.refresh_failures += 1;
                if threshold > 0 && entry.refresh_failures >= threshold {
                    entry.account.unavailable = true;
                    entry.account.status = AccountStatus::Exhausted;
                    warn!(account = %id, "account marked unavailable after repeated refresh failures");
                }
            }
        }
    }

    /// Run the cooperative refresh loop: each tick, refresh every account
    /// whose wake time (`expiry - lead`) has passed.
    pub fn spawn_refresh_loop(&self, config: SchedulerConfig) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.refresh_due_accounts(config.failure_threshold).await;
            }
        })
    }

    /// One scheduler pass; factored out of the loop for tests.
    pub async fn refresh_due_accounts(&self, failure_threshold: u32) {
        let now = time::OffsetDateTime::now_utc();
        let due: Vec<String> = {
            let entries = self.inner.entries.read().await;
            let drivers = self.inner.drivers.read().await;
            entries
                .values()
                .filter(|entry| {
                    if entry.account.disabled || entry.account.unavailable {
                        return false;
                    }
                    if entry.account.refresh_token().is_empty() {
                        return false;
                    }
                    let Some(driver) = drivers.get(&entry.account.provider) else {
                        return false;
                    };
                    match entry.account.expires_at() {
                        Some(expires_at) => expires_at - driver.refresh_lead() <= now,
                        None => false,
                    }
                })
                .map(|entry| entry.account.id.clone())
                .collect()
        };

        for id in due {
            match self.refresh_account(&id).await {
                Ok(_) => {
                    info!(account = %id, "scheduled refresh complete");
                }
                Err(_) => {
                    self.note_refresh_outcome(&id, false, failure_threshold).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Credential, KiroCredential};
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn kiro_account(id: &str, priority: i32) -> Account {
        let mut account = Account::new(
            id,
            ProviderKind::Kiro,
            Credential::Kiro(KiroCredential {
                access_token: format!("token-{id}"),
                refresh_token: "rt".to_string(),
                region: Some("us-east-1".to_string()),
                ..KiroCredential::default()
            }),
        );
        account.priority = priority;
        account
    }

    async fn manager_with(accounts: Vec<Account>) -> (AuthManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("auth")).unwrap();
        let manager = AuthManager::new(store);
        for account in accounts {
            manager.register(account).await.unwrap();
        }
        (manager, dir)
    }

    #[tokio::test]
    async fn select_prefers_higher_priority() {
        let (manager, _dir) = manager_with(vec![
            kiro_account("kiro-1.json", 0),
            kiro_account("kiro-2.json", 5),
        ])
        .await;
        let picked = manager.select(ProviderKind::Kiro).await.unwrap();
        assert_eq!(picked.id, "kiro-2.json");
    }

    #[tokio::test]
    async fn equal_priority_selection_is_fair() {
        let n = 4;
        let accounts: Vec<Account> = (0..n)
            .map(|i| kiro_account(&format!("kiro-{i}.json"), 1))
            .collect();
        let (manager, _dir) = manager_with(accounts).await;

        let mut counts: StdHashMap<String, u32> = StdHashMap::new();
        for _ in 0..(10 * n) {
            let picked = manager.select(ProviderKind::Kiro).await.unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        let max = counts.values().copied().max().unwrap();
        let min = counts.values().copied().min().unwrap();
        assert!(max - min <= 1, "unfair selection: {counts:?}");
    }

    #[tokio::test]
    async fn disabled_and_unavailable_are_skipped() {
        let mut disabled = kiro_account("kiro-1.json", 9);
        disabled.disabled = true;
        let mut unavailable = kiro_account("kiro-2.json", 9);
        unavailable.unavailable = true;
        let (manager, _dir) = manager_with(vec![
            disabled,
            unavailable,
            kiro_account("kiro-3.json", 0),
        ])
        .await;
        let picked = manager.select(ProviderKind::Kiro).await.unwrap();
        assert_eq!(picked.id, "kiro-3.json");
    }

    #[tokio::test]
    async fn empty_token_account_is_never_selected() {
        let mut empty = kiro_account("kiro-1.json", 9);
        empty.credential = Credential::Kiro(KiroCredential::default());
        let (manager, _dir) = manager_with(vec![empty]).await;
        assert!(matches!(
            manager.select(ProviderKind::Kiro).await,
            Err(AuthError::NoAccount(_))
        ));
    }

    #[tokio::test]
    async fn cooldown_blocks_until_deadline() {
        let (manager, _dir) = manager_with(vec![kiro_account("kiro-1.json", 0)]).await;
        manager
            .mark_cooldown("kiro-1.json", Duration::from_millis(50))
            .await;
        assert!(manager.select(ProviderKind::Kiro).await.is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let picked = manager.select(ProviderKind::Kiro).await.unwrap();
        assert_eq!(picked.id, "kiro-1.json");
        assert_eq!(picked.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn counters_survive_snapshots() {
        let (manager, _dir) = manager_with(vec![kiro_account("kiro-1.json", 0)]).await;
        manager.record_success("kiro-1.json").await;
        manager.record_success("kiro-1.json").await;
        manager.record_failure("kiro-1.json").await;
        let account = manager.get("kiro-1.json").await.unwrap();
        assert_eq!(account.success_count, 2);
        assert_eq!(account.failure_count, 1);
    }

    #[tokio::test]
    async fn refresh_failures_mark_unavailable_at_threshold() {
        let (manager, _dir) = manager_with(vec![kiro_account("kiro-1.json", 0)]).await;
        manager.note_refresh_outcome("kiro-1.json", false, 3).await;
        manager.note_refresh_outcome("kiro-1.json", false, 3).await;
        assert!(!manager.get("kiro-1.json").await.unwrap().unavailable);
        manager.note_refresh_outcome("kiro-1.json", false, 3).await;
        let account = manager.get("kiro-1.json").await.unwrap();
        assert!(account.unavailable);
        assert_eq!(account.status, AccountStatus::Exhausted);
    }
}
