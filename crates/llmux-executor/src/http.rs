//! Shared upstream HTTP clients, one per outbound-proxy key.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::ExecuteError;

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, reqwest::Client>>> = OnceLock::new();

pub fn client_for(proxy: Option<&str>) -> Result<reqwest::Client, ExecuteError> {
    let key = proxy
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = reqwest::Client::builder();
    if let Some(proxy_url) = key.as_deref() {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    let client = builder.build()?;
    guard.insert(key, client.clone());
    Ok(client)
}
