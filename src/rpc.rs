use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};

const RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// Consecutive failures before rotating to the next configured node.
const FAILOVER_THRESHOLD: u32 = 2;
const CACHE_TTL: Duration = Duration::from_secs(30);

/// A `[key, weight]` pair as the chain serializes it.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyAuth(pub String, pub u16);

#[derive(Debug, Clone, Deserialize)]
pub struct Authority {
    pub weight_threshold: u32,
    #[serde(default)]
    pub account_auths: Vec<(String, u16)>,
    #[serde(default)]
    pub key_auths: Vec<KeyAuth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub name: String,
    pub owner: Authority,
    pub active: Authority,
    pub posting: Authority,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileImages {
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default)]
    pub profile: ProfileImages,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Already normalized by the bridge API; compared as-is.
    #[serde(default)]
    pub reputation: f64,
    #[serde(default)]
    pub metadata: ProfileMetadata,
}

/// Account names the chain could actually contain. Anything else is
/// rejected before an RPC round-trip.
pub fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

/// JSON-RPC client over the configured node list with short timeouts,
/// failover, and small TTL caches for the two lookups the service makes.
pub struct RpcClient {
    client: reqwest::Client,
    nodes: Vec<String>,
    current: AtomicUsize,
    failures: AtomicU32,
    accounts: Cache<String, Option<Account>>,
    profiles: Cache<String, Option<Profile>>,
}

impl RpcClient {
    pub fn new(client: reqwest::Client, nodes: Vec<String>) -> Self {
        Self {
            client,
            nodes,
            current: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
            accounts: Cache::builder().time_to_live(CACHE_TTL).build(),
            profiles: Cache::builder().time_to_live(CACHE_TTL).build(),
        }
    }

    fn node(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.nodes.len();
        &self.nodes[idx]
    }

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILOVER_THRESHOLD {
            self.failures.store(0, Ordering::Relaxed);
            let next = self.current.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                node = %self.nodes[next % self.nodes.len()],
                "rpc failing over to next node"
            );
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(self.node())
            .timeout(RPC_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.record_failure();
                Error::UpstreamError(format!("rpc transport: {e}"))
            })?;
        let payload: Value = resp.json().await.map_err(|e| {
            self.record_failure();
            Error::UpstreamError(format!("rpc decode: {e}"))
        })?;
        self.failures.store(0, Ordering::Relaxed);
        if let Some(err) = payload.get("error") {
            // the bridge answers missing accounts with an error object
            tracing::debug!(method, "rpc error response: {err}");
            return Ok(None);
        }
        match payload.get("result") {
            Some(Value::Null) | None => Ok(None),
            Some(result) => serde_json::from_value(result.clone())
                .map(Some)
                .map_err(|e| Error::UpstreamError(format!("rpc result shape: {e}"))),
        }
    }

    pub async fn get_account(&self, name: &str) -> Result<Option<Account>> {
        if let Some(cached) = self.accounts.get(name).await {
            return Ok(cached);
        }
        let accounts: Option<Vec<Account>> = self
            .call("condenser_api.get_accounts", json!([[name]]))
            .await?;
        let account = accounts.and_then(|mut list| {
            if list.is_empty() {
                None
            } else {
                Some(list.remove(0))
            }
        });
        self.accounts.insert(name.to_string(), account.clone()).await;
        Ok(account)
    }

    pub async fn get_profile(&self, name: &str) -> Result<Option<Profile>> {
        if let Some(cached) = self.profiles.get(name).await {
            return Ok(cached);
        }
        let profile: Option<Profile> = self
            .call("bridge.get_profile", json!({ "account": name }))
            .await?;
        self.profiles.insert(name.to_string(), profile.clone()).await;
        Ok(profile)
    }
}
