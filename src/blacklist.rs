use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

/// Consecutive refresh failures tolerated before backing off.
const MAX_FAIL_COUNT: u32 = 5;

/// On-disk and remote blacklist payload shape. A bare JSON array is also
/// accepted for older dumps.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BlacklistFile {
    Wrapped { blacklist: Vec<String> },
    Plain(Vec<String>),
}

impl BlacklistFile {
    fn into_entries(self) -> Vec<String> {
        match self {
            BlacklistFile::Wrapped { blacklist } => blacklist,
            BlacklistFile::Plain(entries) => entries,
        }
    }
}

/// Synchronous membership predicate over a static seed unioned with a
/// periodically refreshed remote set. The refresher swaps whole snapshots,
/// so readers always observe a consistent set and never block on I/O.
pub struct Blacklist {
    label: &'static str,
    seed: HashSet<String>,
    snapshot: RwLock<Arc<HashSet<String>>>,
}

impl Blacklist {
    pub fn new(label: &'static str, seed_path: Option<&Path>) -> Self {
        let seed = seed_path.map(load_seed).unwrap_or_default();
        if !seed.is_empty() {
            tracing::info!(label, entries = seed.len(), "loaded blacklist seed");
        }
        let snapshot = RwLock::new(Arc::new(seed.clone()));
        Self {
            label,
            seed,
            snapshot,
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        let guard = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.contains(value.trim())
    }

    fn swap(&self, remote: Vec<String>) {
        let mut merged = self.seed.clone();
        merged.extend(remote.into_iter().map(|e| e.trim().to_string()));
        let snapshot = Arc::new(merged);
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = snapshot;
    }
}

fn load_seed(path: &Path) -> HashSet<String> {
    match std::fs::read(path) {
        Ok(raw) => match serde_json::from_slice::<BlacklistFile>(&raw) {
            Ok(file) => file
                .into_entries()
                .into_iter()
                .map(|e| e.trim().to_string())
                .collect(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "could not parse blacklist seed: {e}");
                HashSet::new()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), "could not read blacklist seed: {e}");
            HashSet::new()
        }
    }
}

/// Refresh `list` from `url` every `ttl`, keeping the last good snapshot on
/// failure and backing off for `3 * ttl` after repeated failures.
pub fn spawn_refresher(
    list: Arc<Blacklist>,
    client: reqwest::Client,
    url: String,
    ttl: Duration,
) {
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            match fetch_remote(&client, &url).await {
                Ok(entries) => {
                    tracing::debug!(label = list.label, count = entries.len(), "blacklist refreshed");
                    list.swap(entries);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(label = list.label, failures, "blacklist refresh failed: {e}");
                    if failures >= MAX_FAIL_COUNT {
                        tracing::warn!(label = list.label, "blacklist refresher backing off");
                        tokio::time::sleep(ttl * 3).await;
                        failures = 0;
                        continue;
                    }
                }
            }
            tokio::time::sleep(ttl).await;
        }
    });
}

async fn fetch_remote(client: &reqwest::Client, url: &str) -> Result<Vec<String>, String> {
    let resp = client
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("status {}", resp.status()));
    }
    let file: BlacklistFile = resp.json().await.map_err(|e| e.to_string())?;
    Ok(file.into_entries())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_and_swap_union() {
        let list = Blacklist::new("images", None);
        assert!(!list.contains("https://bad.example/x.jpg"));

        list.swap(vec!["https://bad.example/x.jpg".into(), " padded ".into()]);
        assert!(list.contains("https://bad.example/x.jpg"));
        assert!(list.contains("padded"));

        // a later swap replaces the remote part entirely
        list.swap(vec!["other".into()]);
        assert!(!list.contains("https://bad.example/x.jpg"));
        assert!(list.contains("other"));
    }

    #[test]
    fn parses_both_payload_shapes() {
        let wrapped: BlacklistFile =
            serde_json::from_str(r#"{"blacklist": ["a", "b"]}"#).unwrap();
        assert_eq!(wrapped.into_entries(), vec!["a", "b"]);

        let plain: BlacklistFile = serde_json::from_str(r#"["c"]"#).unwrap();
        assert_eq!(plain.into_entries(), vec!["c"]);
    }
}
