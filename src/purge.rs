use serde_json::json;

/// Cloudflare cache purge hook. Unconfigured deployments get a no-op;
/// failures are logged and swallowed so a CDN hiccup never fails a request.
pub struct CdnPurge {
    client: reqwest::Client,
    token: Option<String>,
    zone: Option<String>,
}

impl CdnPurge {
    pub fn new(client: reqwest::Client, token: Option<String>, zone: Option<String>) -> Self {
        Self {
            client,
            token,
            zone,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some() && self.zone.is_some()
    }

    pub async fn purge(&self, url: &str) {
        let (Some(token), Some(zone)) = (&self.token, &self.zone) else {
            tracing::debug!(url, "cdn purge skipped, not configured");
            return;
        };
        let endpoint = format!("https://api.cloudflare.com/client/v4/zones/{zone}/purge_cache");
        match self
            .client
            .post(endpoint)
            .bearer_auth(token)
            .json(&json!({ "files": [url] }))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url, "cdn purge ok");
            }
            Ok(resp) => {
                tracing::warn!(url, status = %resp.status(), "cdn purge rejected");
            }
            Err(e) => {
                tracing::warn!(url, "cdn purge failed: {e}");
            }
        }
    }
}
