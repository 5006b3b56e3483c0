use std::time::Duration;

use bytes::Bytes;
use reqwest::header::USER_AGENT;

use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Candidates already known bad for this request (e.g. the direct URL
    /// after its bytes failed to decode).
    pub skip_urls: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            skip_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Bytes,
    /// True when the bytes came from the configured default image rather
    /// than the requested one.
    pub is_fallback: bool,
}

/// The ordered mirror ladder for a proxied URL. `url_params` is the base58
/// token form used by mirrors that speak our own `/p/` scheme. Order is the
/// preference order; attempts are strictly sequential so mirrors are not
/// hammered speculatively.
pub fn candidate_urls(url: &str, url_params: &str) -> Vec<String> {
    vec![
        url.to_string(),
        format!("https://images.hive.blog/0x0/{url}"),
        format!("https://steemitimages.com/0x0/{url}"),
        format!("https://wsrv.nl/?url={url}"),
        format!("https://img.leopedia.io/0x0/{url}"),
        format!("https://images.hive.blog/p/{url_params}"),
        format!("https://steemitimages.com/p/{url_params}"),
    ]
}

/// Walk the mirror ladder and return the first 2xx body, falling back to
/// `default_url` when every candidate fails.
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    url_params: &str,
    user_agent: &str,
    default_url: &str,
    options: &FetchOptions,
) -> Result<Fetched> {
    for candidate in candidate_urls(url, url_params)
        .iter()
        .filter(|c| !options.skip_urls.contains(c))
    {
        match try_get(client, candidate, user_agent, options.timeout).await {
            Ok(bytes) => {
                tracing::debug!(url = %candidate, len = bytes.len(), "upstream fetch ok");
                return Ok(Fetched {
                    bytes,
                    is_fallback: false,
                });
            }
            Err(e) => {
                tracing::debug!(url = %candidate, "upstream fetch failed: {e}");
            }
        }
    }
    match try_get(client, default_url, user_agent, options.timeout).await {
        Ok(bytes) => {
            tracing::warn!(url = %url, "all mirrors failed, serving default image");
            Ok(Fetched {
                bytes,
                is_fallback: true,
            })
        }
        Err(e) => {
            tracing::warn!(url = %url, "default image fetch failed: {e}");
            Err(Error::InvalidImage("all fallbacks failed".into()))
        }
    }
}

/// One-shot GET used by the serve handler's mirror write-through.
pub async fn fetch_single(
    client: &reqwest::Client,
    url: &str,
    user_agent: &str,
) -> Result<Bytes> {
    try_get(client, url, user_agent, DEFAULT_TIMEOUT).await
}

async fn try_get(
    client: &reqwest::Client,
    url: &str,
    user_agent: &str,
    timeout: Duration,
) -> Result<Bytes> {
    let resp = client
        .get(url)
        .header(USER_AGENT, user_agent)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::UpstreamError(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::UpstreamError(format!("status {}", resp.status())));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::UpstreamError(e.to_string()))?;
    if bytes.is_empty() {
        return Err(Error::UpstreamError("empty body".into()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_order_is_fixed() {
        let urls = candidate_urls("https://x/y.jpg", "ztok");
        assert_eq!(
            urls,
            vec![
                "https://x/y.jpg".to_string(),
                "https://images.hive.blog/0x0/https://x/y.jpg".into(),
                "https://steemitimages.com/0x0/https://x/y.jpg".into(),
                "https://wsrv.nl/?url=https://x/y.jpg".into(),
                "https://img.leopedia.io/0x0/https://x/y.jpg".into(),
                "https://images.hive.blog/p/ztok".into(),
                "https://steemitimages.com/p/ztok".into(),
            ]
        );
    }

    #[test]
    fn skip_urls_filter() {
        let urls = candidate_urls("https://x/y.jpg", "ztok");
        let skip = vec!["https://x/y.jpg".to_string()];
        let remaining: Vec<_> = urls.iter().filter(|c| !skip.contains(c)).collect();
        assert_eq!(remaining.len(), urls.len() - 1);
        assert!(!remaining.iter().any(|c| c.as_str() == "https://x/y.jpg"));
    }
}
