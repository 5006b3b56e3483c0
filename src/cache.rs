use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::error::{Error, Result};
use crate::fetch::{self, FetchOptions};
use crate::keys;
use crate::transform::{self, Processed, TransformOptions};
use crate::AppState;

/// Cache-control policies from the serving matrix.
const CACHE_HIT: &str = "public,max-age=31536000,immutable";
const CACHE_MISS: &str = "public,max-age=3600,stale-while-revalidate=86400";
const CACHE_FALLBACK: &str = "public,max-age=600";
const CACHE_BYPASS: &str = "no-cache,must-revalidate";

/// Bytes sniffed from a stored artifact before streaming the rest.
const SNIFF_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFlags {
    pub ignorecache: bool,
    pub invalidate: bool,
    pub refetch: bool,
    /// The handler substituted the default image (e.g. blacklisted URL);
    /// serve it with the short-TTL fallback policy and never cache it.
    pub force_fallback: bool,
}

impl CacheFlags {
    pub fn bypass(&self) -> bool {
        self.ignorecache || self.invalidate || self.refetch
    }
}

/// Serve `(url, opts)` through the two-layer cache: artifact hit, original
/// hit, or full fetch + transcode, writing back layers as they are produced.
///
/// `upload_orig` carries the `D…` key when the URL points at our own upload
/// store, in which case originals are read from (and written back to) it.
pub async fn serve_transformed(
    state: &AppState,
    url: Url,
    upload_orig: Option<String>,
    opts: TransformOptions,
    flags: CacheFlags,
    headers: &HeaderMap,
) -> Result<Response> {
    let orig_key = upload_orig
        .clone()
        .unwrap_or_else(|| keys::proxy_key(&url));
    let img_key = keys::image_key(&orig_key, &opts);
    let etag = format!("W/\"{img_key}\"");
    let bypass = flags.bypass();

    if !bypass && if_none_match_matches(headers, &etag) {
        return not_modified(&etag);
    }

    if flags.refetch {
        if let Err(e) = state.proxy_store.remove(&img_key).await {
            tracing::warn!(key = %img_key, "artifact evict failed: {e}");
        }
        if upload_orig.is_none() {
            if let Err(e) = state.proxy_store.remove(&orig_key).await {
                tracing::warn!(key = %orig_key, "original evict failed: {e}");
            }
        }
        state.purge.purge(url.as_str()).await;
    } else if flags.invalidate {
        state.purge.purge(url.as_str()).await;
    }

    if !bypass && !flags.force_fallback {
        if let Some(resp) = artifact_response(state, &img_key, &etag).await? {
            return Ok(resp);
        }
    }

    let orig_store = if upload_orig.is_some() {
        &state.upload_store
    } else {
        &state.proxy_store
    };

    let mut is_fallback = flags.force_fallback;
    let mut from_store = false;
    let mut original: Option<(Bytes, Option<String>)> = None;

    if !bypass {
        match orig_store.exists(&orig_key).await {
            Ok(true) => match orig_store.read(&orig_key).await {
                Ok(bytes) if !bytes.is_empty() => {
                    let content_type = transform::sniff_content_type(&bytes);
                    if content_type
                        .as_deref()
                        .is_some_and(transform::is_accepted_type)
                    {
                        from_store = true;
                        original = Some((bytes, content_type));
                    } else {
                        tracing::warn!(key = %orig_key, "cached original type not accepted, evicting");
                        if let Err(e) = orig_store.remove(&orig_key).await {
                            tracing::warn!(key = %orig_key, "original evict failed: {e}");
                        }
                    }
                }
                Ok(_) => {
                    tracing::warn!(key = %orig_key, "cached original is empty, evicting");
                    if let Err(e) = orig_store.remove(&orig_key).await {
                        tracing::warn!(key = %orig_key, "original evict failed: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %orig_key, "original read failed: {e}");
                }
            },
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %orig_key, "original probe failed: {e}");
            }
        }
    }

    let user_agent = state.config.user_agent();
    let url_params = keys::base58_enc(url.as_str());

    if original.is_none() {
        let fetched = fetch::fetch_image(
            &state.http,
            url.as_str(),
            &url_params,
            &user_agent,
            &state.config.default_avatar,
            &FetchOptions::default(),
        )
        .await?;
        is_fallback |= fetched.is_fallback;
        if !fetched.is_fallback && fetched.bytes.len() <= state.config.max_image_size {
            if let Err(e) = orig_store.write(&orig_key, fetched.bytes.clone()).await {
                tracing::warn!(key = %orig_key, "original write failed: {e}");
            }
        }
        let content_type = transform::sniff_content_type(&fetched.bytes);
        original = Some((fetched.bytes, content_type));
    }

    let Some((bytes, content_type)) = original else {
        return Err(Error::InternalError("original acquisition failed".into()));
    };

    let processed = match run_pipeline(bytes, content_type, opts, state).await {
        Ok(p) => p,
        Err(Error::InvalidImage(reason)) => {
            // The bytes in hand do not decode. Evict a corrupt cached
            // original and make one more attempt through the mirror
            // ladder, skipping the direct URL that produced them.
            if from_store {
                if let Err(e) = orig_store.remove(&orig_key).await {
                    tracing::warn!(key = %orig_key, "original evict failed: {e}");
                }
            }
            let retry = fetch::fetch_image(
                &state.http,
                url.as_str(),
                &url_params,
                &user_agent,
                &state.config.default_avatar,
                &FetchOptions {
                    skip_urls: vec![url.as_str().to_string()],
                    ..Default::default()
                },
            )
            .await
            .map_err(|_| Error::InvalidImage(reason.clone()))?;
            is_fallback |= retry.is_fallback;
            if !retry.is_fallback && retry.bytes.len() <= state.config.max_image_size {
                if let Err(e) = orig_store.write(&orig_key, retry.bytes.clone()).await {
                    tracing::warn!(key = %orig_key, "original write failed: {e}");
                }
            }
            let content_type = transform::sniff_content_type(&retry.bytes);
            run_pipeline(retry.bytes, content_type, opts, state)
                .await
                .map_err(|_| Error::InvalidImage(reason))?
        }
        Err(e) => return Err(e),
    };

    if !is_fallback {
        if let Err(e) = state
            .proxy_store
            .write(&img_key, processed.bytes.clone())
            .await
        {
            tracing::warn!(key = %img_key, "artifact write failed: {e}");
        }
    }

    let cache_control = if bypass {
        CACHE_BYPASS
    } else if is_fallback {
        CACHE_FALLBACK
    } else {
        CACHE_MISS
    };
    image_response(
        &processed.content_type,
        &etag,
        cache_control,
        Body::from(processed.bytes),
    )
}

async fn run_pipeline(
    bytes: Bytes,
    content_type: Option<String>,
    opts: TransformOptions,
    state: &AppState,
) -> Result<Processed> {
    let limits = state.limits;
    tokio::task::spawn_blocking(move || {
        transform::process(&bytes, content_type.as_deref(), &opts, &limits)
    })
    .await
    .map_err(|e| Error::InternalError(format!("pipeline task: {e}")))?
}

/// Stream a stored artifact back, sniffing the content type from its
/// leading bytes. `Ok(None)` means "treat as a miss"; an unreadable blob is
/// evicted and surfaces as a 500 so the next request rebuilds it.
async fn artifact_response(
    state: &AppState,
    img_key: &str,
    etag: &str,
) -> Result<Option<Response>> {
    match state.proxy_store.exists(img_key).await {
        Ok(true) => {}
        Ok(false) => return Ok(None),
        Err(e) => {
            tracing::warn!(key = %img_key, "artifact probe failed: {e}");
            return Ok(None);
        }
    }
    let mut reader = match state.proxy_store.reader(img_key).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(key = %img_key, "artifact open failed: {e}");
            return Ok(None);
        }
    };

    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut buf = [0u8; 8192];
    while head.len() < SNIFF_LEN {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
            Err(e) => {
                tracing::warn!(key = %img_key, "artifact stream failed, evicting: {e}");
                if let Err(e) = state.proxy_store.remove(img_key).await {
                    tracing::warn!(key = %img_key, "artifact evict failed: {e}");
                }
                return Err(Error::InternalError("artifact stream failed".into()));
            }
        }
    }
    if head.is_empty() {
        tracing::warn!(key = %img_key, "artifact is empty, evicting");
        if let Err(e) = state.proxy_store.remove(img_key).await {
            tracing::warn!(key = %img_key, "artifact evict failed: {e}");
        }
        return Ok(None);
    }

    let content_type =
        transform::sniff_content_type(&head).unwrap_or_else(|| "application/octet-stream".into());
    let prefix = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(head))]);
    let body = Body::from_stream(prefix.chain(ReaderStream::new(reader)));
    image_response(&content_type, etag, CACHE_HIT, body).map(Some)
}

fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .any(|candidate| candidate == "*" || candidate == etag)
        })
        .unwrap_or(false)
}

fn not_modified(etag: &str) -> Result<Response> {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(header::ETAG, etag)
        .header(header::VARY, "Accept")
        .body(Body::empty())
        .map_err(|e| Error::InternalError(e.to_string()))
}

fn image_response(
    content_type: &str,
    etag: &str,
    cache_control: &str,
    body: Body,
) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ETAG, etag)
        .header(header::VARY, "Accept")
        .header(header::CACHE_CONTROL, cache_control)
        .body(body)
        .map_err(|e| Error::InternalError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_none_match_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            "W/\"Uabc_0x0\", \"other\"".parse().unwrap(),
        );
        assert!(if_none_match_matches(&headers, "W/\"Uabc_0x0\""));
        assert!(!if_none_match_matches(&headers, "W/\"Uxyz_0x0\""));

        headers.insert(header::IF_NONE_MATCH, "*".parse().unwrap());
        assert!(if_none_match_matches(&headers, "W/\"anything\""));
    }

    #[test]
    fn bypass_composition() {
        assert!(!CacheFlags::default().bypass());
        assert!(CacheFlags {
            ignorecache: true,
            ..Default::default()
        }
        .bypass());
        assert!(CacheFlags {
            refetch: true,
            ..Default::default()
        }
        .bypass());
        assert!(!CacheFlags {
            force_fallback: true,
            ..Default::default()
        }
        .bypass());
    }
}
