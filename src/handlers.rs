use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::cache::{self, CacheFlags};
use crate::error::{Error, Result};
use crate::fetch;
use crate::keys;
use crate::negotiate;
use crate::rpc::{self, Account};
use crate::signature::{self, TokenContext, UploadToken};
use crate::transform::{self, OutputFormat, ScalingMode, TransformOptions};
use crate::AppState;

/// Upstream CDNs consulted when an upload key is missing locally.
const SERVE_MIRRORS: &[&str] = &["https://images.hive.blog", "https://steemitimages.com"];

const AVATAR_DEFAULT_SIZE: u32 = 128;
const AVATAR_MIN_SIZE: u32 = 32;
const AVATAR_MAX_SIZE: u32 = 1024;
const COVER_WIDTH: u32 = 1344;
const COVER_HEIGHT: u32 = 240;

pub async fn healthcheck() -> Response {
    let date = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Json(json!({
            "ok": true,
            "version": env!("CARGO_PKG_VERSION"),
            "date": date,
        })),
    )
        .into_response()
}

/// Raw query surface shared by the image-serving endpoints. Values are kept
/// as strings so a bad value maps to `InvalidParam` instead of a framework
/// rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransformQuery {
    width: Option<String>,
    height: Option<String>,
    mode: Option<String>,
    format: Option<String>,
    ignorecache: Option<String>,
    invalidate: Option<String>,
    refetch: Option<String>,
}

impl TransformQuery {
    fn parse(&self) -> Result<(TransformOptions, CacheFlags)> {
        let width = parse_dimension(self.width.as_deref(), "width")?;
        let height = parse_dimension(self.height.as_deref(), "height")?;
        let mode = match self.mode.as_deref() {
            None | Some("") => ScalingMode::Fit,
            Some("cover") => ScalingMode::Cover,
            Some("fit") => ScalingMode::Fit,
            Some(_) => return Err(Error::InvalidParam("mode".into())),
        };
        let format = match self.format.as_deref() {
            None | Some("") | Some("match") => OutputFormat::Match,
            Some("jpeg") | Some("jpg") => OutputFormat::JPEG,
            Some("png") => OutputFormat::PNG,
            Some("webp") => OutputFormat::WEBP,
            Some("avif") => OutputFormat::AVIF,
            Some(_) => return Err(Error::InvalidParam("format".into())),
        };
        Ok((
            TransformOptions {
                width,
                height,
                mode,
                format,
            },
            CacheFlags {
                ignorecache: flag(self.ignorecache.as_deref()),
                invalidate: flag(self.invalidate.as_deref()),
                refetch: flag(self.refetch.as_deref()),
                force_fallback: false,
            },
        ))
    }

    fn flags(&self) -> CacheFlags {
        CacheFlags {
            ignorecache: flag(self.ignorecache.as_deref()),
            invalidate: flag(self.invalidate.as_deref()),
            refetch: flag(self.refetch.as_deref()),
            force_fallback: false,
        }
    }
}

fn parse_dimension(value: Option<&str>, name: &'static str) -> Result<u32> {
    match value {
        None | Some("") => Ok(0),
        Some(s) => s.parse().map_err(|_| Error::InvalidParam(name.into())),
    }
}

fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true"))
}

/// GET `/p/{url}` — the main proxy path.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(raw): Query<TransformQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let (opts, flags) = raw.parse()?;
    let url = keys::parse_proxied_url(&token, &state.default_avatar);
    serve_image(&state, url, opts, flags, &headers, true).await
}

/// Shared tail of every transforming endpoint: unwrap self-references,
/// canonicalize, map sentinels and blacklisted URLs to the default image,
/// negotiate `match`, and hand off to the cache engine.
async fn serve_image(
    state: &AppState,
    url: Url,
    mut opts: TransformOptions,
    mut flags: CacheFlags,
    headers: &HeaderMap,
    negotiate_match: bool,
) -> Result<Response> {
    let base = state.config.service_base();
    let unwrapped = keys::unwrap_proxied(url, base, &state.default_avatar);
    let canonical = keys::canonicalize(unwrapped.as_str());
    let mut url = if canonical != unwrapped.as_str() {
        keys::parse_plain_url(&canonical)?
    } else {
        unwrapped
    };

    if keys::is_empty_image_url(url.as_str().trim_end_matches('/'), base) {
        url = state.default_avatar.clone();
    }
    if state.image_blacklist.contains(url.as_str()) {
        tracing::info!(url = %url, "blacklisted image url, serving default");
        url = state.default_avatar.clone();
        flags.force_fallback = true;
    }
    if negotiate_match && opts.format == OutputFormat::Match {
        opts.format = negotiate::resolve_match(headers);
    }
    let upload_orig = own_upload_key(&url, base);
    cache::serve_transformed(state, url, upload_orig, opts, flags, headers).await
}

/// A proxied URL pointing back at our own upload store resolves straight to
/// its `D…` key instead of an HTTP round-trip to ourselves.
fn own_upload_key(url: &Url, base: &str) -> Option<String> {
    let rest = url.as_str().strip_prefix(base)?.strip_prefix('/')?;
    let first = rest.split(['/', '?']).next()?;
    (first.len() > 20 && first.starts_with('D')).then(|| first.to_string())
}

/// GET `/u/{username}/avatar` and `/u/{username}/avatar/{size}`.
pub async fn avatar(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(raw): Query<TransformQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    avatar_inner(&state, &username, None, raw, headers).await
}

pub async fn avatar_sized(
    State(state): State<Arc<AppState>>,
    Path((username, size)): Path<(String, String)>,
    Query(raw): Query<TransformQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    avatar_inner(&state, &username, Some(size), raw, headers).await
}

async fn avatar_inner(
    state: &AppState,
    username: &str,
    size: Option<String>,
    raw: TransformQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let size = match size.as_deref() {
        None | Some("") => AVATAR_DEFAULT_SIZE,
        Some(s) => s
            .parse::<u32>()
            .map_err(|_| Error::InvalidParam("size".into()))?,
    }
    .clamp(AVATAR_MIN_SIZE, AVATAR_MAX_SIZE);

    let image = profile_image_url(state, username, false).await?;
    let url = keys::parse_plain_url(&image).unwrap_or_else(|_| state.default_avatar.clone());
    let opts = TransformOptions {
        width: size,
        height: size,
        mode: ScalingMode::Cover,
        format: negotiate::resolve_webp_only(&headers),
    };
    serve_image(state, url, opts, raw.flags(), &headers, false).await
}

/// GET `/u/{username}/cover`.
pub async fn cover(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(raw): Query<TransformQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let image = profile_image_url(&state, &username, true).await?;
    let url = keys::parse_plain_url(&image).unwrap_or_else(|_| state.default_avatar.clone());
    let opts = TransformOptions {
        width: COVER_WIDTH,
        height: COVER_HEIGHT,
        mode: ScalingMode::Fit,
        format: negotiate::resolve_match(&headers),
    };
    serve_image(&state, url, opts, raw.flags(), &headers, false).await
}

async fn profile_image_url(state: &AppState, username: &str, cover: bool) -> Result<String> {
    if !rpc::is_valid_username(username) {
        return Err(Error::NoSuchAccount(username.into()));
    }
    let profile = state
        .rpc
        .get_profile(username)
        .await?
        .ok_or_else(|| Error::NoSuchAccount(username.into()))?;
    let configured = if cover {
        profile.metadata.profile.cover_image
    } else {
        profile.metadata.profile.profile_image
    };
    Ok(configured
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| {
            if cover {
                state.config.default_cover.clone()
            } else {
                state.config.default_avatar.clone()
            }
        }))
}

/// GET `/{first}` — serve an upload-store blob.
pub async fn serve_one(
    State(state): State<Arc<AppState>>,
    Path(first): Path<String>,
) -> Result<Response> {
    serve_upload(&state, &first).await
}

/// GET `/{first}/{*rest}` — either a `{W}x{H}` legacy redirect or an
/// upload-store blob with a cosmetic filename suffix.
pub async fn serve_or_redirect(
    State(state): State<Arc<AppState>>,
    Path((first, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    if let Some((w, h)) = parse_dims(&first) {
        let mut target = rest;
        if let Some(q) = query {
            target.push('?');
            target.push_str(&q);
        }
        let token = keys::base58_enc(&target);
        let location = format!("/p/{token}.png?format=match&mode=fit&width={w}&height={h}");
        return moved_permanently(&location);
    }
    serve_upload(&state, &first).await
}

fn moved_permanently(location: &str) -> Result<Response> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(axum::body::Body::empty())
        .map_err(|e| Error::InternalError(e.to_string()))
}

fn parse_dims(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    if w.is_empty() || h.is_empty() {
        return None;
    }
    Some((w.parse().ok()?, h.parse().ok()?))
}

async fn serve_upload(state: &AppState, key: &str) -> Result<Response> {
    if key.is_empty() {
        return Err(Error::NotFound);
    }
    if let Ok(bytes) = state.upload_store.read(key).await {
        let content_type = transform::sniff_content_type(&bytes)
            .unwrap_or_else(|| "application/octet-stream".into());
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ETAG, format!("\"{key}\""))
            .header(header::CACHE_CONTROL, "public,max-age=31536000,immutable")
            .body(axum::body::Body::from(bytes))
            .map_err(|e| Error::InternalError(e.to_string()));
    }

    // Not here: pull it from a mirror so the next request can serve it,
    // but still answer 404 so the client falls back to `/p/`.
    let user_agent = state.config.user_agent();
    for mirror in SERVE_MIRRORS {
        if state.config.service_base().starts_with(mirror) {
            continue;
        }
        let target = format!("{mirror}/{key}");
        match fetch::fetch_single(&state.http, &target, &user_agent).await {
            Ok(bytes) if bytes.len() <= state.config.max_image_size => {
                if let Err(e) = state.upload_store.write(key, bytes).await {
                    tracing::warn!(key, "mirror write-through failed: {e}");
                }
                break;
            }
            Ok(_) => break,
            Err(e) => {
                tracing::debug!(url = %target, "mirror miss: {e}");
            }
        }
    }
    Err(Error::NotFound)
}

/// GET `/webp/{*rest}` — historical prefix, redirect to the plain path.
pub async fn webp_redirect(
    Path(rest): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let mut location = format!("/{rest}");
    if let Some(q) = query {
        location.push('?');
        location.push_str(&q);
    }
    moved_permanently(&location)
}

/// POST `/{username}/{signature}` — direct or token-signed upload.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path((username, signature)): Path<(String, String)>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response> {
    let (data, filename) = read_upload(&state, &headers, multipart).await?;
    if signature.starts_with("stndt") {
        // historical test backdoor, permanently disabled
        return Err(Error::InvalidSignature);
    }
    let account = load_account(&state, &username).await?;
    if signature.starts_with("hive") {
        let token = signature::decode_token(signature::strip_token_wrapper(&signature))?;
        verify_token_for(&state, &token, &account, &username)?;
    } else {
        signature::verify_direct(&account, &signature, &data)?;
    }
    admit(&state, &username).await?;
    store_upload(&state, data, filename).await
}

/// POST `/hs/{accesstoken}` — token-only upload, author comes from the token.
pub async fn upload_hs(
    State(state): State<Arc<AppState>>,
    Path(raw_token): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response> {
    let (data, filename) = read_upload(&state, &headers, multipart).await?;
    let token = signature::decode_token(&raw_token)?;
    let username = token.author()?.to_string();
    let account = load_account(&state, &username).await?;
    verify_token_for(&state, &token, &account, &username)?;
    admit(&state, &username).await?;
    store_upload(&state, data, filename).await
}

fn verify_token_for(
    state: &AppState,
    token: &UploadToken,
    account: &Account,
    username: &str,
) -> Result<()> {
    if token.author()? != username {
        return Err(Error::InvalidSignature);
    }
    let ctx = TokenContext {
        app_account: state.config.upload_limits.app_account.as_deref(),
        broadcaster_key: state.broadcaster_key.as_ref(),
    };
    signature::verify_token(token, account, &ctx)
}

async fn read_upload(
    state: &AppState,
    headers: &HeaderMap,
    mut multipart: Multipart,
) -> Result<(Bytes, String)> {
    let length: usize = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(Error::LengthRequired)?;
    if length > state.config.max_image_size {
        return Err(Error::PayloadTooLarge);
    }

    let mut file: Option<(Bytes, String)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| Error::BadRequest("malformed multipart body".into()))?
    {
        if field.file_name().is_none() && field.name() != Some("file") {
            continue;
        }
        let filename = sanitize_filename(field.file_name());
        let data = field
            .bytes()
            .await
            .map_err(|_| Error::BadRequest("could not read upload body".into()))?;
        file = Some((data, filename));
        break;
    }
    let (data, filename) = file.ok_or(Error::FileMissing)?;
    if data.is_empty() {
        return Err(Error::FileMissing);
    }
    if data.len() > state.config.max_image_size {
        return Err(Error::PayloadTooLarge);
    }
    let content_type = transform::sniff_content_type(&data)
        .ok_or_else(|| Error::InvalidImage("unrecognized image data".into()))?;
    if !transform::is_accepted_type(&content_type) {
        return Err(Error::InvalidImage(format!(
            "unsupported content type {content_type}"
        )));
    }
    Ok((data, filename))
}

fn sanitize_filename(name: Option<&str>) -> String {
    let cleaned: String = name
        .unwrap_or("image")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.is_empty() {
        "image".into()
    } else {
        cleaned
    }
}

async fn load_account(state: &AppState, username: &str) -> Result<Account> {
    if !rpc::is_valid_username(username) {
        return Err(Error::NoSuchAccount(username.into()));
    }
    state
        .rpc
        .get_account(username)
        .await?
        .ok_or_else(|| Error::NoSuchAccount(username.into()))
}

/// Admission checks after signature verification, in contract order:
/// blacklist, quota, reputation.
async fn admit(state: &AppState, username: &str) -> Result<()> {
    if state.account_blacklist.contains(username) {
        return Err(Error::Blacklisted);
    }
    state.rate_limiter.check(username).await?;
    let reputation = state
        .rpc
        .get_profile(username)
        .await?
        .map(|p| p.reputation)
        .unwrap_or_default();
    if reputation < state.config.upload_limits.reputation {
        return Err(Error::Deplorable);
    }
    Ok(())
}

async fn store_upload(state: &AppState, data: Bytes, filename: String) -> Result<Response> {
    let key = keys::upload_key(&data);
    let exists = state.upload_store.exists(&key).await.unwrap_or(false);
    if !exists {
        state
            .upload_store
            .write(&key, data)
            .await
            .map_err(|e| Error::InternalError(format!("upload write: {e}")))?;
    }
    let url = format!("{}/{}/{}", state.config.service_base(), key, filename);
    Ok(Json(json!({ "url": url })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_parsing() {
        assert_eq!(parse_dims("500x300"), Some((500, 300)));
        assert_eq!(parse_dims("0x0"), Some((0, 0)));
        assert_eq!(parse_dims("Dxy"), None);
        assert_eq!(parse_dims("x300"), None);
        assert_eq!(parse_dims("500x"), None);
        assert_eq!(parse_dims("healthcheck"), None);
        assert_eq!(parse_dims("-1x5"), None);
    }

    #[test]
    fn filename_sanitizing() {
        assert_eq!(sanitize_filename(Some("test.jpg")), "test.jpg");
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "....etcpasswd");
        assert_eq!(sanitize_filename(Some("")), "image");
        assert_eq!(sanitize_filename(None), "image");
    }

    #[test]
    fn own_upload_key_detection() {
        let base = "https://images.hive.blog";
        let own = Url::parse("https://images.hive.blog/DQmabcdefghijklmnopqrstuvwx/pic.png")
            .unwrap();
        assert_eq!(
            own_upload_key(&own, base).as_deref(),
            Some("DQmabcdefghijklmnopqrstuvwx")
        );
        let external = Url::parse("https://example.com/DQmabcdefghijklmnopqrstuvwx").unwrap();
        assert_eq!(own_upload_key(&external, base), None);
        let short = Url::parse("https://images.hive.blog/D123").unwrap();
        assert_eq!(own_upload_key(&short, base), None);
    }

    #[test]
    fn query_parsing() {
        let raw = TransformQuery {
            width: Some("500".into()),
            height: Some("0".into()),
            mode: Some("cover".into()),
            format: Some("jpg".into()),
            refetch: Some("1".into()),
            ..Default::default()
        };
        let (opts, flags) = raw.parse().unwrap();
        assert_eq!(opts.width, 500);
        assert_eq!(opts.height, 0);
        assert_eq!(opts.mode, ScalingMode::Cover);
        assert_eq!(opts.format, OutputFormat::JPEG);
        assert!(flags.refetch && !flags.ignorecache);

        let bad = TransformQuery {
            width: Some("wide".into()),
            ..Default::default()
        };
        assert!(matches!(bad.parse(), Err(Error::InvalidParam(_))));

        let bad_mode = TransformQuery {
            mode: Some("stretch".into()),
            ..Default::default()
        };
        assert!(matches!(bad_mode.parse(), Err(Error::InvalidParam(_))));
    }
}
