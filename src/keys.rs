use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};
use crate::transform::{OutputFormat, ScalingMode, TransformOptions};

/// Multihash function codes used by the key scheme.
const MH_IDENTITY: u64 = 0x00;
const MH_SHA1: u64 = 0x11;
const MH_SHA2_256: u64 = 0x12;

/// Ordered domain-replacement table, applied as prefix rewrites before any
/// path rules. Order matters.
const DOMAIN_REPLACEMENTS: &[(&str, &str)] = &[
    (
        "https://img.3speakcontent.online/",
        "https://img.3speakcontent.co/",
    ),
    ("https://img.inleo.io/D", "https://img.leopedia.io/D"),
];

const ESTEEM_HOST: &str = "https://img.esteem.ws/";
const ESTEEM_WRAPPER: &str = "https://steemitimages.com/0x0/";

/// Extensions legacy clients append to proxy tokens (`/p/<b58>.png`).
const TOKEN_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".avif"];

fn varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Option<(u64, &[u8])> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in data.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, &data[i + 1..]));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

/// `<fn-code><len><digest>` multihash framing.
fn multihash(code: u64, digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(digest.len() + 4);
    varint(code, &mut out);
    varint(digest.len() as u64, &mut out);
    out.extend_from_slice(digest);
    out
}

fn multihash_decode(data: &[u8]) -> Option<(u64, &[u8])> {
    let (code, rest) = read_varint(data)?;
    let (len, rest) = read_varint(rest)?;
    if rest.len() as u64 != len {
        return None;
    }
    Some((code, rest))
}

/// Base58 of the identity-multihash framing of `s`. Reversible via
/// [`base58_dec`].
pub fn base58_enc(s: &str) -> String {
    bs58::encode(multihash(MH_IDENTITY, s.as_bytes())).into_string()
}

pub fn base58_dec(s: &str) -> Result<String> {
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|_| Error::InvalidProxyUrl(s.into()))?;
    let (code, payload) =
        multihash_decode(&raw).ok_or_else(|| Error::InvalidProxyUrl(s.into()))?;
    if code != MH_IDENTITY {
        return Err(Error::InvalidProxyUrl(s.into()));
    }
    String::from_utf8(payload.to_vec()).map_err(|_| Error::InvalidProxyUrl(s.into()))
}

/// Content-addressed key for uploaded bytes: `D` + b58(multihash-sha256).
/// A pure function of the bytes, so re-uploading is idempotent.
pub fn upload_key(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!(
        "D{}",
        bs58::encode(multihash(MH_SHA2_256, &digest)).into_string()
    )
}

/// URL-addressed key for proxied originals: `U` + b58(multihash-sha1).
/// Hashes the canonicalized URL string with cache-control params removed.
pub fn proxy_key(url: &Url) -> String {
    let sanitized = sanitize_cache_params(url);
    let digest = Sha1::digest(sanitized.as_str().as_bytes());
    format!(
        "U{}",
        bs58::encode(multihash(MH_SHA1, &digest)).into_string()
    )
}

/// Strip the cache-bypass query parameters so they never influence the
/// original's identity.
pub fn sanitize_cache_params(url: &Url) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "ignorecache" | "invalidate" | "refetch"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut out = url.clone();
    if retained.is_empty() {
        out.set_query(None);
    } else {
        out.query_pairs_mut().clear().extend_pairs(retained).finish();
    }
    out
}

/// Deterministic artifact key for `(orig, opts)`.
///
/// `(Fit, Match)` keeps the compact `{orig}_{W}x{H}` form because existing
/// stored artifacts were written under it; every other combination spells
/// out mode and format, appending only the dimensions that are set.
pub fn image_key(orig: &str, opts: &TransformOptions) -> String {
    if opts.mode == ScalingMode::Fit && opts.format == OutputFormat::Match {
        return format!("{}_{}x{}", orig, opts.width, opts.height);
    }
    let mut key = format!("{}_{}_{}", orig, opts.mode, opts.format);
    if opts.width > 0 {
        key.push_str(&format!("_{}", opts.width));
    }
    if opts.height > 0 {
        key.push_str(&format!("_{}", opts.height));
    }
    key
}

/// Parse a URL that must be absolute, failing loudly.
pub fn parse_plain_url(s: &str) -> Result<Url> {
    Url::parse(s.trim()).map_err(|_| Error::InvalidProxyUrl(s.into()))
}

/// Decode a `/p/` token. Never fails: anything that cannot be decoded or
/// parsed resolves to the configured fallback image so the proxy path stays
/// robust against garbage tokens.
pub fn parse_proxied_url(token: &str, fallback: &Url) -> Url {
    let token = strip_token_extension(token);
    let decoded = match base58_dec(token) {
        Ok(s) => s,
        Err(_) => return fallback.clone(),
    };
    let trimmed = decoded.trim_end_matches('/');
    match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => fallback.clone(),
    }
}

/// Drop a trailing image extension legacy clients append to tokens.
pub fn strip_token_extension(token: &str) -> &str {
    let lower = token.to_ascii_lowercase();
    for ext in TOKEN_EXTENSIONS {
        if lower.ends_with(ext) {
            return &token[..token.len() - ext.len()];
        }
    }
    token
}

/// Apply the domain-replacement table, then the per-domain path rules.
/// Path rules match against the post-replacement domain. Idempotent.
pub fn canonicalize(url: &str) -> String {
    let mut s = url.trim().to_string();
    for (from, to) in DOMAIN_REPLACEMENTS {
        if s.starts_with(from) {
            s = format!("{}{}", to, &s[from.len()..]);
        }
    }
    if s.starts_with("https://img.3speakcontent.co/") {
        s = s.replacen("/post.png", "/thumbnails/default.png", 1);
    }
    if s.contains(ESTEEM_HOST) && !s.starts_with(ESTEEM_WRAPPER) {
        s = format!("{}{}", ESTEEM_WRAPPER, s);
    }
    s
}

/// Exact match on the `{service}/0x0` sentinel.
pub fn is_empty_image_url(s: &str, service_base: &str) -> bool {
    s == format!("{service_base}/0x0")
}

/// Prefix match on the `{service}/0x0/` sentinel.
pub fn starts_with_empty_image_prefix(s: &str, service_base: &str) -> bool {
    s.starts_with(&format!("{service_base}/0x0/"))
}

/// Unwrap URLs that point back at our own proxy (`…/p/<token>` or the
/// `…/0x0/<url>` sentinel) until they target something external. The loop
/// is bounded so pathological self-referencing tokens terminate.
pub fn unwrap_proxied(mut url: Url, service_base: &str, fallback: &Url) -> Url {
    for _ in 0..4 {
        let s = url.as_str().trim_end_matches('/').to_string();
        if let Some(inner) = s.strip_prefix(&format!("{service_base}/p/")) {
            url = parse_proxied_url(inner, fallback);
            continue;
        }
        if let Some(inner) = s.strip_prefix(&format!("{service_base}/0x0/")) {
            match Url::parse(inner) {
                Ok(u) => {
                    url = u;
                    continue;
                }
                Err(_) => return fallback.clone(),
            }
        }
        break;
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_round_trip() {
        for s in [
            "https://example.com/image.jpg",
            "",
            "unicode ☃ mixed",
            &"x".repeat(500),
        ] {
            assert_eq!(base58_dec(&base58_enc(s)).unwrap(), s);
        }
    }

    #[test]
    fn base58_dec_rejects_garbage() {
        assert!(base58_dec("not-base58-0OIl").is_err());
        assert!(base58_dec("zzzz").is_err());
    }

    #[test]
    fn upload_key_is_deterministic() {
        let a = upload_key(b"some image bytes");
        let b = upload_key(b"some image bytes");
        assert_eq!(a, b);
        assert!(a.starts_with('D'));
        assert_ne!(a, upload_key(b"other bytes"));
    }

    #[test]
    fn proxy_key_ignores_cache_params() {
        let plain = Url::parse("https://example.com/a.jpg?width=10").unwrap();
        let noisy =
            Url::parse("https://example.com/a.jpg?width=10&refetch=1&ignorecache=1").unwrap();
        assert_eq!(proxy_key(&plain), proxy_key(&noisy));
        assert!(proxy_key(&plain).starts_with('U'));

        let other = Url::parse("https://example.com/a.jpg?width=11").unwrap();
        assert_ne!(proxy_key(&plain), proxy_key(&other));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let url = Url::parse("https://x/y?a=1&invalidate=1&refetch=1").unwrap();
        let once = sanitize_cache_params(&url);
        assert_eq!(once.as_str(), "https://x/y?a=1");
        assert_eq!(sanitize_cache_params(&once), once);
    }

    #[test]
    fn image_key_legacy_form() {
        let opts = TransformOptions {
            width: 500,
            height: 300,
            mode: ScalingMode::Fit,
            format: OutputFormat::Match,
        };
        assert_eq!(image_key("Uabc", &opts), "Uabc_500x300");

        let unset = TransformOptions::default();
        assert_eq!(image_key("Uabc", &unset), "Uabc_0x0");
    }

    #[test]
    fn image_key_long_form() {
        let opts = TransformOptions {
            width: 128,
            height: 128,
            mode: ScalingMode::Cover,
            format: OutputFormat::WEBP,
        };
        assert_eq!(image_key("Uabc", &opts), "Uabc_Cover_WEBP_128_128");

        let no_width = TransformOptions {
            width: 0,
            height: 240,
            mode: ScalingMode::Fit,
            format: OutputFormat::AVIF,
        };
        assert_eq!(image_key("Uabc", &no_width), "Uabc_Fit_AVIF_240");

        let no_dims = TransformOptions {
            width: 0,
            height: 0,
            mode: ScalingMode::Cover,
            format: OutputFormat::Match,
        };
        assert_eq!(image_key("Uabc", &no_dims), "Uabc_Cover_Match");
    }

    #[test]
    fn proxied_url_round_trip() {
        let fallback = Url::parse("https://fallback/img.png").unwrap();
        let url = Url::parse("https://example.com/path/img.jpg?x=1").unwrap();
        let token = base58_enc(url.as_str());
        assert_eq!(parse_proxied_url(&token, &fallback), url);
    }

    #[test]
    fn proxied_url_soft_fails() {
        let fallback = Url::parse("https://fallback/img.png").unwrap();
        assert_eq!(parse_proxied_url("!!!", &fallback), fallback);
        // decodes but is not an absolute URL
        let token = base58_enc("not a url");
        assert_eq!(parse_proxied_url(&token, &fallback), fallback);
    }

    #[test]
    fn proxied_url_accepts_extension_suffix() {
        let fallback = Url::parse("https://fallback/img.png").unwrap();
        let url = Url::parse("https://example.com/a.jpg").unwrap();
        let token = format!("{}.png", base58_enc(url.as_str()));
        assert_eq!(parse_proxied_url(&token, &fallback), url);
    }

    #[test]
    fn canonicalize_applies_tables_in_order() {
        assert_eq!(
            canonicalize("https://img.3speakcontent.online/vid/post.png"),
            "https://img.3speakcontent.co/vid/thumbnails/default.png"
        );
        assert_eq!(
            canonicalize("https://img.inleo.io/Dabc/x.png"),
            "https://img.leopedia.io/Dabc/x.png"
        );
        assert_eq!(
            canonicalize("https://img.esteem.ws/abc.jpg"),
            "https://steemitimages.com/0x0/https://img.esteem.ws/abc.jpg"
        );
        // untouched URLs pass through
        assert_eq!(
            canonicalize("https://example.com/a.png"),
            "https://example.com/a.png"
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for s in [
            "https://img.3speakcontent.online/vid/post.png",
            "https://img.esteem.ws/abc.jpg",
            "https://example.com/a.png",
        ] {
            let once = canonicalize(s);
            assert_eq!(canonicalize(&once), once);
        }
    }

    #[test]
    fn empty_image_sentinels() {
        let base = "https://images.hive.blog";
        assert!(is_empty_image_url("https://images.hive.blog/0x0", base));
        assert!(!is_empty_image_url("https://images.hive.blog/0x0/", base));
        assert!(starts_with_empty_image_prefix(
            "https://images.hive.blog/0x0/https://x/y.jpg",
            base
        ));
    }

    #[test]
    fn unwraps_double_proxied_urls() {
        let base = "https://images.hive.blog";
        let fallback = Url::parse("https://fallback/img.png").unwrap();
        let target = Url::parse("https://example.com/cat.jpg").unwrap();
        let once = format!("{base}/p/{}", base58_enc(target.as_str()));
        let twice = Url::parse(&format!("{base}/p/{}", base58_enc(&once))).unwrap();
        assert_eq!(unwrap_proxied(twice, base, &fallback), target);

        let sentinel =
            Url::parse(&format!("{base}/0x0/https://example.com/cat.jpg")).unwrap();
        assert_eq!(unwrap_proxied(sentinel, base, &fallback), target);
    }

    #[test]
    fn unwrap_is_bounded() {
        let base = "https://images.hive.blog";
        let fallback = Url::parse("https://fallback/img.png").unwrap();
        // token chain deeper than the bound: the loop must terminate
        let mut url = "https://example.com/leaf.jpg".to_string();
        for _ in 0..8 {
            url = format!("{base}/p/{}", base58_enc(&url));
        }
        let parsed = Url::parse(&url).unwrap();
        let out = unwrap_proxied(parsed, base, &fallback);
        // still pointing at the service after 4 unwraps
        assert!(out.as_str().starts_with(base));
    }
}
