use axum::http::{header, HeaderMap};

use crate::transform::OutputFormat;

fn accept_header(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn supports_webp(accept: &str) -> bool {
    accept.to_ascii_lowercase().contains("image/webp")
}

pub fn supports_avif(accept: &str) -> bool {
    accept.to_ascii_lowercase().contains("image/avif")
}

/// Resolve a `match` request against the caller's `Accept` header:
/// AVIF when accepted, else WEBP, else keep whatever the source decodes to.
pub fn resolve_match(headers: &HeaderMap) -> OutputFormat {
    let accept = accept_header(headers);
    if supports_avif(&accept) {
        OutputFormat::AVIF
    } else if supports_webp(&accept) {
        OutputFormat::WEBP
    } else {
        OutputFormat::Match
    }
}

/// Avatar variant: only WEBP is negotiated.
pub fn resolve_webp_only(headers: &HeaderMap) -> OutputFormat {
    if supports_webp(&accept_header(headers)) {
        OutputFormat::WEBP
    } else {
        OutputFormat::Match
    }
}
