use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Service error taxonomy. Variant names are part of the wire contract:
/// responses carry the snake_cased name in the JSON error body, so renaming
/// a variant is a breaking change (including the historical `QoutaExceeded`
/// spelling).
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("method not allowed")]
    InvalidMethod,
    #[error("invalid value for parameter {0}")]
    InvalidParam(String),
    #[error("missing required parameter {0}")]
    MissingParam(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("could not parse proxy url: {0}")]
    InvalidProxyUrl(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("upload contains no file")]
    FileMissing,
    #[error("content-length required")]
    LengthRequired,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("no such account: {0}")]
    NoSuchAccount(String),
    #[error("not found")]
    NotFound,
    #[error("account reputation too low")]
    Deplorable,
    #[error("upload quota exceeded")]
    QoutaExceeded { reset: u64 },
    #[error("blacklisted")]
    Blacklisted,
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The CamelCase kind name this variant is published under.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BadRequest",
            Error::InvalidMethod => "InvalidMethod",
            Error::InvalidParam(_) => "InvalidParam",
            Error::MissingParam(_) => "MissingParam",
            Error::InvalidSignature => "InvalidSignature",
            Error::InvalidProxyUrl(_) => "InvalidProxyUrl",
            Error::InvalidImage(_) => "InvalidImage",
            Error::FileMissing => "FileMissing",
            Error::LengthRequired => "LengthRequired",
            Error::PayloadTooLarge => "PayloadTooLarge",
            Error::NoSuchAccount(_) => "NoSuchAccount",
            Error::NotFound => "NotFound",
            Error::Deplorable => "Deplorable",
            Error::QoutaExceeded { .. } => "QoutaExceeded",
            Error::Blacklisted => "Blacklisted",
            Error::UpstreamError(_) => "UpstreamError",
            Error::InternalError(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_)
            | Error::InvalidParam(_)
            | Error::MissingParam(_)
            | Error::InvalidSignature
            | Error::InvalidProxyUrl(_)
            | Error::InvalidImage(_)
            | Error::FileMissing
            | Error::UpstreamError(_) => StatusCode::BAD_REQUEST,
            Error::InvalidMethod => StatusCode::METHOD_NOT_ALLOWED,
            Error::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NoSuchAccount(_) | Error::NotFound => StatusCode::NOT_FOUND,
            Error::Deplorable => StatusCode::FORBIDDEN,
            Error::QoutaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Blacklisted => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn info(&self) -> Option<serde_json::Value> {
        match self {
            Error::QoutaExceeded { reset } => Some(json!({ "reset": reset })),
            Error::InvalidParam(name) | Error::MissingParam(name) => {
                Some(json!({ "param": name }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if matches!(self, Error::InternalError(_)) {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::debug!("request rejected: {}", self);
        }
        let mut body = json!({ "error": { "name": camel_to_snake(self.kind()) } });
        if let Some(info) = self.info() {
            body["error"]["info"] = info;
        }
        (
            self.status(),
            [(header::CONTENT_TYPE, "application/json")],
            Json(body),
        )
            .into_response()
    }
}

/// `NoSuchAccount` -> `no_such_account`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_casing() {
        assert_eq!(camel_to_snake("NoSuchAccount"), "no_such_account");
        assert_eq!(camel_to_snake("QoutaExceeded"), "qouta_exceeded");
        assert_eq!(camel_to_snake("NotFound"), "not_found");
        assert_eq!(camel_to_snake("Blacklisted"), "blacklisted");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Error::LengthRequired.status(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(
            Error::QoutaExceeded { reset: 0 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Blacklisted.status(),
            StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
        );
        assert_eq!(
            Error::NoSuchAccount("x".into()).status(),
            StatusCode::NOT_FOUND
        );
    }
}
