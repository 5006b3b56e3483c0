use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use secp256k1::PublicKey;
use tower_http::trace::TraceLayer;
use url::Url;

pub mod blacklist;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod keys;
pub mod negotiate;
pub mod purge;
pub mod ratelimit;
pub mod rpc;
pub mod signature;
pub mod store;
pub mod transform;

pub use crate::error::{Error, Result};

use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::purge::CdnPurge;
use crate::ratelimit::{MemoryQuotaStore, RateLimiter};
use crate::rpc::RpcClient;
use crate::store::BlobStore;
use crate::transform::Limits;

/// Process-wide singletons handed to every handler. Built once at startup
/// and shared by reference for the life of the process.
pub struct AppState {
    pub config: Config,
    pub limits: Limits,
    pub http: reqwest::Client,
    pub upload_store: Arc<dyn BlobStore>,
    pub proxy_store: Arc<dyn BlobStore>,
    pub rpc: RpcClient,
    pub image_blacklist: Arc<Blacklist>,
    pub account_blacklist: Arc<Blacklist>,
    pub rate_limiter: RateLimiter,
    pub purge: CdnPurge,
    pub broadcaster_key: Option<PublicKey>,
    /// Parsed form of `config.default_avatar`, the universal fallback.
    pub default_avatar: Url,
}

impl AppState {
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::InternalError(format!("http client: {e}")))?;

        let upload_store = store::open(&config.upload_store)
            .await
            .map_err(|e| Error::InternalError(format!("upload store: {e}")))?;
        let proxy_store = store::open(&config.proxy_store.store)
            .await
            .map_err(|e| Error::InternalError(format!("proxy store: {e}")))?;

        let image_blacklist = Arc::new(Blacklist::new(
            "images",
            config.blacklist.seed_images_path.as_deref(),
        ));
        let account_blacklist = Arc::new(Blacklist::new(
            "accounts",
            config.blacklist.seed_accounts_path.as_deref(),
        ));
        let ttl = Duration::from_millis(config.blacklist.cache_ttl);
        if let Some(url) = &config.blacklist.images_url {
            blacklist::spawn_refresher(image_blacklist.clone(), http.clone(), url.clone(), ttl);
        }
        if let Some(url) = &config.blacklist.accounts_url {
            blacklist::spawn_refresher(account_blacklist.clone(), http.clone(), url.clone(), ttl);
        }

        let broadcaster_key = config
            .upload_limits
            .app_posting_wif
            .as_deref()
            .and_then(|wif| match signature::public_key_from_wif(wif) {
                Ok(key) => Some(key),
                Err(_) => {
                    tracing::warn!("app_posting_wif does not parse, token co-signing disabled");
                    None
                }
            });

        let default_avatar = keys::parse_plain_url(&config.default_avatar)?;
        let rpc = RpcClient::new(http.clone(), config.rpc_node.clone());
        let rate_limiter = RateLimiter::new(
            Arc::new(MemoryQuotaStore::new()),
            &config.upload_limits,
        );
        let purge = CdnPurge::new(
            http.clone(),
            config.cloudflare_token.clone(),
            config.cloudflare_zone.clone(),
        );
        let limits = Limits::from(&config.proxy_store);

        Ok(Arc::new(Self {
            config,
            limits,
            http,
            upload_store,
            proxy_store,
            rpc,
            image_blacklist,
            account_blacklist,
            rate_limiter,
            purge,
            broadcaster_key,
            default_avatar,
        }))
    }
}

/// Assemble the public route surface. Static prefixes (`/p`, `/u`, `/hs`,
/// `/webp`) take precedence over the catch-all serve/upload captures.
pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.config.max_image_size;
    Router::new()
        .route("/", get(handlers::healthcheck))
        .route("/healthcheck", get(handlers::healthcheck))
        .route(
            "/.well-known/healthcheck.json",
            get(handlers::healthcheck),
        )
        .route("/p/{url}", get(handlers::proxy))
        .route("/u/{username}/avatar", get(handlers::avatar))
        .route("/u/{username}/avatar/{size}", get(handlers::avatar_sized))
        .route("/u/{username}/cover", get(handlers::cover))
        .route("/hs/{accesstoken}", post(handlers::upload_hs))
        .route("/webp/{*rest}", get(handlers::webp_redirect))
        .route("/{first}", get(handlers::serve_one))
        .route(
            "/{first}/{*rest}",
            get(handlers::serve_or_redirect).post(handlers::upload),
        )
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
