use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Runtime configuration, loaded from a JSON file. Every field has a
/// default so a bare `Config::default()` yields a working local setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    /// Worker threads for the runtime. `0` sizes from the machine.
    pub num_workers: usize,
    /// Public base URL uploads and sentinels are expressed against.
    pub service_url: String,
    pub user_agent: Option<String>,
    /// Ordered JSON-RPC endpoints, tried with failover.
    pub rpc_node: Vec<String>,
    pub max_image_size: usize,
    pub default_avatar: String,
    pub default_cover: String,
    pub upload_store: StoreConfig,
    pub proxy_store: ProxyStoreConfig,
    pub upload_limits: UploadLimits,
    pub blacklist: BlacklistConfig,
    pub cloudflare_token: Option<String>,
    pub cloudflare_zone: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8800,
            num_workers: 0,
            service_url: "http://localhost:8800".into(),
            user_agent: None,
            rpc_node: vec!["https://api.hive.blog".into()],
            max_image_size: 30_000_000,
            default_avatar:
                "https://images.hive.blog/DQmb2HNSGKN3pakguJ4ChCRjgkVuDN9WniFRPmrxoJ4sjR4/default_avatar.png"
                    .into(),
            default_cover:
                "https://images.hive.blog/DQmTRCYvbNm6wjLMpRXdDiRrXpQAso9VPbSdKsWPUhSthVy/default_cover.png"
                    .into(),
            upload_store: StoreConfig {
                kind: StoreType::Fs,
                path: PathBuf::from("data/uploads"),
                s3_bucket: None,
                s3_prefix: String::new(),
            },
            proxy_store: ProxyStoreConfig::default(),
            upload_limits: UploadLimits::default(),
            blacklist: BlacklistConfig::default(),
            cloudflare_token: None,
            cloudflare_zone: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Fs,
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub kind: StoreType,
    pub path: PathBuf,
    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreType::Fs,
            path: PathBuf::from("data/proxied"),
            s3_bucket: None,
            s3_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyStoreConfig {
    #[serde(flatten)]
    pub store: StoreConfig,
    /// Clamp applied when the request leaves both dimensions unspecified.
    pub max_image_width: u32,
    pub max_image_height: u32,
    /// Hard cap on explicitly requested dimensions.
    pub max_custom_image_width: u32,
    pub max_custom_image_height: u32,
}

impl Default for ProxyStoreConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            max_image_width: 1280,
            max_image_height: 1280,
            max_custom_image_width: 8000,
            max_custom_image_height: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadLimits {
    /// Rate-limit window in milliseconds.
    pub duration: u64,
    /// Uploads allowed per window per account.
    pub max: u64,
    /// Minimum normalized reputation required to upload.
    pub reputation: f64,
    /// Account trusted to broadcast on behalf of token uploads.
    pub app_account: Option<String>,
    /// Posting WIF whose public key co-signs token uploads.
    pub app_posting_wif: Option<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            duration: 86_400_000,
            max: 100,
            reputation: 10.0,
            app_account: None,
            app_posting_wif: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Refresh interval for the remote sets, in milliseconds.
    pub cache_ttl: u64,
    pub images_url: Option<String>,
    pub accounts_url: Option<String>,
    pub seed_images_path: Option<PathBuf>,
    pub seed_accounts_path: Option<PathBuf>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            cache_ttl: 300_000,
            images_url: None,
            accounts_url: None,
            seed_images_path: None,
            seed_accounts_path: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("service_url cannot be empty")]
    EmptyServiceUrl,
    #[error("at least one rpc_node is required")]
    NoRpcNode,
    #[error("max_image_size must be > 0")]
    InvalidMaxImageSize,
    #[error("s3 store requires s3_bucket")]
    MissingBucket,
}

impl Config {
    /// Load from `path`, or fall back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_url.trim().is_empty() {
            return Err(ConfigError::EmptyServiceUrl);
        }
        if self.rpc_node.is_empty() {
            return Err(ConfigError::NoRpcNode);
        }
        if self.max_image_size == 0 {
            return Err(ConfigError::InvalidMaxImageSize);
        }
        for store in [&self.upload_store, &self.proxy_store.store] {
            if store.kind == StoreType::S3 && store.s3_bucket.is_none() {
                return Err(ConfigError::MissingBucket);
            }
        }
        Ok(())
    }

    /// `service_url` without a trailing slash, the form keys and
    /// sentinels are built from.
    pub fn service_base(&self) -> &str {
        self.service_url.trim_end_matches('/')
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("imagehoster/{}", env!("CARGO_PKG_VERSION")))
    }
}
