use std::net::SocketAddr;
use std::path::PathBuf;

use imagehoster::config::Config;
use imagehoster::{router, AppState};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagehoster=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("IMAGEHOSTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = Config::load(&config_path)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.num_workers > 0 {
        builder.worker_threads(config.num_workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move {
        let port = config.port;
        let state = AppState::from_config(config).await?;
        let app = router(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!(%addr, "imagehoster listening");
        axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
        Ok(())
    })
}
