use std::sync::Arc;

use around::config::{Args, Config};
use around::server::AroundServer;
use around::Around;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = Args::parse();
    let config = args.to_config();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.worker_threads {
        builder.worker_threads(threads);
    }
    let runtime = match builder.enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(config)) {
        tracing::error!("{}", e);
        eprintln!("around: {}", e);
        std::process::exit(1);
    }
}

async fn async_main(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,around=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    tracing::info!(
        index = %config.index.url,
        bucket = %config.assets.bucket,
        cache = config.cache.enabled,
        ttl_secs = config.cache.ttl.as_secs(),
        "starting around"
    );

    let app = Arc::new(Around::from_config(&config));

    // Schema failures are fatal: nothing can be written or queried without it
    app.bootstrap().await?;
    tracing::info!("geo index ready");

    let server = AroundServer::new(app, config.server.clone());
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
