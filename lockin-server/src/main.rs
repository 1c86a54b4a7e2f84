use std::sync::Arc;

use clap::Parser;
use lockin_core::LockinConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use lockin_server::http::{self, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "lockin.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match LockinConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if args.health {
        let pool = match lockin_core::db::create_pool(&config.storage).await {
            Ok(p) => p,
            Err(e) => {
                println!("❌ Screenshot store unavailable: {}", e);
                std::process::exit(1);
            }
        };
        match lockin_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ SQLite connected: {}", v),
            Err(e) => {
                println!("❌ SQLite health check failed: {}", e);
                std::process::exit(1);
            }
        }
        if std::env::var("OPENAI_API_KEY").map(|k| k.is_empty()).unwrap_or(true) {
            println!("❌ OPENAI_API_KEY is not set");
            std::process::exit(1);
        }
        println!("✅ LockIn health check passed");
        return Ok(());
    }

    let state = match HttpState::from_config(&config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to initialise LockIn server: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        model = state.pipeline.model_name(),
        max_retries = config.retry.max_retries,
        base_delay_ms = config.retry.base_delay_ms,
        "Analysis pipeline ready"
    );

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    http::start_http_server(state, &config, tx.subscribe()).await?;

    Ok(())
}
