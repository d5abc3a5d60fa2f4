//! # 🧭 LearnPath
//!
//! Learning platform backend: AI-generated roadmaps and quizzes, progress
//! tracking, XP and achievements, and a community forum.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default settings (learnpath.db, port 3000)
//! learnpath
//!
//! # Custom database, port and generation service
//! LEARNPATH_AI_URL=http://localhost:5000 learnpath --db learn.db --port 8080
//!
//! # In-memory mode (for testing)
//! learnpath --memory
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use learnpath::ai::HttpAiClient;
use learnpath::api::{create_router, AppState};
use learnpath::config::{print_help, Config};
use learnpath::db::LearnStore;

fn print_banner(config: &Config) {
    println!(
        r#"
  🧭 LearnPath v{}

     API:        http://{}:{}/api
     Database:   {}
     Blobs:      {}
     Generation: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port,
        if config.in_memory { ":memory:" } else { config.db_path.as_str() },
        config.storage_path.display(),
        config.ai_base_url
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    if config.show_help {
        print_help();
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("learnpath=info,tower_http=info")),
        )
        .with_target(false)
        .compact()
        .init();

    // Initialize database
    let store = if config.in_memory {
        info!("🧪 Using in-memory database");
        Arc::new(LearnStore::in_memory().await?)
    } else {
        info!("💾 Using database file: {}", config.db_path);
        Arc::new(LearnStore::new(&config.db_path).await?)
    };

    let ai = Arc::new(HttpAiClient::new(config.ai_base_url.clone(), config.ai_timeout)?);
    let addr = config.bind_addr()?;
    print_banner(&config);

    let state = AppState::new(store, config, ai).await?;
    let _listeners = state.spawn_listeners();
    let app = create_router(state);

    info!("🚀 LearnPath listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
            info!("👋 Shutting down");
        })
        .await?;

    Ok(())
}
