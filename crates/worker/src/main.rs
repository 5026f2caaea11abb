//! Helpdesk Worker
//!
//! Closes tickets whose auto-close grace period has elapsed.
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string (required)
//! - DATABASE_MAX_CONNECTIONS: pool size (default 3)
//! - AUTO_CLOSE_DEFAULT_HOURS: grace period when no setting is stored (default 24)
//! - AUTO_CLOSE_REFRESH_SECS: how often resolved tickets are refetched (default 60)
//! - LOG_FORMAT: `json` or `pretty`

mod sweeper;

use std::error::Error;
use std::sync::Arc;

use tracing::{info, warn};

use helpdesk_realtime::{init_tracing, Config};
use helpdesk_shared::{create_pool, run_migrations, PgStore};

use crate::sweeper::Sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    init_tracing(config.log_format);

    let pool = create_pool(config.require_database_url()?, config.database_max_connections).await?;
    run_migrations(&pool).await?;
    info!("Connected to database");

    let store = Arc::new(PgStore::new(pool));
    let sweeper = Sweeper::new(
        store,
        config.auto_close_default_hours,
        config.auto_close_refresh_interval(),
    );

    sweeper.run(shutdown_signal()).await;
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
