//! Authority HTTP server

pub mod bearer;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub use router::{AppState, create_router};

use crate::authority::Authority;
use crate::config::Config;
use crate::keys::KeyRotator;
use crate::token::spawn_reaper;
use crate::{Error, Result};

/// Token authority server
pub struct Server {
    config: Config,
    authority: Arc<Authority>,
}

impl Server {
    /// Build the authority from `config`, bootstrapping a signing key if the
    /// store is empty.
    pub async fn new(config: Config) -> Result<Self> {
        let authority = Arc::new(Authority::from_config(&config).await?);
        Ok(Self { config, authority })
    }

    /// Run until Ctrl+C / SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let rotator = KeyRotator::new(
            Arc::clone(self.authority.keys()),
            self.config.keys.rotation_window,
            self.config.keys.check_interval,
        )
        .spawn(shutdown_tx.subscribe());
        let reaper = spawn_reaper(
            Arc::clone(self.authority.authorizations()),
            self.config.authorizations.reap_interval,
            shutdown_tx.subscribe(),
        );

        let state = AppState::new(Arc::clone(&self.authority));
        #[cfg(feature = "metrics")]
        let state = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => state.with_metrics(handle),
            Err(e) => {
                warn!(error = %e, "Failed to install Prometheus recorder, /metrics disabled");
                state
            }
        };
        let app = create_router(Arc::new(state), &self.config.server);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("TOKEN AUTHORITY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %self.authority.issuer(), "Issuer");
        info!(
            clients = self.authority.clients().iter().count(),
            grants = ?self.authority.grants().grant_types(),
            "Clients registered"
        );
        info!(
            rotation_window = ?self.config.keys.rotation_window,
            check_interval = ?self.config.keys.check_interval,
            "Key rotation scheduled"
        );
        info!("  POST http://{addr}/oauth2/token");
        info!("  GET  http://{addr}/oauth2/jwks");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Stopping background tasks...");
        let drained = tokio::time::timeout(self.config.server.shutdown_timeout, async {
            let _ = rotator.await;
            let _ = reaper.await;
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks did not stop within the shutdown timeout");
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
