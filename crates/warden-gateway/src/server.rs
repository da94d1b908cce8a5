//! Server lifecycle.
//!
//! Binds the configured address, serves the HTTP surface and the
//! stream endpoint, and shuts the subsystems down in order on exit.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ErrorCode, GatewayError, GatewayResult};
use crate::http::router;
use crate::state::Gateway;

/// The running gateway server.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    serve_handle: tokio::task::JoinHandle<()>,
}

impl GatewayServer {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Bind failures.
    pub async fn start(gateway: Arc<Gateway>) -> GatewayResult<Self> {
        let bind = format!(
            "{}:{}",
            gateway.config.server.host, gateway.config.server.port
        );
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| GatewayError::new(ErrorCode::Internal, format!("bind {bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::new(ErrorCode::Internal, e.to_string()))?;

        let app = router(Arc::clone(&gateway))
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let serve_handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "server error");
            }
        });

        info!(%addr, "gateway listening");
        Ok(Self {
            gateway,
            addr,
            shutdown,
            serve_handle,
        })
    }

    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The gateway behind this server.
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Stop serving and shut down the subsystems.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.serve_handle.await;
        self.gateway.shutdown().await;
    }
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}
