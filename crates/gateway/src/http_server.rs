//! HTTP Server
//!
//! Routes the gateway surface onto the handlers in [`crate::methods`].

use crate::methods::{
    handle_health, handle_peers, handle_register, handle_sign, handle_status, handle_validate,
    handle_validation_status, GatewayContext,
};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::watch};
use tower_http::cors::{Any, CorsLayer};

/// Gateway HTTP server
pub struct GatewayServer {
    context: Arc<GatewayContext>,
}

impl GatewayServer {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }

    /// Create the Axum router
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/validate", post(handle_validate))
            .route("/sign", post(handle_sign))
            .route("/peers", get(handle_peers))
            .route("/register", post(handle_register))
            .route("/validations/:id", get(handle_validation_status))
            .layer(cors)
            .with_state(self.context.clone())
    }

    /// Serve on an already bound listener until the shutdown signal flips
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!("Gateway listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}
