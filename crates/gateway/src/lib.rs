//! Gateway - HTTP surface of a validator node
//!
//! - `GET /health`, `GET /status`: registration, stake, peers, pending validations
//! - `POST /validate`: submit a payment for attestation
//! - `POST /sign`: add this node's share and read the collected signatures
//! - `GET /peers`, `GET /validations/:id`
//! - `POST /register?stake=<amount>`: record stake registration intent

pub mod error;
pub mod http_server;
pub mod methods;

pub use error::{GatewayError, GatewayResult};
pub use http_server::GatewayServer;
pub use methods::GatewayContext;

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// HTTP bind address
    pub http_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
        }
    }
}
