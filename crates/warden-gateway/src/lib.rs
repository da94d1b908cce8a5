//! Warden Gateway - the dispatcher.
//!
//! Terminates the persistent full-duplex message stream (WebSocket),
//! normalizes the three accepted inbound formats into the native
//! envelope, authenticates clients, and routes every operation
//! through the policy engine, capability manager, and rate limiter.
//! Also serves the HTTP surface (`/health`, `/evaluate`, `/stats`,
//! `/audit`, `/metrics`) and forwards operations on non-local agents
//! to their owning cluster node.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod cluster;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod normalize;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod session;
pub mod state;

pub use cluster::NodeDirectory;
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use metrics::MetricsRegistry;
pub use normalize::normalize_frame;
pub use protocol::{Frame, ServerMessage};
pub use provider::{ChatRequest, ChatResponse, EchoProvider, LlmProvider, ProviderFailure};
pub use server::GatewayServer;
pub use state::{Gateway, GatewayConfigSummary};
