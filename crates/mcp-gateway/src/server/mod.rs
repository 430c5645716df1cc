//! Upstream-facing server: session registry, JSON-RPC dispatch, and the
//! stdio/HTTP serving shims.

pub mod handler;
pub mod http;
pub mod session;
pub mod stdio;

pub use handler::GatewayHandler;
pub use session::{SessionManager, UpstreamSession};
