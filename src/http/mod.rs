//! HTTP surface: admission orchestrator, admin endpoints, and identity
//! derivation.

mod handlers;
mod identity;
mod image;
mod server;

pub use handlers::AppState;
pub use identity::client_identity;
pub use server::HttpServer;
