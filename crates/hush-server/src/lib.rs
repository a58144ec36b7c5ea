pub mod auth;
pub mod error;
pub mod handlers;
pub mod policy;
pub mod server;
pub mod sharing;
pub mod store;

/// The engine wiring used by the HTTP server.
pub type Engine = sharing::SharingEngine<store::Store, policy::MembershipGate>;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Bearer key the upstream proxy must present before actor headers are trusted.
    pub upstream_key: Option<String>,
}

pub use error::{PolicyError, SharingError, StoreError};
pub use server::{read_key_file, resolve_data_dir, resolve_upstream_key, router, run, ServerConfig};
