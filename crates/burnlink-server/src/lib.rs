pub mod dirs;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod lifecycle;
pub mod policy;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub vault: lifecycle::Vault,
    /// Base for links handed back to creators, without a trailing slash.
    pub public_url: String,
}

pub use error::{Error, Result};
pub use lifecycle::{
    ConsumeResult, Created, DecryptedPayload, ExpiryRule, Revealed, Vault, MAX_TTL_SECONDS,
};
pub use policy::ExpiryReason;
pub use server::{read_key_file, resolve_data_dir, resolve_encryption_key, run, ServerConfig};
pub use store::{SecretKind, Store, SweepReport};
