use thiserror::Error;

/// Errors the engine reports to its callers.
///
/// Missing and expired secrets are not errors; they are outcomes of
/// [`crate::Vault::consume`]. Decryption failures never appear here.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied limits the vault refuses to store.
    #[error("invalid expiry rule: {0}")]
    InvalidExpiryRule(String),

    /// Every generated id was already taken.
    #[error("could not allocate a unique secret id")]
    DuplicateId,

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
