pub mod blobs;
pub mod crypto;
pub mod db;
pub mod model;

pub use db::{Consumed, Store, SweepReport};
pub use model::{SealedPayload, SecretKind, SecretRecord, StoredPayload, Tombstone};
