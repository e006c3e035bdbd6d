use serde::{Deserialize, Serialize};

use crate::policy::ExpiryReason;

/// Stored in redb as bincode-encoded bytes.
/// Metadata is plaintext so the policy and the sweep never need the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub payload: StoredPayload,
    /// Unix timestamp (milliseconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) from which the record is expired.
    pub expires_at: Option<i64>,
    /// Views allowed before the record is destroyed.
    pub max_views: Option<u32>,
    /// Successful consumes so far.
    pub view_count: u32,
}

/// Where the ciphertext lives. Exactly one representation per secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredPayload {
    /// Sealed text kept inline in the record.
    Text { ciphertext: Vec<u8> },
    /// Sealed bytes kept in the blob area under `blob`.
    File {
        blob: String,
        filename: String,
        mime_type: String,
        size: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    Text,
    File,
}

impl SecretRecord {
    pub fn kind(&self) -> SecretKind {
        match self.payload {
            StoredPayload::Text { .. } => SecretKind::Text,
            StoredPayload::File { .. } => SecretKind::File,
        }
    }

    /// Blob file backing this record, if any.
    pub fn blob(&self) -> Option<&str> {
        match &self.payload {
            StoredPayload::Text { .. } => None,
            StoredPayload::File { blob, .. } => Some(blob),
        }
    }

    pub fn views_remaining(&self) -> Option<u32> {
        self.max_views.map(|max| max.saturating_sub(self.view_count))
    }
}

/// Ciphertext handed back by a successful consume, ready to decrypt.
#[derive(Debug, Clone, PartialEq)]
pub enum SealedPayload {
    Text(Vec<u8>),
    File {
        ciphertext: Vec<u8>,
        filename: String,
        mime_type: String,
    },
}

/// Left behind when a secret expires so later visits still report
/// `Expired`. Holds no ciphertext and no payload metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Unix timestamp (milliseconds) of deletion.
    pub deleted_at: i64,
    pub reason: ExpiryReason,
}
