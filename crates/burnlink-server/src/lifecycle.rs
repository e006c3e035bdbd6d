//! The vault: creates, reveals and sweeps self-destructing secrets.
//!
//! Callers see three operations (`create_*`, `consume`, `run_sweep`) and a
//! small set of outcomes. Crypto and storage failures are mapped here:
//! a secret that fails to decrypt is reported as [`ConsumeResult::NotFound`]
//! and destroyed, never returned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::ids::{self, fingerprint};
use crate::policy::{unix_now_ms, ExpiryReason};
use crate::store::crypto::{self, CryptoError, EncryptionKey};
use crate::store::{
    Consumed, SealedPayload, SecretKind, SecretRecord, Store, StoredPayload, SweepReport,
};

/// Longest time limit accepted for a secret (365 days).
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 3600;

pub const DEFAULT_MIME: &str = "application/octet-stream";

const MAX_FILENAME_LEN: usize = 200;

/// Fresh ids tried before giving up with [`Error::DuplicateId`].
const ID_ATTEMPTS: usize = 3;

/// Limits attached to a secret at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryRule {
    /// Seconds until the secret expires. `Some(0)` is already expired.
    pub ttl_seconds: Option<u64>,
    /// Successful views before the secret is destroyed.
    pub max_views: Option<u32>,
}

impl ExpiryRule {
    pub fn new(ttl_seconds: Option<u64>, max_views: Option<u32>) -> Self {
        Self {
            ttl_seconds,
            max_views,
        }
    }

    /// Secrets must expire somehow: at least one limit is required.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_seconds.is_none() && self.max_views.is_none() {
            return Err(Error::InvalidExpiryRule(
                "a time limit or a view limit is required".into(),
            ));
        }
        if self.max_views == Some(0) {
            return Err(Error::InvalidExpiryRule(
                "max_views must be at least 1".into(),
            ));
        }
        if let Some(ttl) = self.ttl_seconds {
            if ttl > MAX_TTL_SECONDS {
                return Err(Error::InvalidExpiryRule(format!(
                    "ttl_seconds may not exceed {MAX_TTL_SECONDS}"
                )));
            }
        }
        Ok(())
    }

    /// Convert form-style input (`expiry_value` + `expiry_unit`) to seconds.
    /// A zero value means no time limit; unknown units count as minutes.
    pub fn ttl_from_value_unit(value: u64, unit: Option<&str>) -> Result<Option<u64>> {
        if value == 0 {
            return Ok(None);
        }
        let multiplier = match unit.map(str::trim).unwrap_or("minutes") {
            "seconds" | "second" | "s" => 1,
            "hours" | "hour" | "h" => 3600,
            "days" | "day" | "d" => 86_400,
            _ => 60,
        };
        value
            .checked_mul(multiplier)
            .map(Some)
            .ok_or_else(|| Error::InvalidExpiryRule("time limit is too large".into()))
    }
}

/// Returned to the creator; the id is the only handle to the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Created {
    pub id: String,
    pub kind: SecretKind,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds; the secret is gone from this instant on.
    pub expires_at: Option<i64>,
    pub max_views: Option<u32>,
}

/// Plaintext of a revealed secret. Buffers are zeroized on drop.
pub enum DecryptedPayload {
    Text(Zeroizing<String>),
    File {
        bytes: Zeroizing<Vec<u8>>,
        filename: String,
        mime_type: String,
    },
}

impl DecryptedPayload {
    pub fn kind(&self) -> SecretKind {
        match self {
            Self::Text(_) => SecretKind::Text,
            Self::File { .. } => SecretKind::File,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::File { bytes, .. } => bytes.as_slice(),
        }
    }
}

impl fmt::Debug for DecryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f
                .debug_struct("Text")
                .field("len", &text.len())
                .finish_non_exhaustive(),
            Self::File {
                bytes,
                filename,
                mime_type,
            } => f
                .debug_struct("File")
                .field("len", &bytes.len())
                .field("filename", filename)
                .field("mime_type", mime_type)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub struct Revealed {
    pub payload: DecryptedPayload,
    /// Views left after this one; `None` when views are unlimited.
    pub views_remaining: Option<u32>,
}

/// Result of a consume attempt. `Expired` and `NotFound` look the same to
/// the person holding the link; the distinction is for logs.
#[derive(Debug)]
pub enum ConsumeResult {
    Revealed(Revealed),
    Expired(ExpiryReason),
    NotFound,
}

/// Orchestrates crypto, ids, policy and the store. Cheap to clone.
#[derive(Clone)]
pub struct Vault {
    store: Store,
    key: Arc<EncryptionKey>,
}

impl Vault {
    pub fn new(store: Store, key: EncryptionKey) -> Self {
        Self {
            store,
            key: Arc::new(key),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn create_text_secret(&self, plaintext: &str, rule: ExpiryRule) -> Result<Created> {
        rule.validate()?;
        let ciphertext = self.seal(plaintext.as_bytes())?;
        let now = unix_now_ms();

        let id = self.allocate(ids::generate, |id| {
            let payload = StoredPayload::Text {
                ciphertext: ciphertext.clone(),
            };
            self.store.insert(id, &new_record(payload, &rule, now))
        })?;

        info!(
            id = %fingerprint(&id),
            kind = "text",
            ttl_seconds = ?rule.ttl_seconds,
            max_views = ?rule.max_views,
            "created secret"
        );
        Ok(created(id, SecretKind::Text, &rule, now))
    }

    pub fn create_file_secret(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: Option<&str>,
        rule: ExpiryRule,
    ) -> Result<Created> {
        rule.validate()?;
        let ciphertext = self.seal(bytes)?;
        let mime_type = normalize_mime(mime_type);
        let now = unix_now_ms();

        // Blob first, then the record, so a record never points at nothing.
        let id = self.allocate(ids::generate, |id| {
            let Some(blob) = self.store.put_blob(id, &ciphertext)? else {
                return Ok(false);
            };
            let payload = StoredPayload::File {
                blob: blob.clone(),
                filename: sanitize_filename(filename, id),
                mime_type: mime_type.clone(),
                size: bytes.len() as u64,
            };
            if self.store.insert(id, &new_record(payload, &rule, now))? {
                Ok(true)
            } else {
                self.store.discard_blob(&blob)?;
                Ok(false)
            }
        })?;

        info!(
            id = %fingerprint(&id),
            kind = "file",
            size = bytes.len(),
            ttl_seconds = ?rule.ttl_seconds,
            max_views = ?rule.max_views,
            "created secret"
        );
        Ok(created(id, SecretKind::File, &rule, now))
    }

    pub fn consume(&self, id: &str) -> Result<ConsumeResult> {
        self.consume_at(id, unix_now_ms())
    }

    /// [`Vault::consume`] against an explicit clock.
    pub fn consume_at(&self, id: &str, now: i64) -> Result<ConsumeResult> {
        if !ids::is_well_formed(id) {
            debug!("rejected malformed secret id");
            return Ok(ConsumeResult::NotFound);
        }

        let outcome = match self.store.atomic_consume(id, now)? {
            Consumed::NotFound => {
                debug!(id = %fingerprint(id), "secret not found");
                ConsumeResult::NotFound
            }
            Consumed::Expired(reason) => {
                info!(id = %fingerprint(id), ?reason, "secret expired");
                ConsumeResult::Expired(reason)
            }
            Consumed::Served {
                payload,
                views_remaining,
                burned,
            } => match self.open(payload) {
                Ok(payload) => {
                    info!(
                        id = %fingerprint(id),
                        kind = ?payload.kind(),
                        ?views_remaining,
                        burned,
                        "secret revealed"
                    );
                    ConsumeResult::Revealed(Revealed {
                        payload,
                        views_remaining,
                    })
                }
                Err(e) => {
                    warn!(
                        id = %fingerprint(id),
                        error = %e,
                        "stored secret failed integrity check; destroying it"
                    );
                    if !burned {
                        if let Err(e) = self.store.delete(id) {
                            error!(id = %fingerprint(id), error = %e, "failed to destroy corrupt secret");
                        }
                    }
                    ConsumeResult::NotFound
                }
            },
        };
        Ok(outcome)
    }

    pub fn run_sweep(&self) -> Result<SweepReport> {
        self.run_sweep_at(unix_now_ms())
    }

    /// [`Vault::run_sweep`] against an explicit clock.
    pub fn run_sweep_at(&self, now: i64) -> Result<SweepReport> {
        Ok(self.store.sweep_expired(now)?)
    }

    /// Spawn a background Tokio task that calls `run_sweep()` every `interval`.
    /// Each sweep runs on the blocking pool.
    pub fn spawn_sweep(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let vault = self.clone();
                match tokio::task::spawn_blocking(move || vault.run_sweep()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "background sweep error"),
                    Err(e) => error!(error = %e, "background sweep task failed"),
                }
            }
        })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(crypto::encrypt(&self.key, plaintext).context("encrypt payload")?)
    }

    fn open(&self, payload: SealedPayload) -> Result<DecryptedPayload, CryptoError> {
        match payload {
            SealedPayload::Text(ciphertext) => {
                let plaintext = crypto::decrypt(&self.key, &ciphertext)?;
                let text = String::from_utf8(plaintext).map_err(|e| {
                    e.into_bytes().zeroize();
                    CryptoError::DecryptionFailed
                })?;
                Ok(DecryptedPayload::Text(Zeroizing::new(text)))
            }
            SealedPayload::File {
                ciphertext,
                filename,
                mime_type,
            } => {
                let bytes = crypto::decrypt(&self.key, &ciphertext)?;
                Ok(DecryptedPayload::File {
                    bytes: Zeroizing::new(bytes),
                    filename,
                    mime_type,
                })
            }
        }
    }

    /// Run `attempt` with fresh ids until one is accepted.
    fn allocate(
        &self,
        mut next_id: impl FnMut() -> String,
        mut attempt: impl FnMut(&str) -> anyhow::Result<bool>,
    ) -> Result<String> {
        for _ in 0..ID_ATTEMPTS {
            let id = next_id();
            if attempt(&id)? {
                return Ok(id);
            }
        }
        error!(attempts = ID_ATTEMPTS, "every generated secret id collided");
        Err(Error::DuplicateId)
    }
}

fn new_record(payload: StoredPayload, rule: &ExpiryRule, now: i64) -> SecretRecord {
    SecretRecord {
        payload,
        created_at: now,
        expires_at: expires_at(rule, now),
        max_views: rule.max_views,
        view_count: 0,
    }
}

fn created(id: String, kind: SecretKind, rule: &ExpiryRule, now: i64) -> Created {
    Created {
        id,
        kind,
        created_at: now,
        expires_at: expires_at(rule, now),
        max_views: rule.max_views,
    }
}

fn expires_at(rule: &ExpiryRule, now_ms: i64) -> Option<i64> {
    // Bounded by MAX_TTL_SECONDS after validation.
    rule.ttl_seconds.map(|ttl| now_ms.saturating_add((ttl as i64).saturating_mul(1000)))
}

/// Reduce an uploaded filename to a safe basename of `[A-Za-z0-9._-]`,
/// falling back to `<id>.bin`.
pub fn sanitize_filename(name: &str, id: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();
    let cleaned: String = cleaned
        .trim_start_matches(['.', '_'])
        .chars()
        .take(MAX_FILENAME_LEN)
        .collect();
    if cleaned.is_empty() {
        format!("{id}.bin")
    } else {
        cleaned
    }
}

fn normalize_mime(mime_type: Option<&str>) -> String {
    match mime_type.map(str::trim) {
        Some(m) if is_plausible_mime(m) => m.to_owned(),
        _ => DEFAULT_MIME.to_owned(),
    }
}

fn is_plausible_mime(m: &str) -> bool {
    m.len() <= 127
        && m.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
        && m
            .split_once('/')
            .is_some_and(|(ty, sub)| !ty.is_empty() && !sub.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use tempfile::tempdir;

    fn make_vault() -> (Vault, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (Vault::new(store, crypto::generate_key()), dir)
    }

    fn views(n: u32) -> ExpiryRule {
        ExpiryRule::new(None, Some(n))
    }

    fn revealed_text(result: ConsumeResult) -> String {
        match result {
            ConsumeResult::Revealed(Revealed {
                payload: DecryptedPayload::Text(text),
                ..
            }) => text.to_string(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn single_view_secret_burns_after_reading() {
        let (vault, _dir) = make_vault();
        let created = vault.create_text_secret("hello", views(1)).unwrap();
        assert_eq!(created.kind, SecretKind::Text);
        assert_eq!(created.id.len(), ids::ID_LEN);

        assert_eq!(revealed_text(vault.consume(&created.id).unwrap()), "hello");
        assert!(matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::Expired(ExpiryReason::Views)
        ));
    }

    #[test]
    fn exactly_n_views_succeed() {
        let (vault, _dir) = make_vault();
        let created = vault.create_text_secret("counted", views(4)).unwrap();

        for remaining in (0..4).rev() {
            match vault.consume(&created.id).unwrap() {
                ConsumeResult::Revealed(r) => assert_eq!(r.views_remaining, Some(remaining)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::Expired(ExpiryReason::Views)
        ));
    }

    #[test]
    fn concurrent_consumes_never_exceed_quota() {
        let (vault, _dir) = make_vault();
        let n = 5;
        let created = vault.create_text_secret("race", views(n)).unwrap();

        let revealed = AtomicUsize::new(0);
        let refused = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..n + 5 {
                scope.spawn(|| match vault.consume(&created.id).unwrap() {
                    ConsumeResult::Revealed(r) => {
                        assert_eq!(r.payload.as_bytes(), b"race");
                        revealed.fetch_add(1, Ordering::SeqCst);
                    }
                    ConsumeResult::Expired(_) | ConsumeResult::NotFound => {
                        refused.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(revealed.load(Ordering::SeqCst), n as usize);
        assert_eq!(refused.load(Ordering::SeqCst), 5);
        assert!(vault.store().peek(&created.id).unwrap().is_none());
    }

    #[test]
    fn last_view_race_has_one_winner() {
        for _ in 0..20 {
            let (vault, _dir) = make_vault();
            let created = vault.create_text_secret("one", views(1)).unwrap();
            let wins = AtomicUsize::new(0);
            std::thread::scope(|scope| {
                for _ in 0..2 {
                    scope.spawn(|| {
                        if let ConsumeResult::Revealed(_) = vault.consume(&created.id).unwrap() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });
            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn ttl_boundary() {
        let (vault, _dir) = make_vault();
        let created = vault
            .create_text_secret("timed", ExpiryRule::new(Some(30), None))
            .unwrap();
        assert_eq!(created.expires_at, Some(created.created_at + 30_000));

        assert_eq!(
            revealed_text(vault.consume_at(&created.id, created.created_at + 29_999).unwrap()),
            "timed"
        );
        assert!(matches!(
            vault.consume_at(&created.id, created.created_at + 30_000).unwrap(),
            ConsumeResult::Expired(ExpiryReason::Time)
        ));
    }

    #[test]
    fn one_second_ttl_lasts_a_full_second() {
        let (vault, _dir) = make_vault();
        let created = vault
            .create_text_secret("brief", ExpiryRule::new(Some(1), Some(5)))
            .unwrap();
        assert_eq!(
            revealed_text(vault.consume_at(&created.id, created.created_at + 999).unwrap()),
            "brief"
        );

        // Whatever the sub-second phase at creation, 250ms later it is still live.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(revealed_text(vault.consume(&created.id).unwrap()), "brief");
        assert!(matches!(
            vault.consume_at(&created.id, created.created_at + 1_000).unwrap(),
            ConsumeResult::Expired(ExpiryReason::Time)
        ));
    }

    #[test]
    fn zero_ttl_is_expired_on_arrival() {
        let (vault, _dir) = make_vault();
        let created = vault
            .create_text_secret("never shown", ExpiryRule::new(Some(0), Some(3)))
            .unwrap();
        assert!(matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::Expired(ExpiryReason::Time)
        ));
        assert!(vault.store().peek(&created.id).unwrap().is_none());
    }

    #[test]
    fn time_limit_applies_regardless_of_views() {
        let (vault, _dir) = make_vault();
        let created = vault
            .create_text_secret("both", ExpiryRule::new(Some(10), Some(100)))
            .unwrap();
        assert!(matches!(
            vault.consume_at(&created.id, created.created_at + 10_000).unwrap(),
            ConsumeResult::Expired(ExpiryReason::Time)
        ));
    }

    #[test]
    fn empty_text_round_trips() {
        let (vault, _dir) = make_vault();
        let created = vault.create_text_secret("", views(1)).unwrap();
        assert_eq!(revealed_text(vault.consume(&created.id).unwrap()), "");
    }

    #[test]
    fn tampered_text_is_not_found() {
        let (vault, _dir) = make_vault();
        let created = vault.create_text_secret("integrity", views(3)).unwrap();
        vault
            .store()
            .rewrite(&created.id, |r| {
                if let StoredPayload::Text { ciphertext } = &mut r.payload {
                    ciphertext[crypto::NONCE_LEN] ^= 0x01;
                }
            })
            .unwrap();

        assert!(matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::NotFound
        ));
        // Destroyed, not left for another attempt.
        assert!(vault.store().peek(&created.id).unwrap().is_none());
        assert!(matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::NotFound
        ));
    }

    #[test]
    fn tampered_file_is_not_found() {
        let (vault, _dir) = make_vault();
        let created = vault
            .create_file_secret(b"%PDF-1.7", "doc.pdf", Some("application/pdf"), views(2))
            .unwrap();
        let blob = vault.store().blob_dir().join(format!("{}.bin", created.id));
        let mut bytes = std::fs::read(&blob).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        std::fs::write(&blob, bytes).unwrap();

        assert!(matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::NotFound
        ));
        assert!(!blob.exists());
    }

    #[test]
    fn wrong_key_is_not_found() {
        let (vault, _dir) = make_vault();
        let created = vault.create_text_secret("mine", views(1)).unwrap();
        let other = Vault::new(vault.store().clone(), crypto::generate_key());
        assert!(matches!(
            other.consume(&created.id).unwrap(),
            ConsumeResult::NotFound
        ));
    }

    #[test]
    fn file_secret_round_trip() {
        let (vault, _dir) = make_vault();
        let created = vault
            .create_file_secret(b"\x00\x01binary", "../../etc/my notes.txt", None, views(1))
            .unwrap();
        assert_eq!(created.kind, SecretKind::File);

        // Only ciphertext touches the disk.
        let blob = vault.store().blob_dir().join(format!("{}.bin", created.id));
        let stored = std::fs::read(&blob).unwrap();
        assert!(!stored.windows(6).any(|w| w == b"binary"));

        match vault.consume(&created.id).unwrap() {
            ConsumeResult::Revealed(Revealed {
                payload:
                    DecryptedPayload::File {
                        bytes,
                        filename,
                        mime_type,
                    },
                views_remaining,
            }) => {
                assert_eq!(&bytes[..], b"\x00\x01binary");
                assert_eq!(filename, "my_notes.txt");
                assert_eq!(mime_type, DEFAULT_MIME);
                assert_eq!(views_remaining, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!blob.exists());
    }

    #[test]
    fn invalid_rules_store_nothing() {
        let (vault, _dir) = make_vault();
        for rule in [
            ExpiryRule::default(),
            ExpiryRule::new(None, Some(0)),
            ExpiryRule::new(Some(MAX_TTL_SECONDS + 1), None),
        ] {
            assert!(matches!(
                vault.create_text_secret("x", rule),
                Err(Error::InvalidExpiryRule(_))
            ));
            assert!(matches!(
                vault.create_file_secret(b"x", "x.txt", None, rule),
                Err(Error::InvalidExpiryRule(_))
            ));
        }
        assert_eq!(vault.store().count().unwrap(), 0);
        assert_eq!(
            std::fs::read_dir(vault.store().blob_dir()).unwrap().count(),
            0
        );
    }

    #[test]
    fn malformed_ids_are_not_found() {
        let (vault, _dir) = make_vault();
        for id in ["", "short", "../../../../../etc/passwd"] {
            assert!(matches!(vault.consume(id).unwrap(), ConsumeResult::NotFound));
        }
    }

    #[test]
    fn exhausted_secret_stays_gone() {
        let (vault, _dir) = make_vault();
        let created = vault.create_text_secret("final", views(2)).unwrap();
        vault.consume(&created.id).unwrap();
        vault.consume(&created.id).unwrap();

        for _ in 0..3 {
            assert!(!matches!(
                vault.consume(&created.id).unwrap(),
                ConsumeResult::Revealed(_)
            ));
        }
        vault.run_sweep().unwrap();
        assert!(!matches!(
            vault.consume(&created.id).unwrap(),
            ConsumeResult::Revealed(_)
        ));
    }

    #[test]
    fn sweep_deletes_time_expired_once() {
        let (vault, _dir) = make_vault();
        let dead = vault
            .create_file_secret(b"bytes", "a.bin", None, ExpiryRule::new(Some(5), None))
            .unwrap();
        let live = vault
            .create_text_secret("live", ExpiryRule::new(Some(3600), None))
            .unwrap();
        let later = dead.created_at + 5_000;

        let first = vault.run_sweep_at(later).unwrap();
        assert_eq!(first.deleted, 1);
        assert!(!vault
            .store()
            .blob_dir()
            .join(format!("{}.bin", dead.id))
            .exists());

        assert_eq!(vault.run_sweep_at(later).unwrap(), SweepReport::default());
        assert_eq!(revealed_text(vault.consume_at(&live.id, later).unwrap()), "live");
    }

    #[test]
    fn allocation_gives_up_after_repeated_collisions() {
        let (vault, _dir) = make_vault();
        let mut calls = 0;
        let err = vault
            .allocate(
                || "AAAAAAAAAAAAAAAAAAAAAA".to_owned(),
                |_| {
                    calls += 1;
                    Ok(false)
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId));
        assert_eq!(calls, ID_ATTEMPTS);
    }

    #[test]
    fn colliding_id_keeps_original_secret() {
        let (vault, _dir) = make_vault();
        let first = vault.create_text_secret("original", views(1)).unwrap();
        let mut queue = vec![ids::generate(), first.id.clone()];
        let id = vault
            .allocate(
                || queue.pop().unwrap(),
                |id| {
                    let record = new_record(
                        StoredPayload::Text {
                            ciphertext: vec![],
                        },
                        &views(1),
                        0,
                    );
                    Ok(vault.store().insert(id, &record)?)
                },
            )
            .unwrap();
        assert_ne!(id, first.id);
        assert_eq!(revealed_text(vault.consume(&first.id).unwrap()), "original");
    }

    #[test]
    fn value_unit_conversion() {
        assert_eq!(ExpiryRule::ttl_from_value_unit(0, Some("days")).unwrap(), None);
        assert_eq!(ExpiryRule::ttl_from_value_unit(5, None).unwrap(), Some(300));
        assert_eq!(
            ExpiryRule::ttl_from_value_unit(2, Some("hours")).unwrap(),
            Some(7200)
        );
        assert_eq!(
            ExpiryRule::ttl_from_value_unit(3, Some("days")).unwrap(),
            Some(259_200)
        );
        assert_eq!(
            ExpiryRule::ttl_from_value_unit(7, Some("fortnights")).unwrap(),
            Some(420)
        );
        assert!(ExpiryRule::ttl_from_value_unit(u64::MAX, Some("days")).is_err());
    }

    #[test]
    fn filename_sanitization() {
        let id = "AAAAAAAAAAAAAAAAAAAAAA";
        assert_eq!(sanitize_filename("report.pdf", id), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd", id), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\doc.txt", id), "doc.txt");
        assert_eq!(sanitize_filename("my file (1).txt", id), "my_file_1.txt");
        assert_eq!(sanitize_filename(".hidden", id), "hidden");
        assert_eq!(sanitize_filename("...", id), format!("{id}.bin"));
        assert_eq!(sanitize_filename("", id), format!("{id}.bin"));
        assert_eq!(sanitize_filename(&"a".repeat(500), id).len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn mime_normalization() {
        assert_eq!(normalize_mime(Some("image/png")), "image/png");
        assert_eq!(
            normalize_mime(Some("text/plain; charset=utf-8")),
            "text/plain; charset=utf-8"
        );
        assert_eq!(normalize_mime(Some("")), DEFAULT_MIME);
        assert_eq!(normalize_mime(Some("nonsense")), DEFAULT_MIME);
        assert_eq!(normalize_mime(Some("text/html\r\nX-Evil: 1")), DEFAULT_MIME);
        assert_eq!(normalize_mime(None), DEFAULT_MIME);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_removes_expired_secrets() {
        let (vault, _dir) = make_vault();
        vault
            .create_text_secret("gone", ExpiryRule::new(Some(0), None))
            .unwrap();
        assert_eq!(vault.store().count().unwrap(), 1);

        let handle = vault.clone().spawn_sweep(Duration::from_secs(60));
        time::sleep(Duration::from_secs(61)).await;
        // The sweep itself runs on the blocking pool.
        for _ in 0..100 {
            if vault.store().count().unwrap() == 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(vault.store().count().unwrap(), 0);
        handle.abort();
    }
}
