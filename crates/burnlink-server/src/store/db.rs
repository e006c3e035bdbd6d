use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::blobs::BlobDir;
use super::model::{SealedPayload, SecretRecord, StoredPayload, Tombstone};
use crate::ids::fingerprint;
use crate::policy::{self, ExpiryReason, Verdict};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
const TOMBSTONES: TableDefinition<&str, &[u8]> = TableDefinition::new("tombstones");

/// Leading byte of every stored record; bump when the layout changes.
const RECORD_FORMAT: u8 = 0x01;

/// Blob files younger than this are never treated as orphans, so a create
/// that has written its blob but not yet its row is left alone.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(60);

/// Optimistic consume attempts before giving up on a row that keeps changing.
const CONSUME_ATTEMPTS: usize = 64;

/// How long tombstones of expired secrets are kept by default.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Outcome of an atomic consume.
#[derive(Debug, PartialEq)]
pub enum Consumed {
    /// View counted; `burned` means it was the last one and the record is gone.
    Served {
        payload: SealedPayload,
        views_remaining: Option<u32>,
        burned: bool,
    },
    /// Record is past its limits (deleted now or earlier).
    Expired(ExpiryReason),
    /// No record under this id.
    NotFound,
}

/// What a consume will commit if the row is still unchanged.
enum Plan {
    /// Remove the row without a tombstone.
    Discard(&'static str),
    Expire {
        reason: ExpiryReason,
        blob: Option<String>,
    },
    Serve {
        record: SecretRecord,
        payload: SealedPayload,
        final_view: bool,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired records deleted together with their blobs.
    pub deleted: usize,
    /// Blob files removed because no record referenced them.
    pub orphaned_blobs: usize,
    /// Tombstones dropped after the retention period.
    pub tombstones_purged: usize,
}

/// Thread-safe handle to the redb database and blob directory.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    blobs: BlobDir,
    /// Milliseconds a tombstone outlives its secret.
    tombstone_retention: i64,
}

impl Store {
    /// Open (or create) `burnlink.db` and `blobs/` under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = Database::create(data_dir.join("burnlink.db")).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(TOMBSTONES)?;
        write_txn.commit()?;

        let blobs = BlobDir::open(&data_dir.join("blobs"))?;

        Ok(Self {
            db: Arc::new(db),
            blobs,
            tombstone_retention: millis(DEFAULT_TOMBSTONE_RETENTION),
        })
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = millis(retention);
        self
    }

    pub fn blob_dir(&self) -> &Path {
        self.blobs.path()
    }

    /// Store encrypted file bytes for `id`. Returns `None` if `id` already
    /// owns a blob. Must happen before [`Store::insert`] of the record.
    pub fn put_blob(&self, id: &str, ciphertext: &[u8]) -> Result<Option<String>> {
        self.blobs.write(id, ciphertext)
    }

    /// Remove a blob written for a record that never got inserted.
    pub fn discard_blob(&self, name: &str) -> Result<()> {
        self.blobs.remove(name).map(|_| ())
    }

    /// Insert a new record. Returns false, leaving existing state untouched,
    /// if `id` is taken by a record or a tombstone.
    pub fn insert(&self, id: &str, record: &SecretRecord) -> Result<bool> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(SECRETS)?;
            let tombstones = write_txn.open_table(TOMBSTONES)?;
            if table.get(id)?.is_some() || tombstones.get(id)?.is_some() {
                false
            } else {
                table.insert(id, bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;

        if inserted {
            debug!(id = %fingerprint(id), kind = ?record.kind(), "stored secret");
        } else {
            warn!(id = %fingerprint(id), "rejected insert for existing id");
        }
        Ok(inserted)
    }

    /// Evaluate a record and count one view, deleting and tombstoning it when
    /// it is expired or this was its final view.
    ///
    /// The record and any blob are read outside the write transaction, which
    /// then only commits if the row is byte-for-byte unchanged. A row changed
    /// by a concurrent writer is re-read and re-evaluated. Blobs of deleted
    /// records are removed after commit.
    pub fn atomic_consume(&self, id: &str, now: i64) -> Result<Consumed> {
        for _ in 0..CONSUME_ATTEMPTS {
            if let Some(result) = self.try_consume(id, now)? {
                return Ok(result);
            }
        }
        anyhow::bail!("secret {} kept changing during consume", fingerprint(id))
    }

    /// One optimistic consume. `None` means the row changed underneath it.
    fn try_consume(&self, id: &str, now: i64) -> Result<Option<Consumed>> {
        let snapshot = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
            match raw_bytes {
                Some(bytes) => bytes,
                None => {
                    let tombstones = read_txn.open_table(TOMBSTONES)?;
                    let reason = match tombstones.get(id)? {
                        Some(guard) => tombstone_reason(id, guard.value()),
                        None => None,
                    };
                    return Ok(Some(reason.map_or(Consumed::NotFound, Consumed::Expired)));
                }
            }
        };

        let plan = match decode(&snapshot) {
            Ok(record) => match policy::evaluate(&record, now) {
                Verdict::Expire(reason) => Plan::Expire {
                    reason,
                    blob: record.blob().map(str::to_owned),
                },
                // Blobs are removed only once their row is gone, so a
                // successful read here stays valid while the row is unchanged.
                Verdict::Serve { final_view } => match self.sealed_payload(&record)? {
                    Some(payload) => Plan::Serve {
                        record,
                        payload,
                        final_view,
                    },
                    None => Plan::Discard("blob missing for stored secret"),
                },
            },
            Err(e) => {
                warn!(id = %fingerprint(id), error = %e, "undecodable secret record");
                Plan::Discard("undecodable secret record")
            }
        };

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut tombstones = write_txn.open_table(TOMBSTONES)?;

            let unchanged = table
                .get(id)?
                .is_some_and(|guard| guard.value() == snapshot.as_slice());
            if !unchanged {
                None
            } else {
                Some(match plan {
                    Plan::Discard(what) => {
                        table.remove(id)?;
                        warn!(id = %fingerprint(id), "{what}; removed record");
                        (Consumed::NotFound, None)
                    }
                    Plan::Expire { reason, blob } => {
                        table.remove(id)?;
                        bury(&mut tombstones, id, now, reason)?;
                        debug!(id = %fingerprint(id), ?reason, "lazy-evicted expired secret");
                        (Consumed::Expired(reason), blob)
                    }
                    Plan::Serve {
                        mut record,
                        payload,
                        final_view,
                    } => {
                        record.view_count += 1;
                        if final_view {
                            table.remove(id)?;
                            bury(&mut tombstones, id, now, ExpiryReason::Views)?;
                            debug!(id = %fingerprint(id), "burned after final view");
                            let served = Consumed::Served {
                                payload,
                                views_remaining: Some(0),
                                burned: true,
                            };
                            (served, record.blob().map(str::to_owned))
                        } else {
                            let updated = encode(&record)?;
                            table.insert(id, updated.as_slice())?;
                            let served = Consumed::Served {
                                payload,
                                views_remaining: record.views_remaining(),
                                burned: false,
                            };
                            (served, None)
                        }
                    }
                })
            }
        };

        let Some((result, doomed_blob)) = outcome else {
            write_txn.abort()?;
            debug!(id = %fingerprint(id), "secret changed during consume; retrying");
            return Ok(None);
        };
        write_txn.commit()?;

        if let Some(name) = doomed_blob {
            self.remove_blob_after_delete(&name);
        }
        Ok(Some(result))
    }

    /// Unconditionally delete a record and its blob. Returns true if it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed: Option<SecretRecord> = {
            let mut table = write_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.remove(id)?.map(|guard| guard.value().to_vec());
            raw_bytes.as_deref().map(decode).transpose()?
        };
        write_txn.commit()?;

        match removed {
            Some(record) => {
                if let Some(name) = record.blob() {
                    self.blobs.remove(name)?;
                }
                debug!(id = %fingerprint(id), "deleted secret");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete every record that is no longer live at `now` together with its
    /// blob, drop tombstones past retention, then remove blob files that no
    /// record references.
    pub fn sweep_expired(&self, now: i64) -> Result<SweepReport> {
        // Collect candidates in a read pass first.
        let (candidates, stale_tombstones) = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                // Undecodable rows are candidates too; the write pass drops them.
                let live = decode(v.value()).is_ok_and(|record| policy::is_live(&record, now));
                if !live {
                    ids.push(k.value().to_owned());
                }
            }

            let tombstones = read_txn.open_table(TOMBSTONES)?;
            let cutoff = now.saturating_sub(self.tombstone_retention);
            let mut stale = Vec::new();
            for item in tombstones.iter()? {
                let (k, v) = item?;
                let stale_at = decode_tombstone(v.value()).map_or(i64::MIN, |t| t.deleted_at);
                if stale_at <= cutoff {
                    stale.push(k.value().to_owned());
                }
            }
            (ids, stale)
        };

        let mut report = SweepReport::default();
        let mut doomed_blobs = Vec::new();

        if !candidates.is_empty() || !stale_tombstones.is_empty() {
            // Re-check under the write transaction: a concurrent consume may
            // already have removed or changed the row.
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(SECRETS)?;
                let mut tombstones = write_txn.open_table(TOMBSTONES)?;

                for id in &stale_tombstones {
                    if tombstones.remove(id.as_str())?.is_some() {
                        report.tombstones_purged += 1;
                    }
                }

                for id in &candidates {
                    let raw_bytes: Option<Vec<u8>> =
                        table.get(id.as_str())?.map(|guard| guard.value().to_vec());
                    let Some(bytes) = raw_bytes else { continue };
                    let record = match decode(&bytes) {
                        Ok(record) => record,
                        Err(e) => {
                            table.remove(id.as_str())?;
                            report.deleted += 1;
                            warn!(
                                id = %fingerprint(id),
                                error = %e,
                                "removed undecodable secret record"
                            );
                            continue;
                        }
                    };
                    let Verdict::Expire(reason) = policy::evaluate(&record, now) else {
                        continue;
                    };
                    table.remove(id.as_str())?;
                    bury(&mut tombstones, id, now, reason)?;
                    report.deleted += 1;
                    if let Some(name) = record.blob() {
                        doomed_blobs.push(name.to_owned());
                    }
                }
            }
            write_txn.commit()?;
        }

        for name in &doomed_blobs {
            self.remove_blob_after_delete(name);
        }

        report.orphaned_blobs = self.reconcile_orphans(ORPHAN_GRACE)?;

        if report != SweepReport::default() {
            info!(
                deleted = report.deleted,
                orphaned_blobs = report.orphaned_blobs,
                tombstones_purged = report.tombstones_purged,
                "swept expired secrets"
            );
        }
        Ok(report)
    }

    /// Remove blob files older than `grace` that no record points at.
    pub fn reconcile_orphans(&self, grace: Duration) -> Result<usize> {
        let stale = self.blobs.stale(grace)?;
        if stale.is_empty() {
            return Ok(0);
        }

        let orphans: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut out = Vec::new();
            for entry in stale {
                let referenced = match table.get(entry.id.as_str())? {
                    Some(guard) => match decode(guard.value()) {
                        Ok(record) => record.blob() == Some(entry.file_name.as_str()),
                        // Kept until the sweep drops the row.
                        Err(_) => true,
                    },
                    None => false,
                };
                if !referenced {
                    out.push(entry.file_name);
                }
            }
            out
        };

        let mut removed = 0;
        for name in &orphans {
            if self.blobs.remove(name)? {
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(removed, "removed orphaned blobs");
        }
        Ok(removed)
    }

    /// Read a record without counting a view.
    pub fn peek(&self, id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.as_deref().map(decode).transpose()
    }

    /// Number of stored records, live or not yet swept.
    pub fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let mut count = 0;
        for item in table.iter()? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn sealed_payload(&self, record: &SecretRecord) -> Result<Option<SealedPayload>> {
        match &record.payload {
            StoredPayload::Text { ciphertext } => Ok(Some(SealedPayload::Text(ciphertext.clone()))),
            StoredPayload::File {
                blob,
                filename,
                mime_type,
                ..
            } => Ok(self
                .blobs
                .read(blob)?
                .map(|ciphertext| SealedPayload::File {
                    ciphertext,
                    filename: filename.clone(),
                    mime_type: mime_type.clone(),
                })),
        }
    }

    /// The record is already gone; a failure here leaves an orphan for the sweep.
    fn remove_blob_after_delete(&self, name: &str) {
        if let Err(e) = self.blobs.remove(name) {
            warn!(blob = %name, error = %e, "failed to remove blob; sweep will reconcile");
        }
    }

    /// Store raw bytes under `id`, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            table.insert(id, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Store raw tombstone bytes under `id`.
    #[cfg(test)]
    pub(crate) fn put_raw_tombstone(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TOMBSTONES)?;
            table.insert(id, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Rewrite a stored record in place.
    #[cfg(test)]
    pub(crate) fn rewrite(&self, id: &str, f: impl FnOnce(&mut SecretRecord)) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
            let mut record = decode(&raw_bytes.context("no such record")?)?;
            f(&mut record);
            table.insert(id, encode(&record)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn bury(
    tombstones: &mut Table<'_, &'static str, &'static [u8]>,
    id: &str,
    now: i64,
    reason: ExpiryReason,
) -> Result<()> {
    let tombstone = Tombstone {
        deleted_at: now,
        reason,
    };
    let bytes = bincode::serde::encode_to_vec(tombstone, bincode::config::standard())
        .context("bincode encode tombstone")?;
    tombstones.insert(id, bytes.as_slice())?;
    Ok(())
}

/// Encode a record as `[RECORD_FORMAT] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT, rest)) => {
            let (record, _) = bincode::serde::decode_from_slice(rest, bincode::config::standard())
                .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}

/// Reason recorded in a tombstone; an unreadable one reads as no tombstone.
fn tombstone_reason(id: &str, bytes: &[u8]) -> Option<ExpiryReason> {
    match decode_tombstone(bytes) {
        Ok(tombstone) => Some(tombstone.reason),
        Err(e) => {
            warn!(id = %fingerprint(id), error = %e, "undecodable tombstone");
            None
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn decode_tombstone(bytes: &[u8]) -> Result<Tombstone> {
    let (tombstone, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode tombstone")?;
    Ok(tombstone)
}
