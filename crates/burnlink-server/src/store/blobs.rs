use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::debug;

const BLOB_EXT: &str = "bin";
const TMP_EXT: &str = "tmp";

/// Directory of encrypted file payloads, one `<id>.bin` per file secret.
#[derive(Debug, Clone)]
pub struct BlobDir {
    dir: PathBuf,
}

/// A blob-area file old enough to be considered for orphan reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleBlob {
    /// Secret id the file was written for.
    pub id: String,
    pub file_name: String,
}

impl BlobDir {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create blob dir: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `ciphertext` for `id` and return the blob name to record, or
    /// `None` if `id` already has a blob (never overwritten).
    /// Goes through a temp file and rename so readers never see a partial blob.
    pub fn write(&self, id: &str, ciphertext: &[u8]) -> Result<Option<String>> {
        let name = format!("{id}.{BLOB_EXT}");
        let path = self.resolve(&name)?;
        let tmp = self.dir.join(format!("{id}.{TMP_EXT}"));

        let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(&tmp) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e).context("create blob temp file"),
        };
        if path.exists() {
            drop(f);
            fs::remove_file(&tmp).context("remove blob temp file")?;
            return Ok(None);
        }
        let written = f.write_all(ciphertext).and_then(|()| f.sync_all());
        drop(f);
        if let Err(e) = written.and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e).context("write blob");
        }
        debug!(blob = %name, bytes = ciphertext.len(), "wrote blob");
        Ok(Some(name))
    }

    /// Read a blob. `None` if it does not exist.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read blob {name}")),
        }
    }

    /// Remove a blob. Returns true if it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(blob = %name, "removed blob");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove blob {name}")),
        }
    }

    /// Blob and temp files last modified more than `grace` ago.
    pub fn stale(&self, grace: Duration) -> Result<Vec<StaleBlob>> {
        let cutoff = SystemTime::now()
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).context("list blob dir")? {
            let entry = entry.context("read blob dir entry")?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext != Some(BLOB_EXT) && ext != Some(TMP_EXT) {
                continue;
            }
            let (Some(stem), Some(file_name)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                // Removed between listing and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context("stat blob"),
            };
            if modified <= cutoff {
                out.push(StaleBlob {
                    id: stem.to_owned(),
                    file_name: file_name.to_owned(),
                });
            }
        }
        Ok(out)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            anyhow::bail!("invalid blob name: {name:?}");
        }
        Ok(self.dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_remove() {
        let dir = tempdir().unwrap();
        let blobs = BlobDir::open(dir.path()).unwrap();

        let name = blobs.write("abc", b"sealed").unwrap().unwrap();
        assert_eq!(name, "abc.bin");
        assert_eq!(blobs.read(&name).unwrap().as_deref(), Some(&b"sealed"[..]));
        assert!(!dir.path().join("abc.tmp").exists());

        assert!(blobs.remove(&name).unwrap());
        assert!(!blobs.remove(&name).unwrap());
        assert_eq!(blobs.read(&name).unwrap(), None);
    }

    #[test]
    fn never_overwrites_existing_blob() {
        let dir = tempdir().unwrap();
        let blobs = BlobDir::open(dir.path()).unwrap();
        blobs.write("dup", b"first").unwrap().unwrap();
        assert_eq!(blobs.write("dup", b"second").unwrap(), None);
        assert_eq!(
            blobs.read("dup.bin").unwrap().as_deref(),
            Some(&b"first"[..])
        );
        assert!(!dir.path().join("dup.tmp").exists());
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let blobs = BlobDir::open(dir.path()).unwrap();
        assert!(blobs.read("../outside.bin").is_err());
        assert!(blobs.remove("..").is_err());
        assert!(blobs.read("").is_err());
    }

    #[test]
    fn stale_respects_grace_and_extension() {
        let dir = tempdir().unwrap();
        let blobs = BlobDir::open(dir.path()).unwrap();
        blobs.write("one", b"x").unwrap();
        fs::write(dir.path().join("two.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert!(blobs.stale(Duration::from_secs(3600)).unwrap().is_empty());

        let mut stale = blobs.stale(Duration::ZERO).unwrap();
        stale.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(
            stale,
            vec![
                StaleBlob {
                    id: "one".into(),
                    file_name: "one.bin".into()
                },
                StaleBlob {
                    id: "two".into(),
                    file_name: "two.tmp".into()
                },
            ]
        );
    }
}
