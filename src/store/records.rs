use bytes::Bytes;
use itertools::Itertools;
use log::{debug, info, warn};
use proctree_shared::artifacts::{ArtifactExt, ProcessTree};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const TEMP_FILE_PREFIX: &str = ".";
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// What to do with entries already present in the storage directory when opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Delete every existing entry: the store only holds the current session.
    #[default]
    Reset,
    /// Keep existing entries and index them in identity order.
    Reuse,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to serialize record: {0:#}")]
    Serialize(#[source] anyhow::Error),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Zero-based arrival position. Authoritative for ordering.
    pub ordinal: usize,
    /// Storage label: `{unix_millis:013}-{ordinal:010}`.
    pub identity: String,
    /// Exact bytes stored on disk and served to readers.
    pub payload: Bytes,
}

/// An entry serialized and named but not yet visible in the index.
#[derive(Debug)]
pub struct PendingEntry {
    entry: LogEntry,
    millis: u64,
    path: PathBuf,
}

impl PendingEntry {
    /// Write the payload to a temporary file next to its final location, flush it to disk
    /// and rename it into place. Readers never observe a partially written entry.
    pub fn write(&self) -> Result<(), PersistenceError> {
        let io_error = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .ok_or_else(|| io_error(io::Error::other("entry path has no parent")))?;
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .suffix(TEMP_FILE_SUFFIX)
            .tempfile_in(dir)
            .map_err(io_error)?;
        file.write_all(&self.entry.payload).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist_noclobber(&self.path)
            .map_err(|e| io_error(e.error))?;
        Ok(())
    }
}

/// Session-scoped, append-only storage of process-tree snapshots.
///
/// Every entry is one pretty-printed JSON file named after its identity. The ordinal index
/// lives in memory and is rebuilt from the directory listing on open.
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    /// Identities in ordinal order.
    index: Vec<String>,
    last_millis: u64,
}

impl RecordStore {
    pub fn open<P: AsRef<Path>>(dir: P, mode: StoreMode) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut index = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                warn!("Ignoring non UTF-8 entry {}", path.display());
                continue;
            };

            let is_temporary =
                name.starts_with(TEMP_FILE_PREFIX) && name.ends_with(TEMP_FILE_SUFFIX);
            if is_temporary || mode == StoreMode::Reset {
                remove_path(&path)?;
                continue;
            }

            let is_file = dir_entry.file_type()?.is_file();
            match name.strip_suffix(&format!(".{}", ProcessTree::EXTENSION)) {
                Some(identity) if is_file => index.push(identity.to_owned()),
                _ => debug!("Ignoring unexpected entry {}", path.display()),
            }
        }

        let index = index.into_iter().sorted().collect_vec();
        let last_millis = index
            .last()
            .and_then(|identity| identity.split_once('-'))
            .and_then(|(millis, _)| millis.parse().ok())
            .unwrap_or(0);

        info!(
            "Opened record store at {} with {} entries ({mode:?})",
            dir.display(),
            index.len()
        );

        Ok(Self {
            dir,
            index,
            last_millis,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn count(&self) -> usize {
        self.index.len()
    }

    /// Identities in ordinal order.
    pub fn entries(&self) -> &[String] {
        &self.index
    }

    /// Location of the entry at `ordinal`, if one was assigned.
    pub fn get(&self, ordinal: usize) -> Option<PathBuf> {
        self.index
            .get(ordinal)
            .map(|identity| self.dir.join(ProcessTree::file_name(identity)))
    }

    /// Stored payload of the entry at `ordinal`, byte for byte.
    pub fn read(&self, ordinal: usize) -> io::Result<Option<Vec<u8>>> {
        self.get(ordinal).map(fs::read).transpose()
    }

    /// Serialize `record` and name it with the next ordinal. Nothing is written or assigned.
    pub fn prepare(&self, record: &ProcessTree) -> Result<PendingEntry, PersistenceError> {
        let payload = record
            .encode_pretty()
            .map_err(PersistenceError::Serialize)?;

        let ordinal = self.index.len();
        let millis = now_millis().max(self.last_millis);
        let identity = format_identity(millis, ordinal);
        let path = self.dir.join(ProcessTree::file_name(&identity));

        Ok(PendingEntry {
            entry: LogEntry {
                ordinal,
                identity,
                payload: Bytes::from(payload),
            },
            millis,
            path,
        })
    }

    /// Make a written entry visible. Must directly follow the `prepare` that produced it.
    pub fn commit(&mut self, pending: PendingEntry) -> LogEntry {
        debug_assert_eq!(pending.entry.ordinal, self.index.len());
        self.last_millis = pending.millis;
        self.index.push(pending.entry.identity.clone());
        pending.entry
    }

    /// Persist `record` synchronously and assign it the next ordinal.
    ///
    /// On failure the ordinal is not consumed and nothing becomes visible.
    pub fn append(&mut self, record: &ProcessTree) -> Result<LogEntry, PersistenceError> {
        let pending = self.prepare(record)?;
        pending.write()?;
        Ok(self.commit(pending))
    }

    /// Remove the storage directory and everything in it.
    pub fn teardown(self) -> io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!("Removed record store at {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn format_identity(millis: u64, ordinal: usize) -> String {
    format!("{millis:013}-{ordinal:010}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
