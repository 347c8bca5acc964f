//! Durable checkpoints of the last delivered commit LSN
//!
//! A checkpoint records, per slot, the commit LSN of the last transaction the
//! consumer finished handling. [`CheckpointStore::save`] only returns once the
//! store's [`persist`](CheckpointStore::persist) has, and hands back a
//! [`DurableLsn`]: the one value
//! [`SlotManager::acknowledge`](crate::SlotManager::acknowledge) accepts. The
//! server can therefore never be told a position that a crash could still lose.
//!
//! Stores only implement `load` and `persist`, so a checkpoint can live in a
//! file, a table or a key-value entry. [`FileCheckpointStore`] writes one JSON
//! file per slot using write-to-temp, fsync, rename, fsync-directory.

use crate::error::{ReplicationError, Result};
use crate::types::Lsn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Persisted resume position for one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub slot_name: String,
    /// Commit LSN of the last fully handled transaction, as an unsigned integer
    pub confirmed_lsn: Lsn,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(slot_name: impl Into<String>, confirmed_lsn: Lsn) -> Self {
        Self {
            slot_name: slot_name.into(),
            confirmed_lsn,
            updated_at: Utc::now(),
        }
    }
}

/// Proof that an LSN has been durably checkpointed for a slot
///
/// Only [`CheckpointStore::save`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableLsn {
    slot_name: String,
    lsn: Lsn,
}

impl DurableLsn {
    pub(crate) fn new(slot_name: impl Into<String>, lsn: Lsn) -> Self {
        Self {
            slot_name: slot_name.into(),
            lsn,
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }
}

/// Durable storage for per-slot checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last saved checkpoint, `None` if the slot has never been checkpointed
    async fn load(&self, slot_name: &str) -> Result<Option<Checkpoint>>;

    /// Write `checkpoint` so that it survives a crash, returning only once it has
    ///
    /// A later [`load`](Self::load) must return it (or a newer one).
    async fn persist(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Durably record `lsn` for the slot
    ///
    /// Saving a position below the stored one is refused. Saving the same
    /// position again succeeds.
    async fn save(&self, slot_name: &str, lsn: Lsn) -> Result<DurableLsn> {
        let stored = self.load(slot_name).await?;
        check_regression(slot_name, stored.as_ref(), lsn)?;
        self.persist(&Checkpoint::new(slot_name, lsn)).await?;
        Ok(DurableLsn::new(slot_name, lsn))
    }
}

fn check_regression(slot_name: &str, stored: Option<&Checkpoint>, lsn: Lsn) -> Result<()> {
    match stored {
        Some(existing) if lsn < existing.confirmed_lsn => Err(ReplicationError::checkpoint(
            format!(
                "refusing to move checkpoint for slot \"{slot_name}\" backwards from {} to {lsn}",
                existing.confirmed_lsn
            ),
        )),
        _ => Ok(()),
    }
}

/// File-backed checkpoint store: `<dir>/<slot>.checkpoint.json`
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    /// Serializes writers and caches what is on disk
    cache: Mutex<HashMap<String, Checkpoint>>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            ReplicationError::checkpoint(format!(
                "cannot create checkpoint directory {}: {e}",
                dir.display()
            ))
        })?;
        info!("Using checkpoint directory {}", dir.display());
        Ok(Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for a slot
    pub fn path_for(&self, slot_name: &str) -> Result<PathBuf> {
        if slot_name.is_empty()
            || slot_name.contains(['/', '\\'])
            || slot_name == "."
            || slot_name == ".."
        {
            return Err(ReplicationError::checkpoint(format!(
                "slot name \"{slot_name}\" cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{slot_name}{CHECKPOINT_SUFFIX}")))
    }

    async fn read_from_disk(&self, slot_name: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(slot_name)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ReplicationError::checkpoint(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            ReplicationError::checkpoint(format!("corrupt checkpoint {}: {e}", path.display()))
        })?;
        if checkpoint.slot_name != slot_name {
            return Err(ReplicationError::checkpoint(format!(
                "checkpoint {} belongs to slot \"{}\"",
                path.display(),
                checkpoint.slot_name
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn write_atomically(&self, path: &Path, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| ReplicationError::checkpoint(format!("cannot encode checkpoint: {e}")))?;
        let temp_path = path.with_extension("json.tmp");

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, path).await?;
            sync_dir(self.dir.clone()).await
        };
        write.await.map_err(|e: std::io::Error| {
            ReplicationError::checkpoint(format!("cannot write {}: {e}", path.display()))
        })
    }
}

/// Fsync a directory so a rename inside it survives a crash
async fn sync_dir(dir: PathBuf) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        tokio::task::spawn_blocking(move || std::fs::File::open(&dir)?.sync_all())
            .await
            .map_err(std::io::Error::other)??;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, slot_name: &str) -> Result<Option<Checkpoint>> {
        let mut cache = self.cache.lock().await;
        if let Some(checkpoint) = cache.get(slot_name) {
            return Ok(Some(checkpoint.clone()));
        }
        let loaded = self.read_from_disk(slot_name).await?;
        if let Some(checkpoint) = &loaded {
            debug!(
                "Loaded checkpoint for slot {} at {}",
                slot_name, checkpoint.confirmed_lsn
            );
            cache.insert(slot_name.to_string(), checkpoint.clone());
        }
        Ok(loaded)
    }

    async fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        let slot_name = checkpoint.slot_name.as_str();
        let path = self.path_for(slot_name)?;
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(slot_name) {
            if let Some(on_disk) = self.read_from_disk(slot_name).await? {
                cache.insert(slot_name.to_string(), on_disk);
            }
        }
        check_regression(slot_name, cache.get(slot_name), checkpoint.confirmed_lsn)?;

        self.write_atomically(&path, checkpoint).await?;
        debug!("Checkpointed slot {} at {}", slot_name, checkpoint.confirmed_lsn);
        cache.insert(slot_name.to_string(), checkpoint.clone());
        Ok(())
    }
}

/// In-memory checkpoint store for tests and ephemeral pipelines
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint, as if a previous run had saved it
    pub async fn seed(&self, slot_name: &str, lsn: Lsn) {
        self.checkpoints
            .write()
            .await
            .insert(slot_name.to_string(), Checkpoint::new(slot_name, lsn));
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, slot_name: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(slot_name).cloned())
    }

    async fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        check_regression(
            &checkpoint.slot_name,
            checkpoints.get(&checkpoint.slot_name),
            checkpoint.confirmed_lsn,
        )?;
        checkpoints.insert(checkpoint.slot_name.clone(), checkpoint.clone());
        Ok(())
    }
}
