// src/storage/checkpoint.rs

//! Incremental batch persistence with crash-safe checkpoints.
//!
//! A worker emits numbered batches. Each batch file is written and
//! renamed into place before the checkpoint advances, so after a crash
//! the checkpoint never points at a batch that does not exist. Batch
//! files newer than the checkpoint are orphans from an interrupted
//! write and are ignored on resume.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{DiscoveredUser, Post};

/// Durable progress marker for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest batch number whose file is safely on disk.
    pub last_batch: u64,
    /// Pagination cursor valid after that batch (None once exhausted).
    pub cursor: Option<String>,
    /// Total items persisted across all batches so far.
    pub items_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMeta {
    pub worker_id: usize,
    pub batch_number: u64,
    /// Cursor to resume from after this batch.
    pub cursor: Option<String>,
    pub collected_at: DateTime<Utc>,
}

/// One persisted unit of collection progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub meta: BatchMeta,
    pub posts: Vec<Post>,
    pub participants: Vec<DiscoveredUser>,
}

impl BatchRecord {
    pub fn new(
        worker_id: usize,
        batch_number: u64,
        cursor: Option<String>,
        posts: Vec<Post>,
        participants: Vec<DiscoveredUser>,
    ) -> Self {
        Self {
            meta: BatchMeta {
                worker_id,
                batch_number,
                cursor,
                collected_at: Utc::now(),
            },
            posts,
            participants,
        }
    }
}

/// File layout for one collection job.
///
/// Intermediate files live in `<data_dir>/<job>/`; the merged final
/// result lands at `<data_dir>/<job>.json`.
pub struct CheckpointStore {
    data_dir: PathBuf,
    job: String,
    job_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(data_dir: impl Into<PathBuf>, job: &str) -> Self {
        let data_dir = data_dir.into();
        let job_dir = data_dir.join(job);
        Self {
            data_dir,
            job: job.to_string(),
            job_dir,
        }
    }

    fn batch_path(&self, worker_id: usize, batch_number: u64) -> PathBuf {
        self.job_dir
            .join(format!("{}_worker_{worker_id}_batch_{batch_number:05}.json", self.job))
    }

    fn checkpoint_path(&self, worker_id: usize) -> PathBuf {
        self.job_dir
            .join(format!("{}_worker_{worker_id}_checkpoint.json", self.job))
    }

    fn worker_result_path(&self, worker_id: usize) -> PathBuf {
        self.job_dir.join(format!("{}_worker_{worker_id}.json", self.job))
    }

    pub fn final_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.json", self.job))
    }

    /// Persist a batch and advance the checkpoint. Batch numbers must be
    /// contiguous starting at 1; anything else means the caller lost track
    /// of its own progress and the job is aborted rather than corrupted.
    pub async fn write_batch(&self, batch: &BatchRecord) -> Result<Checkpoint> {
        let worker_id = batch.meta.worker_id;
        let previous = self.read_checkpoint(worker_id).await?;
        let expected = previous.as_ref().map(|c| c.last_batch + 1).unwrap_or(1);
        if batch.meta.batch_number != expected {
            return Err(AppError::storage(format!(
                "worker {worker_id}: expected batch {expected}, got {}",
                batch.meta.batch_number
            )));
        }

        write_json_atomic(&self.batch_path(worker_id, batch.meta.batch_number), batch).await?;

        let checkpoint = Checkpoint {
            last_batch: batch.meta.batch_number,
            cursor: batch.meta.cursor.clone(),
            items_total: previous.map(|c| c.items_total).unwrap_or(0) + batch.posts.len() as u64,
        };
        write_json_atomic(&self.checkpoint_path(worker_id), &checkpoint).await?;
        Ok(checkpoint)
    }

    pub async fn read_checkpoint(&self, worker_id: usize) -> Result<Option<Checkpoint>> {
        read_json_opt(&self.checkpoint_path(worker_id)).await
    }

    /// Batch numbers acknowledged by the checkpoint, in order. Orphan
    /// batch files beyond the checkpoint are not listed.
    pub async fn list_batches(&self, worker_id: usize) -> Result<Vec<u64>> {
        let Some(checkpoint) = self.read_checkpoint(worker_id).await? else {
            return Ok(Vec::new());
        };
        Ok((1..=checkpoint.last_batch).collect())
    }

    pub async fn read_batch(&self, worker_id: usize, batch_number: u64) -> Result<BatchRecord> {
        let path = self.batch_path(worker_id, batch_number);
        read_json_opt(&path).await?.ok_or_else(|| {
            AppError::storage(format!(
                "checkpointed batch file missing: {}",
                path.display()
            ))
        })
    }

    /// Write the worker's merged result document.
    pub async fn write_worker_result<T: Serialize>(
        &self,
        worker_id: usize,
        result: &T,
    ) -> Result<PathBuf> {
        let path = self.worker_result_path(worker_id);
        write_json_atomic(&path, result).await?;
        Ok(path)
    }

    pub async fn read_worker_result<T: DeserializeOwned>(
        &self,
        worker_id: usize,
    ) -> Result<Option<T>> {
        read_json_opt(&self.worker_result_path(worker_id)).await
    }

    /// Write the job-level merged result.
    pub async fn write_final_result<T: Serialize>(&self, result: &T) -> Result<PathBuf> {
        let path = self.final_path();
        write_json_atomic(&path, result).await?;
        Ok(path)
    }

    /// Delete a worker's batch and checkpoint files after its result
    /// document has been written. Orphan batch files are removed too.
    pub async fn remove_worker_intermediates(&self, worker_id: usize) -> Result<()> {
        let prefix = format!("{}_worker_{worker_id}_", self.job);
        let mut entries = match tokio::fs::read_dir(&self.job_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
