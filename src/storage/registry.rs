// src/storage/registry.rs

//! Process-wide registry of users discovered during collection.
//!
//! All workers funnel sightings through one registry, and several
//! collector processes may share the same user files (every run updates
//! the global list). Updates follow an exclusive-lock read-merge-write
//! cycle per target file: a tokio mutex serializes workers inside the
//! process, and an OS advisory lock on a sidecar `.lock` file serializes
//! across processes. The sidecar is never renamed, so the lock stays
//! valid while the data file is atomically replaced.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::fs_std::FileExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::DiscoveredUser;

const GLOBAL_FILE: &str = "discovered_users.json";

/// Concurrent-safe accumulator of discovered users.
pub struct UserRegistry {
    users_dir: PathBuf,
    /// One lock per target file, held only for the read-merge-write cycle.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl UserRegistry {
    pub fn new(users_dir: impl Into<PathBuf>) -> Self {
        Self {
            users_dir: users_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn global_path(&self) -> PathBuf {
        self.users_dir.join(GLOBAL_FILE)
    }

    fn topic_path(&self, topic: &str) -> PathBuf {
        let safe = topic.replace([' ', '.', '/'], "_");
        self.users_dir.join(format!("discovered_users_{safe}.json"))
    }

    /// Record users in the global file and, when `topic` is given, in the
    /// topic-scoped file as well. Users are deduplicated by `did`; a
    /// previously-missing display name is backfilled, nothing is deleted.
    pub async fn register(&self, users: &[DiscoveredUser], topic: Option<&str>) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        self.merge_into(&self.global_path(), users).await?;
        if let Some(topic) = topic {
            self.merge_into(&self.topic_path(topic), users).await?;
        }
        Ok(())
    }

    /// Read the global user list (empty if no file yet).
    pub async fn read_global(&self) -> Result<Vec<DiscoveredUser>> {
        read_users(&self.global_path()).await
    }

    /// Read a topic-scoped user list (empty if no file yet).
    pub async fn read_topic(&self, topic: &str) -> Result<Vec<DiscoveredUser>> {
        read_users(&self.topic_path(topic)).await
    }

    async fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    async fn merge_into(&self, path: &Path, users: &[DiscoveredUser]) -> Result<()> {
        let lock = self.file_lock(path).await;
        let _guard = lock.lock().await;

        let path = path.to_path_buf();
        let users = users.to_vec();
        tokio::task::spawn_blocking(move || merge_on_disk(&path, &users))
            .await
            .map_err(|e| AppError::storage(format!("registry merge task failed: {e}")))?
    }
}

/// Read-merge-write under an exclusive OS lock. Runs on the blocking
/// pool; `fs4` lock calls block the thread.
fn merge_on_disk(path: &Path, users: &[DiscoveredUser]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("lock"))?;
    lock_file.lock_exclusive()?;

    let result = locked_merge(path, users);
    // Released on drop too; unlock eagerly so errors surface here.
    let _ = FileExt::unlock(&lock_file);
    result
}

fn locked_merge(path: &Path, users: &[DiscoveredUser]) -> Result<()> {
    let mut existing = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<Vec<DiscoveredUser>>(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let mut by_did: HashMap<String, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, user)| (user.did.clone(), i))
        .collect();

    let mut added = 0usize;
    for user in users {
        match by_did.get(&user.did).copied() {
            Some(i) => existing[i].absorb(user),
            None => {
                by_did.insert(user.did.clone(), existing.len());
                existing.push(user.clone());
                added += 1;
            }
        }
    }
    if added > 0 {
        log::debug!("{} new users registered in {}", added, path.display());
    }

    // Per-process temp name: two processes never clobber each other's
    // staging file even while racing for the lock.
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(&serde_json::to_vec_pretty(&existing)?)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn read_users(path: &Path) -> Result<Vec<DiscoveredUser>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
