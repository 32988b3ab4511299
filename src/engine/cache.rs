// Single-slot on-disk document cache: deterministic path per document key.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::locator::DocumentRef;
use crate::config::{CacheKeyPolicy, CACHE_FILE_EXTENSION, PARTIAL_FILE_SUFFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub file_path: PathBuf,
    pub is_complete: bool,
}

pub struct DocumentCache {
    root: PathBuf,
    policy: CacheKeyPolicy,
}

impl DocumentCache {
    pub fn new(root: impl Into<PathBuf>, policy: CacheKeyPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache key for a document. Under `BookOnly` every episode of a book shares one key.
    pub fn key_for(&self, doc: &DocumentRef) -> String {
        let book = sanitize_component(&doc.book_id);
        match (self.policy, doc.episode_id.as_deref()) {
            (CacheKeyPolicy::BookAndEpisode, Some(episode)) if !episode.is_empty() => {
                format!("{}_{}", book, sanitize_component(episode))
            }
            _ => book,
        }
    }

    /// Destination path for a key. Pure function of the root and the key.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", sanitize_component(key), CACHE_FILE_EXTENSION))
    }

    /// Path of the in-flight transfer file for a key.
    pub fn partial_path(&self, key: &str) -> PathBuf {
        partial_path_for(&self.path(key))
    }

    pub async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.path(key)).await.unwrap_or(false)
    }

    /// Presence of the final file is the only completeness signal.
    pub async fn entry(&self, key: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            file_path: self.path(key),
            is_complete: self.exists(key).await,
        }
    }

    /// Delete the cached file and any leftover partial file.
    pub async fn remove(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.path(key)).await?;
        remove_if_exists(&self.partial_path(key)).await?;
        debug!("cache slot {} cleared", key);
        Ok(())
    }
}

/// Exclusive hold on one cache path. Transfers keep it from the first file
/// operation until their partial file is renamed or removed, so controllers for
/// different episodes sharing a slot never touch each other's files.
pub struct SlotGuard {
    _guard: OwnedMutexGuard<()>,
}

static SLOT_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Weak<AsyncMutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Wait until no other transfer in this process holds `destination`.
pub async fn lock_slot(destination: &Path) -> SlotGuard {
    let lock = {
        let mut locks = SLOT_LOCKS.lock();
        locks.retain(|_, lock| lock.strong_count() > 0);
        match locks.get(destination).and_then(Weak::upgrade) {
            Some(lock) => lock,
            None => {
                let lock = Arc::new(AsyncMutex::new(()));
                locks.insert(destination.to_path_buf(), Arc::downgrade(&lock));
                lock
            }
        }
    };
    SlotGuard {
        _guard: lock.lock_owned().await,
    }
}

pub(crate) fn partial_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_FILE_SUFFIX);
    destination.with_file_name(name)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Map an identifier onto a single safe file-name component.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
