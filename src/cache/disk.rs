//! Disk-backed cache scoped to a data directory and a temporary-write directory.

use super::backend::CacheBackend;
use super::key::sha256_hex;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

const BYTES_PER_GB: u64 = 1_000_000_000;

struct ReadCache {
    entries: LruCache<String, Arc<Vec<u8>>>,
    bytes: u64,
    max_bytes: u64,
}

impl ReadCache {
    fn get(&mut self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.get(name).cloned()
    }

    fn put(&mut self, name: String, value: Arc<Vec<u8>>) {
        self.remove(&name);
        let size = value.len() as u64;
        if size > self.max_bytes {
            return;
        }
        while self.bytes + size > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.len() as u64,
                None => break,
            }
        }
        self.bytes += size;
        self.entries.put(name, value);
    }

    fn remove(&mut self, name: &str) {
        if let Some(old) = self.entries.pop(name) {
            self.bytes -= old.len() as u64;
        }
    }
}

/// Files live under `base_path`, one per key, named by the key's sha256.
/// Writes land in `temp_dir` first and are renamed into place, so readers
/// never observe a partially written entry.
///
/// `max_size` bounds the in-process read cache kept in front of the files,
/// not the size of the directory.
pub struct DiskCache {
    base_path: PathBuf,
    temp_dir: PathBuf,
    read_cache: Mutex<ReadCache>,
}

impl DiskCache {
    pub fn new(base_path: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            base_path: base_path.into(),
            temp_dir: temp_dir.into(),
            read_cache: Mutex::new(ReadCache {
                entries: LruCache::unbounded(),
                bytes: 0,
                max_bytes: max_size,
            }),
        }
    }

    /// `size_gb` in decimal gigabytes.
    pub fn with_size_gb(base_path: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>, size_gb: u64) -> Self {
        Self::new(base_path, temp_dir, size_gb.saturating_mul(BYTES_PER_GB))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    fn file_name(key: &str) -> String {
        sha256_hex(key.as_bytes())
    }

    fn read_cache(&self) -> std::sync::MutexGuard<'_, ReadCache> {
        self.read_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn storage_error(op: &str, path: &Path, err: std::io::Error) -> Error {
    Error::storage_with_context(
        format!("{} failed: {}", op, err),
        ErrorContext::new()
            .with_details(path.display().to_string())
            .with_source("disk_cache"),
    )
}

#[async_trait]
impl CacheBackend for DiskCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = Self::file_name(key);
        let cached = self.read_cache().get(&name);
        if let Some(hit) = cached {
            return Ok(Some(hit.as_ref().clone()));
        }
        let path = self.base_path.join(&name);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                self.read_cache().put(name, Arc::new(data.clone()));
                Ok(Some(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", &path, e)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let name = Self::file_name(key);
        for dir in [&self.base_path, &self.temp_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| storage_error("create dir", dir, e))?;
        }

        let staging = self.temp_dir.join(Uuid::new_v4().to_string());
        tokio::fs::write(&staging, value)
            .await
            .map_err(|e| storage_error("write", &staging, e))?;

        let dest = self.base_path.join(&name);
        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(storage_error("rename", &dest, e));
        }

        self.read_cache().put(name, Arc::new(value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let name = Self::file_name(key);
        self.read_cache().remove(&name);
        let path = self.base_path.join(&name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("delete", &path, e)),
        }
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
