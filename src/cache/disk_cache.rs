use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{expiry_from, hash_key, CacheItem, INDEX_FILE};
use crate::error::CacheError;

/// 索引条目：key -> 数据文件位置、过期时间、大小
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size: usize,
}

impl IndexEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

pub struct DiskCache {
    cache_dir: PathBuf,
    index: Mutex<HashMap<String, IndexEntry>>,
}

impl DiskCache {
    pub async fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::io(e, &cache_dir, "create_dir_all"))?;
        let index = load_index(&cache_dir.join(INDEX_FILE)).await;
        debug!(dir = %cache_dir.display(), entries = index.len(), "result cache index loaded");
        Ok(Self {
            cache_dir,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn get_cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.cache", hash_key(key)))
    }

    /// 读取条目；过期或数据文件丢失时顺带删除并返回 None
    pub async fn load(&self, key: &str) -> Result<Option<CacheItem>, CacheError> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.get(key).cloned() else {
            return Ok(None);
        };

        if entry.is_expired() {
            debug!(key, "result cache entry expired");
            index.remove(key);
            remove_file_if_exists(&entry.file_path).await?;
            self.persist_index(&index).await?;
            return Ok(None);
        }

        let data = match fs::read(&entry.file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key, path = %entry.file_path.display(), "cached payload missing, dropping index entry");
                index.remove(key);
                self.persist_index(&index).await?;
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(e, &entry.file_path, "read")),
        };

        Ok(Some(CacheItem {
            size: data.len(),
            data: Bytes::from(data),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }))
    }

    pub async fn save(&self, key: &str, data: &[u8], ttl: Duration) -> Result<CacheItem, CacheError> {
        let file_path = self.get_cache_path(key);
        fs::write(&file_path, data)
            .await
            .map_err(|e| CacheError::io(e, &file_path, "write"))?;

        let now = Utc::now();
        let entry = IndexEntry {
            file_path,
            created_at: now,
            expires_at: expiry_from(now, ttl),
            size: data.len(),
        };
        let item = CacheItem {
            data: Bytes::copy_from_slice(data),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            size: entry.size,
        };

        let mut index = self.index.lock().await;
        index.insert(key.to_string(), entry);
        self.persist_index(&index).await?;
        Ok(item)
    }

    /// 不存在的 key 也返回 Ok
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.remove(key) else {
            return Ok(false);
        };
        remove_file_if_exists(&entry.file_path).await?;
        self.persist_index(&index).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut index = self.index.lock().await;
        let removed = index.len();
        for entry in index.values() {
            remove_file_if_exists(&entry.file_path).await?;
        }
        index.clear();
        self.persist_index(&index).await?;
        Ok(removed)
    }

    pub async fn sweep_expired(&self) -> Result<usize, CacheError> {
        let mut index = self.index.lock().await;
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = index.remove(key) {
                remove_file_if_exists(&entry.file_path).await?;
            }
        }
        if !expired.is_empty() {
            self.persist_index(&index).await?;
        }
        Ok(expired.len())
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    // 先写临时文件再 rename，避免进程中断留下半个索引
    async fn persist_index(&self, index: &HashMap<String, IndexEntry>) -> Result<(), CacheError> {
        let index_path = self.cache_dir.join(INDEX_FILE);
        let tmp_path = index_path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(index)?;
        fs::write(&tmp_path, json)
            .await
            .map_err(|e| CacheError::io(e, &tmp_path, "write"))?;
        fs::rename(&tmp_path, &index_path)
            .await
            .map_err(|e| CacheError::io(e, &index_path, "rename"))?;
        Ok(())
    }
}

async fn load_index(path: &Path) -> HashMap<String, IndexEntry> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read cache index, starting empty");
            return HashMap::new();
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(index) => index,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cache index, starting empty");
            HashMap::new()
        }
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(e, path, "remove_file")),
    }
}
