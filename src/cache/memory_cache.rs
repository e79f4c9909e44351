use super::{CacheItem, DiskCache};
use crate::error::CacheError;
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 结果缓存：内存 LRU 在前，磁盘索引在后。
///
/// 内存层只缓存磁盘上已成功写入的条目，满时淘汰最久未使用的条目，
/// 因此刚写入的 key 也可能在内存里查不到，读取会回落到磁盘。
/// 所有错误都在这里记录并吞掉，调用方只看到命中或未命中。
/// 锁顺序固定为先内存层后磁盘索引，两层在同一把锁下一起修改。
pub struct ResultCache {
    store: Mutex<LruCache<String, CacheItem>>,
    capacity: usize,
    default_ttl: Duration,
    disk_cache: DiskCache,
}

impl ResultCache {
    pub async fn new(
        cache_dir: impl Into<PathBuf>,
        capacity: usize,
        default_ttl: Duration,
    ) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            store: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
            default_ttl,
            disk_cache: DiskCache::open(cache_dir).await?,
        })
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        // 整个读取过程持有内存层锁，回填时不会与 delete/clear 交错
        let mut store = self.store.lock().await;
        if let Some(item) = store.get(key) {
            if !item.is_expired() {
                return Some(item.data.clone());
            }
            store.pop(key);
        }

        // 内存中没有，检查磁盘缓存（过期条目在这里被删除）
        match self.disk_cache.load(key).await {
            Ok(Some(item)) => {
                let data = item.data.clone();
                store.put(key.to_string(), item);
                Some(data)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "result cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        let data = self.get(key).await?;
        match String::from_utf8(data.to_vec()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, "cached payload is not valid UTF-8");
                None
            }
        }
    }

    /// ttl 为 None 时使用默认值；磁盘写入失败返回 false
    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut store = self.store.lock().await;
        match self.disk_cache.save(key, value.as_ref(), ttl).await {
            Ok(item) => {
                store.put(key.to_string(), item);
                debug!(key, ttl_secs = ttl.as_secs(), "result cached");
                true
            }
            Err(e) => {
                // 磁盘上没有的条目不能留在内存里
                store.pop(key);
                error!(key, error = %e, "failed to persist cache entry");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut store = self.store.lock().await;
        store.pop(key);
        match self.disk_cache.remove(key).await {
            Ok(_) => true,
            Err(e) => {
                error!(key, error = %e, "failed to delete cache entry");
                false
            }
        }
    }

    pub async fn clear(&self) -> bool {
        let mut store = self.store.lock().await;
        store.clear();
        match self.disk_cache.clear().await {
            Ok(removed) => {
                info!(removed, "result cache cleared");
                true
            }
            Err(e) => {
                error!(error = %e, "failed to clear result cache");
                false
            }
        }
    }

    pub async fn clear_memory(&self) {
        self.store.lock().await.clear();
    }

    pub async fn sweep_expired(&self) -> usize {
        let mut store = self.store.lock().await;
        let expired: Vec<String> = store
            .iter()
            .filter(|(_, item)| item.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            store.pop(&key);
        }

        match self.disk_cache.sweep_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "swept expired result cache entries");
                }
                removed
            }
            Err(e) => {
                error!(error = %e, "result cache sweep failed");
                0
            }
        }
    }

    pub async fn memory_len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.disk_cache.len().await
    }
}
