use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::hash_key;

pub const MEDIA_FILE_EXT: &str = "mp4";

#[derive(Clone, Debug, Serialize)]
pub struct MediaCacheEntry {
    pub query: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    #[serde(skip)]
    seq: u64,
}

/// 背景素材缓存：按查询词哈希命名，24 小时过期，总数超限时全局淘汰最旧文件。
/// 缓存目录中的文件归缓存所有，任何 I/O 失败都只记录日志，调用方回落到重新获取。
pub struct MediaCache {
    cache_dir: PathBuf,
    max_entries: usize,
    max_age: Duration,
    entries: Mutex<HashMap<String, MediaCacheEntry>>,
    next_seq: AtomicU64,
}

impl MediaCache {
    pub async fn new(cache_dir: impl Into<PathBuf>, max_entries: usize, max_age: Duration) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).await?;
        }
        Ok(Self {
            cache_dir,
            max_entries,
            max_age,
            entries: Mutex::new(HashMap::new()),
            // 0 留给上次进程遗留、没有元数据的文件
            next_seq: AtomicU64::new(1),
        })
    }

    fn get_cache_path(&self, query: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", hash_key(query), MEDIA_FILE_EXT))
    }

    pub async fn lookup(&self, query: &str) -> Option<PathBuf> {
        let cache_path = self.get_cache_path(query);
        let modified = match fs::metadata(&cache_path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(query, error = %e, "failed to stat cached media");
                return None;
            }
        };

        if age_of(modified) < self.max_age {
            debug!(query, path = %cache_path.display(), "background media cache hit");
            return Some(cache_path);
        }

        info!(query, "cached background media is stale, removing");
        self.remove_file(&cache_path).await;
        None
    }

    /// 复制（不移动）源文件进缓存，然后按容量淘汰。
    /// 先写到临时文件再 rename，lookup 拿到的路径总是完整文件。
    pub async fn store(&self, query: &str, source_path: &Path) -> bool {
        let cache_path = self.get_cache_path(query);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = cache_path.with_extension(format!("{MEDIA_FILE_EXT}.{seq}.tmp"));

        let size = match fs::copy(source_path, &tmp_path).await {
            Ok(size) => size,
            Err(e) => {
                warn!(
                    query,
                    source = %source_path.display(),
                    error = %e,
                    "failed to cache background media"
                );
                discard_tmp(&tmp_path).await;
                return false;
            }
        };
        if let Err(e) = fs::rename(&tmp_path, &cache_path).await {
            warn!(query, file = %cache_path.display(), error = %e, "failed to move media into cache");
            discard_tmp(&tmp_path).await;
            return false;
        }

        let entry = MediaCacheEntry {
            query: query.to_string(),
            path: cache_path.clone(),
            created_at: Utc::now(),
            size,
            seq,
        };
        self.entries.lock().await.insert(file_key(&cache_path), entry);
        info!(query, size, "background media cached");

        self.evict_if_over_capacity().await;
        true
    }

    /// 按修改时间从旧到新删除，直到文件数不超过上限；不区分查询词
    pub async fn evict_if_over_capacity(&self) -> usize {
        let mut files = self.list_files().await;
        if files.len() <= self.max_entries {
            return 0;
        }

        {
            let entries = self.entries.lock().await;
            files.sort_by_key(|(path, modified)| {
                let seq = entries.get(&file_key(path)).map_or(0, |e| e.seq);
                (*modified, seq)
            });
        }

        let excess = files.len() - self.max_entries;
        let mut removed = 0;
        for (path, _) in files.into_iter().take(excess) {
            if self.remove_file(&path).await {
                info!(file = %path.display(), "evicted old background media");
                removed += 1;
            }
        }
        removed
    }

    pub async fn purge_stale(&self) -> usize {
        let mut removed = 0;
        for (path, modified) in self.list_files().await {
            if age_of(modified) >= self.max_age && self.remove_file(&path).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "purged stale background media");
        }
        removed
    }

    pub async fn clear(&self) -> usize {
        let mut removed = 0;
        for (path, _) in self.list_files().await {
            if self.remove_file(&path).await {
                removed += 1;
            }
        }
        self.entries.lock().await.clear();
        removed
    }

    pub async fn entries(&self) -> Vec<MediaCacheEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.list_files().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    async fn list_files(&self) -> Vec<(PathBuf, SystemTime)> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(dir = %self.cache_dir.display(), error = %e, "failed to list media cache");
                return files;
            }
        };

        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some(MEDIA_FILE_EXT) {
                        continue;
                    }
                    match entry.metadata().await.and_then(|m| m.modified()) {
                        Ok(modified) => files.push((path, modified)),
                        Err(e) => warn!(file = %path.display(), error = %e, "failed to stat media file"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "media cache listing interrupted");
                    break;
                }
            }
        }
        files
    }

    async fn remove_file(&self, path: &Path) -> bool {
        self.entries.lock().await.remove(&file_key(path));
        match fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to delete cached media");
                false
            }
        }
    }
}

fn file_key(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn discard_tmp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(file = %path.display(), error = %e, "failed to remove partial media copy");
        }
    }
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_file(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn store_copies_and_lookup_hits() {
        let cache_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let cache = MediaCache::new(cache_dir.path(), 10, Duration::from_secs(3600)).await.unwrap();
        let src = source_file(&src_dir, "mosque.mp4");

        assert!(cache.lookup("mosque").await.is_none());
        assert!(cache.store("mosque", &src).await);
        assert!(src.exists(), "source must be copied, not moved");

        let cached = cache.lookup("mosque").await.unwrap();
        assert_eq!(std::fs::read(cached).unwrap(), b"mosque.mp4");
        assert_eq!(cache.entries().await[0].query, "mosque");
    }

    #[tokio::test]
    async fn stale_entry_is_removed_on_lookup() {
        let cache_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let cache = MediaCache::new(cache_dir.path(), 10, Duration::ZERO).await.unwrap();
        let src = source_file(&src_dir, "desert.mp4");

        assert!(cache.store("desert", &src).await);
        assert!(cache.lookup("desert").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn eviction_keeps_most_recent_entries() {
        let cache_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let cache = MediaCache::new(cache_dir.path(), 3, Duration::from_secs(3600)).await.unwrap();

        for i in 0..5 {
            let src = source_file(&src_dir, &format!("clip{i}.mp4"));
            assert!(cache.store(&format!("query {i}"), &src).await);
        }

        assert_eq!(cache.len().await, 3);
        assert!(cache.lookup("query 0").await.is_none());
        assert!(cache.lookup("query 1").await.is_none());
        for i in 2..5 {
            assert!(cache.lookup(&format!("query {i}")).await.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lookup_never_sees_partial_copy() {
        const LEN: usize = 512 * 1024;
        let cache_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(
            MediaCache::new(cache_dir.path(), 10, Duration::from_secs(3600)).await.unwrap(),
        );

        let sources: Vec<PathBuf> = (0..4u8)
            .map(|i| {
                let path = src_dir.path().join(format!("clip{i}.mp4"));
                std::fs::write(&path, vec![b'a' + i; LEN]).unwrap();
                path
            })
            .collect();
        assert!(cache.store("same query", &sources[0]).await);

        let writers: Vec<_> = sources
            .iter()
            .cycle()
            .take(16)
            .cloned()
            .map(|src| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.store("same query", &src).await })
            })
            .collect();

        for _ in 0..50 {
            let path = cache.lookup("same query").await.expect("entry present throughout");
            let data = tokio::fs::read(&path).await.unwrap();
            assert_eq!(data.len(), LEN, "read a truncated file");
            assert!(data.iter().all(|b| *b == data[0]), "read a mixed file");
            tokio::task::yield_now().await;
        }
        for writer in writers {
            assert!(writer.await.unwrap());
        }

        let leftovers: Vec<_> = std::fs::read_dir(cache_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn missing_source_is_soft_failure() {
        let cache_dir = TempDir::new().unwrap();
        let cache = MediaCache::new(cache_dir.path(), 3, Duration::from_secs(3600)).await.unwrap();
        assert!(!cache.store("q", Path::new("/nonexistent/clip.mp4")).await);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn purge_and_clear() {
        let cache_dir = TempDir::new().unwrap();
        let src_dir = TempDir::new().unwrap();
        let cache = MediaCache::new(cache_dir.path(), 10, Duration::ZERO).await.unwrap();
        let src = source_file(&src_dir, "a.mp4");
        cache.store("a", &src).await;
        cache.store("b", &src).await;
        assert_eq!(cache.purge_stale().await, 2);

        let cache = MediaCache::new(cache_dir.path(), 10, Duration::from_secs(3600)).await.unwrap();
        cache.store("a", &src).await;
        std::fs::write(cache_dir.path().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(cache.clear().await, 1);
        assert!(cache_dir.path().join("notes.txt").exists());
    }
}
