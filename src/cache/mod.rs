mod memory_cache;
mod disk_cache;
mod media_cache;

pub use memory_cache::*;
pub use disk_cache::*;
pub use media_cache::*;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub const DEFAULT_MEMORY_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MEDIA_CAPACITY: usize = 10;
pub const MEDIA_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
pub const INDEX_FILE: &str = "index.json";

#[derive(Clone, Debug)]
pub struct CacheItem {
    pub data: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size: usize,
}

impl CacheItem {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// 字符串的 sha256 十六进制摘要，用于生成磁盘文件名
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// 请求指纹：对象键递归排序后再哈希，字段顺序不同的等价请求得到同一个 key
pub fn fingerprint(request: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(request, &mut canonical);
    hash_key(&canonical)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// now + ttl，溢出时视为永不过期
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
