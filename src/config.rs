use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{DEFAULT_MEDIA_CAPACITY, DEFAULT_MEMORY_CAPACITY, DEFAULT_TTL, MEDIA_MAX_AGE};

#[derive(Debug, Clone)]
pub struct Config {
    // 服务
    pub listen_addr: SocketAddr,
    pub max_connections: usize,

    // 路径
    pub cache_dir: PathBuf,
    pub media_cache_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,

    // 缓存
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub memory_cache_capacity: usize,
    pub media_cache_size: usize,
    pub media_max_age: Duration,

    // 任务
    pub max_parallel_jobs: usize,
    pub job_max_age: Duration,
    pub maintenance_interval: Duration,
    pub job_timeout: Option<Duration>, // None 表示不设截止时间
    pub default_media_query: String,

    // 外部程序
    pub tts_command: Option<String>,
    pub media_command: Option<String>,
    pub compose_command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_connections: 100,
            cache_dir: PathBuf::from("temp/cache"),
            media_cache_dir: PathBuf::from("temp/bg_videos"),
            temp_dir: PathBuf::from("temp"),
            output_dir: PathBuf::from("output"),
            cache_enabled: true,
            cache_ttl: DEFAULT_TTL,
            memory_cache_capacity: DEFAULT_MEMORY_CAPACITY,
            media_cache_size: DEFAULT_MEDIA_CAPACITY,
            media_max_age: MEDIA_MAX_AGE,
            max_parallel_jobs: 3,
            job_max_age: Duration::from_secs(24 * 3600),
            maintenance_interval: Duration::from_secs(300),
            job_timeout: None,
            default_media_query: "nature".to_string(),
            tts_command: None,
            media_command: None,
            compose_command: None,
        }
    }
}

impl Config {
    /// 从环境变量读取，未设置的项使用默认值；当前目录下的 .env 也会被加载
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 读取指定的 .env 文件，进程环境变量优先
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut vars = HashMap::new();
        for item in dotenvy::from_path_iter(path).with_context(|| format!("failed to open {}", path.display()))? {
            let (key, value) = item.with_context(|| format!("malformed entry in {}", path.display()))?;
            vars.insert(key, value);
        }
        Self::from_lookup(|name| std::env::var(name).ok().or_else(|| vars.get(name).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            listen_addr: parse_or(&get, "LISTEN_ADDR", defaults.listen_addr)?,
            max_connections: parse_or(&get, "MAX_CONNECTIONS", defaults.max_connections)?,

            cache_dir: get("CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            media_cache_dir: get("MEDIA_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_cache_dir),
            temp_dir: get("TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
            output_dir: get("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),

            cache_enabled: parse_or(&get, "CACHE_ENABLED", defaults.cache_enabled)?,
            cache_ttl: secs_or(&get, "CACHE_TTL_SECS", defaults.cache_ttl)?,
            memory_cache_capacity: parse_or(&get, "MEMORY_CACHE_CAPACITY", defaults.memory_cache_capacity)?,
            media_cache_size: parse_or(&get, "MEDIA_CACHE_SIZE", defaults.media_cache_size)?,
            media_max_age: secs_or(&get, "MEDIA_MAX_AGE_SECS", defaults.media_max_age)?,

            max_parallel_jobs: parse_or(&get, "MAX_PARALLEL_JOBS", defaults.max_parallel_jobs)?,
            job_max_age: secs_or(&get, "JOB_MAX_AGE_SECS", defaults.job_max_age)?,
            maintenance_interval: secs_or(&get, "MAINTENANCE_INTERVAL_SECS", defaults.maintenance_interval)?,
            job_timeout: match get("JOB_TIMEOUT_SECS") {
                Some(raw) => Some(Duration::from_secs(
                    raw.trim().parse().context("JOB_TIMEOUT_SECS must be a number of seconds")?,
                )),
                None => None,
            },
            default_media_query: get("DEFAULT_MEDIA_QUERY").unwrap_or(defaults.default_media_query),

            tts_command: get("TTS_COMMAND"),
            media_command: get("MEDIA_COMMAND"),
            compose_command: get("COMPOSE_COMMAND"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_jobs == 0 {
            bail!("MAX_PARALLEL_JOBS must be at least 1");
        }
        if self.max_connections == 0 {
            bail!("MAX_CONNECTIONS must be at least 1");
        }
        if self.memory_cache_capacity == 0 {
            bail!("MEMORY_CACHE_CAPACITY must be at least 1");
        }
        if self.media_cache_size == 0 {
            bail!("MEDIA_CACHE_SIZE must be at least 1");
        }
        if self.cache_ttl.is_zero() {
            bail!("CACHE_TTL_SECS must be greater than 0");
        }
        if self.maintenance_interval.is_zero() {
            bail!("MAINTENANCE_INTERVAL_SECS must be greater than 0");
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            bail!("JOB_TIMEOUT_SECS must be greater than 0 when set");
        }
        Ok(())
    }

    /// 创建运行所需的目录
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.cache_dir, &self.media_cache_dir, &self.temp_dir, &self.output_dir] {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw}")),
        None => Ok(default),
    }
}

fn secs_or(get: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Result<Duration> {
    parse_or(get, name, default.as_secs()).map(Duration::from_secs)
}
