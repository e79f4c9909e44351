use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{MediaCache, ResultCache};
use crate::config::Config;
use crate::error::{CacheError, ServiceError};
use crate::jobs::{JobOptions, JobScheduler, JobSnapshot, SchedulerSettings, SubmitOutcome, VideoPipeline, VideoRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Result,
    Memory,
    Media,
}

impl FromStr for ClearScope {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "result" => Ok(Self::Result),
            "memory" => Ok(Self::Memory),
            "media" | "video" => Ok(Self::Media),
            other => Err(ServiceError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub cache_enabled: bool,
    pub memory_items: usize,
    pub memory_capacity: usize,
    pub result_items: usize,
    pub media_items: usize,
    pub media_capacity: usize,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MaintenanceReport {
    pub expired_results: usize,
    pub stale_media: usize,
    pub reaped_jobs: usize,
}

/// 进程内唯一的服务对象，在 main 中创建后以 Arc 传给各调用方
pub struct VideoService {
    result_cache: Arc<ResultCache>,
    media_cache: Arc<MediaCache>,
    scheduler: JobScheduler,
    cache_enabled: bool,
    job_max_age: Duration,
    shutdown: CancellationToken,
}

impl VideoService {
    pub async fn new(config: &Config, pipeline: Arc<dyn VideoPipeline>) -> Result<Self, CacheError> {
        let result_cache = Arc::new(
            ResultCache::new(&config.cache_dir, config.memory_cache_capacity, config.cache_ttl).await?,
        );
        let media_cache = Arc::new(
            MediaCache::new(&config.media_cache_dir, config.media_cache_size, config.media_max_age)
                .await
                .map_err(|e| CacheError::io(e, &config.media_cache_dir, "create_dir_all"))?,
        );
        let scheduler = JobScheduler::new(
            SchedulerSettings::from_config(config),
            pipeline,
            result_cache.clone(),
            media_cache.clone(),
        );

        Ok(Self {
            result_cache,
            media_cache,
            scheduler,
            cache_enabled: config.cache_enabled,
            job_max_age: config.job_max_age,
            shutdown: CancellationToken::new(),
        })
    }

    pub async fn submit_job(&self, hadith: Value, options: JobOptions) -> Result<SubmitOutcome, ServiceError> {
        let request = VideoRequest::new(hadith)?;
        Ok(self.scheduler.submit(request, options).await)
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        self.scheduler.poll(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> bool {
        self.scheduler.cancel(job_id).await
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        CacheStats {
            cache_enabled: self.cache_enabled,
            memory_items: self.result_cache.memory_len().await,
            memory_capacity: self.result_cache.capacity(),
            result_items: self.result_cache.len().await,
            media_items: self.media_cache.len().await,
            media_capacity: self.media_cache.capacity(),
        }
    }

    pub async fn clear_cache(&self, scope: ClearScope) {
        match scope {
            ClearScope::All => {
                self.result_cache.clear().await;
                self.media_cache.clear().await;
            }
            ClearScope::Result => {
                self.result_cache.clear().await;
            }
            ClearScope::Memory => self.result_cache.clear_memory().await,
            ClearScope::Media => {
                self.media_cache.clear().await;
            }
        }
        info!(?scope, "cache cleared");
    }

    pub async fn active_jobs(&self) -> usize {
        self.scheduler.active_jobs().await
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired_results: self.result_cache.sweep_expired().await,
            stale_media: self.media_cache.purge_stale().await,
            reaped_jobs: self.scheduler.reap(self.job_max_age).await,
        };
        debug!(?report, "maintenance pass finished");
        report
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.scheduler.cancel_all().await;
        info!(cancelled, "service shut down");
    }
}

/// 周期性清理：过期结果、过期素材、旧任务记录。不在读路径上执行。
pub fn spawn_maintenance(service: Arc<VideoService>, every: Duration) -> JoinHandle<()> {
    let shutdown = service.shutdown_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // 第一次 tick 立即返回，跳过
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    service.run_maintenance().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parsing() {
        assert_eq!("all".parse::<ClearScope>().unwrap(), ClearScope::All);
        assert_eq!("Result".parse::<ClearScope>().unwrap(), ClearScope::Result);
        assert_eq!("video".parse::<ClearScope>().unwrap(), ClearScope::Media);
        assert!(matches!(
            "disk".parse::<ClearScope>(),
            Err(ServiceError::UnknownScope(s)) if s == "disk"
        ));
    }
}
