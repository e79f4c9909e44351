use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{run_job, ProgressReporter, WorkerContext};
use super::{next_job_id, JobOptions, JobSnapshot, SubmitOutcome, SubmitState, VideoPipeline, VideoRequest};
use crate::cache::{MediaCache, ResultCache};
use crate::config::Config;
use crate::error::{JobError, ServiceError};

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub max_parallel_jobs: usize,
    pub cache_enabled: bool,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub default_media_query: String,
    pub job_timeout: Option<Duration>,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_parallel_jobs: config.max_parallel_jobs,
            cache_enabled: config.cache_enabled,
            temp_dir: config.temp_dir.clone(),
            output_dir: config.output_dir.clone(),
            default_media_query: config.default_media_query.clone(),
            job_timeout: config.job_timeout,
        }
    }
}

pub(crate) struct JobEntry {
    pub(crate) record: JobSnapshot,
    handle: Option<JoinHandle<Result<String, JobError>>>,
    token: CancellationToken,
}

#[derive(Default)]
pub(crate) struct JobRegistry {
    pub(crate) jobs: HashMap<String, JobEntry>,
    // 指纹 -> 进行中的任务，保证同一请求同一时间只有一个 worker
    in_flight: HashMap<String, String>,
}

impl JobRegistry {
    pub(crate) fn release_fingerprint(&mut self, fingerprint: &str, job_id: &str) {
        if self.in_flight.get(fingerprint).is_some_and(|id| id == job_id) {
            self.in_flight.remove(fingerprint);
        }
    }

    /// 任务句柄已结束时把结果同步进记录并释放句柄，只执行一次
    async fn reconcile(&mut self, job_id: &str) {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return;
        };
        let finished = entry.handle.as_ref().is_some_and(|handle| handle.is_finished());
        let handle = if finished { entry.handle.take() } else { None };
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(result)) => {
                    entry.record.complete(&result);
                }
                Ok(Err(e)) => {
                    entry.record.fail(&e);
                }
                Err(join_err) => {
                    warn!(job_id, error = %join_err, "worker task aborted");
                    entry.record.fail(&JobError::Internal(format!("worker task aborted: {join_err}")));
                }
            }
            debug!(job_id, status = ?entry.record.status, "job handle released");
        }
        if entry.record.status.is_terminal() {
            // worker 异常退出时也要释放指纹
            self.in_flight.retain(|_, id| id != job_id);
        }
    }

    fn cancel_entry(&mut self, job_id: &str) -> bool {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if !entry.record.cancel() {
            return false;
        }
        entry.token.cancel();
        // 释放句柄即可，worker 在下一个检查点自行退出
        entry.handle.take();
        self.in_flight.retain(|_, id| id != job_id);
        true
    }
}

pub(crate) type JobTable = Arc<RwLock<JobRegistry>>;

/// 视频任务调度器：固定大小的工作池，提交立即返回，进度可轮询，取消为协作式。
pub struct JobScheduler {
    table: JobTable,
    permits: Arc<Semaphore>,
    pipeline: Arc<dyn VideoPipeline>,
    result_cache: Arc<ResultCache>,
    media_cache: Arc<MediaCache>,
    settings: Arc<SchedulerSettings>,
}

impl JobScheduler {
    pub fn new(
        settings: SchedulerSettings,
        pipeline: Arc<dyn VideoPipeline>,
        result_cache: Arc<ResultCache>,
        media_cache: Arc<MediaCache>,
    ) -> Self {
        Self {
            table: Arc::new(RwLock::new(JobRegistry::default())),
            permits: Arc::new(Semaphore::new(settings.max_parallel_jobs.max(1))),
            pipeline,
            result_cache,
            media_cache,
            settings: Arc::new(settings),
        }
    }

    /// 先查结果缓存，再查进行中的同指纹任务，都没有才创建新任务。不等待任务执行。
    pub async fn submit(&self, request: VideoRequest, options: JobOptions) -> SubmitOutcome {
        let fingerprint = request.fingerprint();

        if self.settings.cache_enabled {
            if let Some(result) = self.result_cache.get_string(&fingerprint).await {
                info!(fingerprint = %fingerprint, result = %result, "serving cached video");
                return SubmitOutcome {
                    job_id: None,
                    status: SubmitState::Completed,
                    cached: true,
                    deduplicated: false,
                    result: Some(result),
                };
            }
        }

        let mut table = self.table.write().await;
        // 已退出但还没被轮询过的任务不能再被并入
        if let Some(existing) = table.in_flight.get(&fingerprint).cloned() {
            table.reconcile(&existing).await;
        }
        if let Some(existing) = table.in_flight.get(&fingerprint) {
            info!(job_id = %existing, "identical request already in flight");
            return SubmitOutcome {
                job_id: Some(existing.clone()),
                status: SubmitState::Attached,
                cached: false,
                deduplicated: true,
                result: None,
            };
        }

        let job_id = next_job_id();
        let token = CancellationToken::new();
        let ctx = WorkerContext {
            job_id: job_id.clone(),
            fingerprint: fingerprint.clone(),
            request,
            options,
            token: token.clone(),
            reporter: ProgressReporter::new(self.table.clone(), job_id.clone(), fingerprint.clone()),
            pipeline: self.pipeline.clone(),
            result_cache: self.result_cache.clone(),
            media_cache: self.media_cache.clone(),
            settings: self.settings.clone(),
        };

        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            // 超出池容量的任务在这里排队
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(JobError::Internal("worker pool closed".into())),
                },
                _ = ctx.token.cancelled() => return Err(JobError::Cancelled),
            };
            run_job(ctx).await
        });

        table.in_flight.insert(fingerprint, job_id.clone());
        table.jobs.insert(
            job_id.clone(),
            JobEntry {
                record: JobSnapshot::new(job_id.clone()),
                handle: Some(handle),
                token,
            },
        );
        info!(job_id = %job_id, "job submitted");

        SubmitOutcome {
            job_id: Some(job_id),
            status: SubmitState::Submitted,
            cached: false,
            deduplicated: false,
            result: None,
        }
    }

    /// 返回当前记录；任务句柄已结束时先同步结果
    pub async fn poll(&self, job_id: &str) -> Result<JobSnapshot, ServiceError> {
        let mut table = self.table.write().await;
        table.reconcile(job_id).await;
        table
            .jobs
            .get(job_id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    /// 尽力取消；任务不存在或已结束时返回 false
    pub async fn cancel(&self, job_id: &str) -> bool {
        let cancelled = self.table.write().await.cancel_entry(job_id);
        if cancelled {
            info!(job_id, "job cancelled");
        }
        cancelled
    }

    /// 删除超过 max_age 的任务记录，仍在运行的先取消
    pub async fn reap(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut table = self.table.write().await;
        let old: Vec<String> = table
            .jobs
            .iter()
            .filter(|(_, entry)| entry.record.start_time < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in &old {
            if table.cancel_entry(job_id) {
                info!(job_id = %job_id, "cancelled stale job before removal");
            }
            table.jobs.remove(job_id);
            table.in_flight.retain(|_, id| id != job_id);
        }
        if !old.is_empty() {
            info!(removed = old.len(), "reaped old job records");
        }
        old.len()
    }

    pub async fn cancel_all(&self) -> usize {
        let mut table = self.table.write().await;
        let ids: Vec<String> = table.jobs.keys().cloned().collect();
        ids.iter().filter(|id| table.cancel_entry(id)).count()
    }

    pub async fn active_jobs(&self) -> usize {
        self.table
            .read()
            .await
            .jobs
            .values()
            .filter(|entry| !entry.record.status.is_terminal())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::jobs::JobStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct GatedPipeline {
        gate: Notify,
        runs: AtomicUsize,
        media_dir: PathBuf,
        panic_in_compose: AtomicBool,
    }

    #[async_trait]
    impl VideoPipeline for GatedPipeline {
        async fn synthesize_audio(&self, _: &VideoRequest, output_path: &Path) -> Result<PathBuf, PipelineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            tokio::fs::write(output_path, b"audio").await.map_err(|e| PipelineError::Provider(e.to_string()))?;
            Ok(output_path.to_path_buf())
        }

        async fn acquire_background_media(&self, _: &str) -> Result<PathBuf, PipelineError> {
            let path = self.media_dir.join("bg.mp4");
            tokio::fs::write(&path, b"media").await.map_err(|e| PipelineError::Provider(e.to_string()))?;
            Ok(path)
        }

        async fn compose_video(&self, _: &VideoRequest, _: &Path, _: &Path, output_path: &Path) -> Result<PathBuf, PipelineError> {
            if self.panic_in_compose.load(Ordering::SeqCst) {
                panic!("compositor crashed");
            }
            Ok(output_path.to_path_buf())
        }
    }

    struct Fixture {
        _dir: TempDir,
        pipeline: Arc<GatedPipeline>,
        scheduler: JobScheduler,
    }

    async fn fixture(max_parallel_jobs: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for sub in ["tmp", "out", "media_src"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        let pipeline = Arc::new(GatedPipeline {
            gate: Notify::new(),
            runs: AtomicUsize::new(0),
            media_dir: root.join("media_src"),
            panic_in_compose: AtomicBool::new(false),
        });
        let result_cache = Arc::new(
            ResultCache::new(root.join("cache"), 10, Duration::from_secs(3600)).await.unwrap(),
        );
        let media_cache = Arc::new(
            MediaCache::new(root.join("bg"), 10, Duration::from_secs(3600)).await.unwrap(),
        );
        let settings = SchedulerSettings {
            max_parallel_jobs,
            cache_enabled: true,
            temp_dir: root.join("tmp"),
            output_dir: root.join("out"),
            default_media_query: "nature".into(),
            job_timeout: None,
        };
        let scheduler = JobScheduler::new(settings, pipeline.clone(), result_cache, media_cache);
        Fixture { _dir: dir, pipeline, scheduler }
    }

    fn request(text: &str) -> VideoRequest {
        VideoRequest::new(json!({ "text": text })).unwrap()
    }

    async fn wait_for_runs(pipeline: &GatedPipeline, expected: usize) {
        for _ in 0..200 {
            if pipeline.runs.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline never reached {expected} runs");
    }

    async fn wait_terminal(scheduler: &JobScheduler, job_id: &str) -> JobSnapshot {
        for _ in 0..400 {
            let snapshot = scheduler.poll(job_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never finished");
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let f = fixture(1).await;
        assert!(matches!(f.scheduler.poll("job_missing").await, Err(ServiceError::JobNotFound(_))));
        assert!(!f.scheduler.cancel("job_missing").await);
    }

    #[tokio::test]
    async fn identical_in_flight_request_attaches() {
        let f = fixture(2).await;
        let first = f.scheduler.submit(request("same"), JobOptions::default()).await;
        let second = f.scheduler.submit(request("same"), JobOptions::default()).await;

        assert_eq!(first.status, SubmitState::Submitted);
        assert_eq!(second.status, SubmitState::Attached);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert!(!second.cached);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(f.scheduler.len().await, 1);

        wait_for_runs(&f.pipeline, 1).await;
        f.pipeline.gate.notify_one();
        let job_id = first.job_id.unwrap();
        assert_eq!(wait_terminal(&f.scheduler, &job_id).await.status, JobStatus::Completed);
        assert_eq!(f.pipeline.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let f = fixture(1).await;
        let a = f.scheduler.submit(request("a"), JobOptions::default()).await.job_id.unwrap();
        let b = f.scheduler.submit(request("b"), JobOptions::default()).await.job_id.unwrap();

        wait_for_runs(&f.pipeline, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.pipeline.runs.load(Ordering::SeqCst), 1);
        assert_eq!(f.scheduler.poll(&b).await.unwrap().status, JobStatus::Initializing);

        f.pipeline.gate.notify_one();
        assert_eq!(wait_terminal(&f.scheduler, &a).await.status, JobStatus::Completed);
        wait_for_runs(&f.pipeline, 2).await;
        f.pipeline.gate.notify_one();
        assert_eq!(wait_terminal(&f.scheduler, &b).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn queued_job_cancels_without_running() {
        let f = fixture(1).await;
        let a = f.scheduler.submit(request("a"), JobOptions::default()).await.job_id.unwrap();
        let b = f.scheduler.submit(request("b"), JobOptions::default()).await.job_id.unwrap();
        wait_for_runs(&f.pipeline, 1).await;

        assert!(f.scheduler.cancel(&b).await);
        assert!(!f.scheduler.cancel(&b).await);
        assert_eq!(f.scheduler.poll(&b).await.unwrap().status, JobStatus::Cancelled);

        f.pipeline.gate.notify_one();
        wait_terminal(&f.scheduler, &a).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.pipeline.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_job_stops_after_current_stage() {
        let f = fixture(1).await;
        let job_id = f.scheduler.submit(request("a"), JobOptions::default()).await.job_id.unwrap();
        wait_for_runs(&f.pipeline, 1).await;

        assert!(f.scheduler.cancel(&job_id).await);
        f.pipeline.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = f.scheduler.poll(&job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(snapshot.result.is_none());
        // 取消后不会进入素材阶段
        assert!(snapshot.progress < 40);
    }

    #[tokio::test]
    async fn reap_removes_old_records_and_cancels_active() {
        let f = fixture(1).await;
        let job_id = f.scheduler.submit(request("a"), JobOptions::default()).await.job_id.unwrap();
        wait_for_runs(&f.pipeline, 1).await;

        assert_eq!(f.scheduler.reap(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.scheduler.reap(Duration::ZERO).await, 1);
        assert!(f.scheduler.poll(&job_id).await.is_err());
        f.pipeline.gate.notify_one();

        // 指纹已释放，可以重新提交
        let again = f.scheduler.submit(request("a"), JobOptions::default()).await;
        assert_eq!(again.status, SubmitState::Submitted);
        assert_ne!(again.job_id.as_deref(), Some(job_id.as_str()));
    }

    async fn wait_handle_finished(scheduler: &JobScheduler, job_id: &str) {
        for _ in 0..400 {
            let finished = scheduler.table.read().await.jobs[job_id]
                .handle
                .as_ref()
                .is_some_and(|handle| handle.is_finished());
            if finished {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker for {job_id} never exited");
    }

    #[tokio::test]
    async fn panicked_worker_is_reported_as_internal_failure() {
        let f = fixture(1).await;
        f.pipeline.panic_in_compose.store(true, Ordering::SeqCst);
        let job_id = f.scheduler.submit(request("boom"), JobOptions::default()).await.job_id.unwrap();
        wait_for_runs(&f.pipeline, 1).await;
        f.pipeline.gate.notify_one();
        wait_handle_finished(&f.scheduler, &job_id).await;

        let snapshot = f.scheduler.poll(&job_id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.failure_kind, Some(FailureKind::Internal));
        assert!(snapshot.error.unwrap().contains("worker task aborted"));

        let again = f.scheduler.submit(request("boom"), JobOptions::default()).await;
        assert_eq!(again.status, SubmitState::Submitted);
        assert_ne!(again.job_id.as_deref(), Some(job_id.as_str()));
    }

    #[tokio::test]
    async fn resubmit_does_not_attach_to_dead_worker() {
        let f = fixture(1).await;
        f.pipeline.panic_in_compose.store(true, Ordering::SeqCst);
        let job_id = f.scheduler.submit(request("boom"), JobOptions::default()).await.job_id.unwrap();
        wait_for_runs(&f.pipeline, 1).await;
        f.pipeline.gate.notify_one();
        wait_handle_finished(&f.scheduler, &job_id).await;

        // 没有轮询过，提交时也要先同步已退出的任务
        let again = f.scheduler.submit(request("boom"), JobOptions::default()).await;
        assert_eq!(again.status, SubmitState::Submitted);
        assert!(!again.deduplicated);
        assert_eq!(
            f.scheduler.poll(&job_id).await.unwrap().failure_kind,
            Some(FailureKind::Internal)
        );
    }
}
