use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scheduler::{JobTable, SchedulerSettings};
use super::{JobOptions, Stage, VideoPipeline, VideoRequest};
use crate::cache::{MediaCache, ResultCache};
use crate::error::JobError;

/// 只由执行该任务的 worker 写入进度
pub(crate) struct ProgressReporter {
    table: JobTable,
    job_id: String,
    fingerprint: String,
}

impl ProgressReporter {
    pub(crate) fn new(table: JobTable, job_id: String, fingerprint: String) -> Self {
        Self {
            table,
            job_id,
            fingerprint,
        }
    }

    async fn advance(&self, progress: u8, message: &str) -> bool {
        let mut table = self.table.write().await;
        let updated = table
            .jobs
            .get_mut(&self.job_id)
            .is_some_and(|entry| entry.record.advance(progress, message));
        if updated {
            debug!(job_id = %self.job_id, progress, message, "job progress");
        }
        updated
    }

    async fn finish(&self, outcome: &Result<String, JobError>) {
        let mut table = self.table.write().await;
        if let Some(entry) = table.jobs.get_mut(&self.job_id) {
            let changed = match outcome {
                Ok(result) => entry.record.complete(result),
                Err(e) => entry.record.fail(e),
            };
            if !changed {
                debug!(job_id = %self.job_id, "job already terminal, outcome ignored");
            }
        }
        table.release_fingerprint(&self.fingerprint, &self.job_id);
    }
}

pub(crate) struct WorkerContext {
    pub job_id: String,
    pub fingerprint: String,
    pub request: VideoRequest,
    pub options: JobOptions,
    pub token: CancellationToken,
    pub reporter: ProgressReporter,
    pub pipeline: Arc<dyn VideoPipeline>,
    pub result_cache: Arc<ResultCache>,
    pub media_cache: Arc<MediaCache>,
    pub settings: Arc<SchedulerSettings>,
}

impl WorkerContext {
    // 取消只在阶段之间生效，已经发出的外部调用不会被打断
    fn checkpoint(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub(crate) async fn run_job(ctx: WorkerContext) -> Result<String, JobError> {
    let audio_path = ctx.settings.temp_dir.join(format!("audio_{}.mp3", ctx.job_id));
    info!(job_id = %ctx.job_id, text_chars = ctx.request.text().chars().count(), "video generation started");

    let outcome = match ctx.settings.job_timeout {
        Some(limit) => match tokio::time::timeout(limit, run_stages(&ctx, &audio_path)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::DeadlineExceeded(limit)),
        },
        None => run_stages(&ctx, &audio_path).await,
    };

    // 无论成败都清理中间文件
    remove_temp_file(&audio_path).await;

    match &outcome {
        Ok(result) => info!(job_id = %ctx.job_id, result = %result, "video generation completed"),
        Err(JobError::Cancelled) => info!(job_id = %ctx.job_id, "video generation stopped after cancellation"),
        Err(e) => error!(job_id = %ctx.job_id, error = %e, "video generation failed"),
    }
    ctx.reporter.finish(&outcome).await;
    outcome
}

async fn run_stages(ctx: &WorkerContext, audio_path: &Path) -> Result<String, JobError> {
    let pipeline = &ctx.pipeline;

    ctx.checkpoint()?;
    ctx.reporter.advance(10, "generating audio").await;
    let audio = pipeline
        .synthesize_audio(&ctx.request, audio_path)
        .await
        .map_err(|e| JobError::from_pipeline(Stage::Audio, e))?;
    ctx.reporter.advance(30, "audio ready").await;

    ctx.checkpoint()?;
    ctx.reporter.advance(40, "fetching background media").await;
    let media = acquire_media(ctx).await?;
    ctx.reporter.advance(60, "background media ready").await;

    ctx.checkpoint()?;
    ctx.reporter.advance(70, "composing video").await;
    let output_name = output_file_name(&ctx.job_id);
    let output_path = ctx.settings.output_dir.join(&output_name);
    let produced = pipeline
        .compose_video(&ctx.request, &media, &audio, &output_path)
        .await
        .map_err(|e| JobError::from_pipeline(Stage::Composition, e))?;

    let result = produced
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(output_name);

    if ctx.settings.cache_enabled && !ctx.result_cache.set(&ctx.fingerprint, &result, None).await {
        warn!(job_id = %ctx.job_id, "result not cached, identical requests will regenerate");
    }
    Ok(result)
}

async fn acquire_media(ctx: &WorkerContext) -> Result<PathBuf, JobError> {
    let query = ctx
        .options
        .video_type
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .unwrap_or(&ctx.settings.default_media_query);

    if let Some(path) = ctx.media_cache.lookup(query).await {
        info!(job_id = %ctx.job_id, query, "using cached background media");
        return Ok(path);
    }

    let path = ctx
        .pipeline
        .acquire_background_media(query)
        .await
        .map_err(|e| JobError::from_pipeline(Stage::Media, e))?;
    if !ctx.media_cache.store(query, &path).await {
        warn!(job_id = %ctx.job_id, query, "proceeding without cached background media");
    }
    Ok(path)
}

fn output_file_name(job_id: &str) -> String {
    let suffix = &job_id[job_id.len().saturating_sub(8)..];
    format!("hadith_video_{}_{}.mp4", Utc::now().format("%Y%m%d_%H%M%S"), suffix)
}

async fn remove_temp_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "temporary file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "failed to remove temporary file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_uses_job_suffix() {
        let name = output_file_name("job_1700000000_4242_17");
        assert!(name.starts_with("hadith_video_"));
        assert!(name.ends_with("4242_17.mp4"), "{name}");
    }

    #[test]
    fn output_name_handles_short_ids() {
        assert!(output_file_name("j1").ends_with("_j1.mp4"));
    }
}
