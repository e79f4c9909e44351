use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::VideoRequest;
use crate::cache::hash_key;
use crate::config::Config;
use crate::error::PipelineError;

/// 外部协作方：语音合成、背景素材获取、最终合成。
/// 实现可以阻塞很久，调度器只负责限制并发数。
#[async_trait]
pub trait VideoPipeline: Send + Sync {
    async fn synthesize_audio(&self, request: &VideoRequest, output_path: &Path) -> Result<PathBuf, PipelineError>;

    async fn acquire_background_media(&self, query: &str) -> Result<PathBuf, PipelineError>;

    async fn compose_video(
        &self,
        request: &VideoRequest,
        media_path: &Path,
        audio_path: &Path,
        output_path: &Path,
    ) -> Result<PathBuf, PipelineError>;
}

const OOM_MARKERS: [&str; 4] = ["out of memory", "memoryerror", "cannot allocate memory", "std::bad_alloc"];

/// 通过配置的外部程序完成各阶段。请求 JSON 写入 stdin，路径作为参数追加在命令之后。
pub struct CommandPipeline {
    tts_command: Option<String>,
    media_command: Option<String>,
    compose_command: Option<String>,
    temp_dir: PathBuf,
    download_seq: AtomicU64,
}

impl CommandPipeline {
    pub fn new(
        tts_command: Option<String>,
        media_command: Option<String>,
        compose_command: Option<String>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tts_command,
            media_command,
            compose_command,
            temp_dir: temp_dir.into(),
            download_seq: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.tts_command.clone(),
            config.media_command.clone(),
            config.compose_command.clone(),
            config.temp_dir.clone(),
        )
    }
}

#[async_trait]
impl VideoPipeline for CommandPipeline {
    async fn synthesize_audio(&self, request: &VideoRequest, output_path: &Path) -> Result<PathBuf, PipelineError> {
        let command = require(&self.tts_command, "TTS_COMMAND")?;
        let stdin = serde_json::to_vec(request.payload()).map_err(|e| PipelineError::Provider(e.to_string()))?;
        run_command(command, &[output_path.as_os_str()], Some(stdin)).await?;
        expect_output(output_path).await
    }

    async fn acquire_background_media(&self, query: &str) -> Result<PathBuf, PipelineError> {
        let command = require(&self.media_command, "MEDIA_COMMAND")?;
        // 并发任务可能用同一个查询词，下载目标必须各不相同
        let seq = self.download_seq.fetch_add(1, Ordering::Relaxed);
        let dest = self
            .temp_dir
            .join(format!("background_{}_{}_{seq}.mp4", &hash_key(query)[..12], std::process::id()));
        run_command(command, &[std::ffi::OsStr::new(query), dest.as_os_str()], None).await?;
        expect_output(&dest).await
    }

    async fn compose_video(
        &self,
        request: &VideoRequest,
        media_path: &Path,
        audio_path: &Path,
        output_path: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let command = require(&self.compose_command, "COMPOSE_COMMAND")?;
        let stdin = serde_json::to_vec(request.payload()).map_err(|e| PipelineError::Provider(e.to_string()))?;
        run_command(
            command,
            &[media_path.as_os_str(), audio_path.as_os_str(), output_path.as_os_str()],
            Some(stdin),
        )
        .await?;
        expect_output(output_path).await
    }
}

fn require<'a>(command: &'a Option<String>, setting: &str) -> Result<&'a str, PipelineError> {
    command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| PipelineError::Provider(format!("{setting} is not configured")))
}

async fn run_command(
    command: &str,
    extra_args: &[&std::ffi::OsStr],
    stdin: Option<Vec<u8>>,
) -> Result<(), PipelineError> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| PipelineError::Provider("empty command".into()))?;

    let mut child = Command::new(program)
        .args(parts)
        .args(extra_args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::Provider(format!("failed to start {program}: {e}")))?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(&data)
            .await
            .map_err(|e| PipelineError::Provider(format!("failed to write to {program}: {e}")))?;
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| PipelineError::Provider(format!("failed to wait for {program}: {e}")))?;
    debug!(program, status = %output.status, "collaborator finished");

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify_failure(program, &output.status.to_string(), &stderr))
}

fn classify_failure(program: &str, status: &str, stderr: &str) -> PipelineError {
    let lowered = stderr.to_lowercase();
    let message = if stderr.is_empty() {
        format!("{program} exited with {status}")
    } else {
        format!("{program} exited with {status}: {stderr}")
    };
    if OOM_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        PipelineError::ResourceExhausted(message)
    } else {
        PipelineError::Provider(message)
    }
}

async fn expect_output(path: &Path) -> Result<PathBuf, PipelineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(path.to_path_buf()),
        _ => Err(PipelineError::Provider(format!(
            "collaborator reported success but produced no file at {}",
            path.display()
        ))),
    }
}
