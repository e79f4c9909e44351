use std::sync::Arc;
use tracing::{error, info};
use video_job_server::api::ApiServer;
use video_job_server::config::Config;
use video_job_server::jobs::CommandPipeline;
use video_job_server::service::{spawn_maintenance, VideoService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("video_job_server=info".parse()?),
        )
        .init();

    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        max_parallel_jobs = config.max_parallel_jobs,
        cache_enabled = config.cache_enabled,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "starting video job server"
    );

    let pipeline = Arc::new(CommandPipeline::from_config(&config));
    let service = Arc::new(VideoService::new(&config, pipeline).await?);
    let maintenance = spawn_maintenance(service.clone(), config.maintenance_interval);

    let shutdown = service.shutdown_token();
    {
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
            service.shutdown().await;
        });
    }

    let server = ApiServer::new(config.listen_addr, service.clone(), config.max_connections);
    server.run(shutdown).await?;

    if let Err(e) = maintenance.await {
        error!(error = %e, "maintenance task panicked");
    }
    Ok(())
}
