use crate::api::handle_request;
use crate::service::VideoService;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ApiServer {
    addr: SocketAddr,
    service: Arc<VideoService>,
    semaphore: Arc<Semaphore>,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, service: Arc<VideoService>, max_connections: usize) -> Self {
        Self {
            addr,
            service,
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// 运行直到 shutdown 被取消
    pub async fn run(&self, shutdown: CancellationToken) -> io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "video job server listening");
        info!(max_connections = self.semaphore.available_permits(), "request concurrency bound");

        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let service = self.service.clone();
            let semaphore = self.semaphore.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| handle_request(req, service.clone(), semaphore.clone()));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await
                {
                    debug!(%remote, error = %e, "connection closed with error");
                }
            });
        }

        // 还在等待许可的请求立即得到 503
        self.semaphore.close();
        info!("video job server stopped accepting connections");
        Ok(())
    }
}
