use crate::error::ServiceError;
use crate::jobs::JobOptions;
use crate::service::{ClearScope, VideoService};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error};

use super::MAX_BODY_SIZE;

pub type ApiResponse = Response<Full<Bytes>>;

#[derive(Deserialize)]
struct GenerateBody {
    #[serde(default)]
    hadith: Option<Value>,
    #[serde(flatten)]
    options: JobOptions,
}

#[derive(Deserialize)]
struct ClearCacheBody {
    #[serde(default = "default_scope")]
    cache_type: String,
}

fn default_scope() -> String {
    "all".to_string()
}

pub async fn handle_request(
    req: Request<Incoming>,
    service: Arc<VideoService>,
    semaphore: Arc<Semaphore>,
) -> Result<ApiResponse, Infallible> {
    let _permit = match admit(&semaphore).await {
        Ok(permit) => permit,
        Err(rejected) => return Ok(rejected),
    };

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            ))
        }
    };

    debug!(method = %parts.method, path = parts.uri.path(), "api request");
    Ok(route(&parts.method, parts.uri.path(), &body, &service).await)
}

// 服务器停止时会关闭信号量，排队中的请求直接返回 503
async fn admit(semaphore: &Semaphore) -> Result<SemaphorePermit<'_>, ApiResponse> {
    semaphore
        .acquire()
        .await
        .map_err(|_| error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down"))
}

/// 路由表，与具体的连接处理分开以便直接测试
pub async fn route(method: &Method, path: &str, body: &[u8], service: &VideoService) -> ApiResponse {
    if let Some(job_id) = path.strip_prefix("/api/job_status/") {
        return match *method {
            Method::GET => job_status(job_id, service).await,
            _ => method_not_allowed(),
        };
    }
    if let Some(job_id) = path.strip_prefix("/api/cancel_job/") {
        return match *method {
            Method::POST => cancel_job(job_id, service).await,
            _ => method_not_allowed(),
        };
    }

    match (method, path) {
        (&Method::POST, "/api/generate_async") => generate(body, service).await,
        (&Method::GET, "/api/cache_status") => cache_status(service).await,
        (&Method::POST, "/api/clear_cache") => clear_cache(body, service).await,
        (&Method::GET, "/api/health_check") => health_check(service).await,
        (_, "/api/generate_async" | "/api/cache_status" | "/api/clear_cache" | "/api/health_check") => {
            method_not_allowed()
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn generate(body: &[u8], service: &VideoService) -> ApiResponse {
    let parsed: GenerateBody = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}")),
    };
    let Some(hadith) = parsed.hadith else {
        return error_response(StatusCode::BAD_REQUEST, "hadith payload is missing");
    };

    match service.submit_job(hadith, parsed.options).await {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(value) => json_response(StatusCode::OK, with_success(value)),
            Err(e) => internal_error(e),
        },
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

async fn job_status(job_id: &str, service: &VideoService) -> ApiResponse {
    match service.get_job_status(job_id).await {
        Ok(snapshot) => json_response(StatusCode::OK, json!({ "success": true, "status": snapshot })),
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

async fn cancel_job(job_id: &str, service: &VideoService) -> ApiResponse {
    if service.cancel_job(job_id).await {
        json_response(StatusCode::OK, json!({ "success": true, "message": "job cancelled" }))
    } else {
        json_response(
            StatusCode::OK,
            json!({ "success": false, "error": "job not found or can no longer be cancelled" }),
        )
    }
}

async fn cache_status(service: &VideoService) -> ApiResponse {
    let stats = service.get_cache_stats().await;
    json_response(StatusCode::OK, json!({ "success": true, "status": stats }))
}

async fn clear_cache(body: &[u8], service: &VideoService) -> ApiResponse {
    // 空请求体等同于清空全部
    let scope = if body.iter().all(u8::is_ascii_whitespace) {
        default_scope()
    } else {
        match serde_json::from_slice::<ClearCacheBody>(body) {
            Ok(parsed) => parsed.cache_type,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}")),
        }
    };

    match scope.parse::<ClearScope>() {
        Ok(scope) => {
            service.clear_cache(scope).await;
            json_response(
                StatusCode::OK,
                json!({ "success": true, "message": format!("{scope:?} cache cleared").to_lowercase() }),
            )
        }
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

async fn health_check(service: &VideoService) -> ApiResponse {
    json_response(
        StatusCode::OK,
        json!({
            "success": true,
            "health": {
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339(),
                "active_jobs": service.active_jobs().await,
            }
        }),
    )
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidRequest(_) | ServiceError::UnknownScope(_) => StatusCode::BAD_REQUEST,
    }
}

fn with_success(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("success".to_string(), Value::Bool(true));
    }
    value
}

fn json_response(status: StatusCode, body: Value) -> ApiResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> ApiResponse {
    json_response(status, json!({ "success": false, "error": message }))
}

fn method_not_allowed() -> ApiResponse {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn internal_error(e: impl std::fmt::Display) -> ApiResponse {
    error!(error = %e, "failed to encode response");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
