//! HTTP health and admin endpoint.
//!
//! - `GET /health`: liveness plus queue counts, always open
//! - `GET /jobs/types`: registered job types
//! - `POST /jobs/{type}`: enqueue a job
//! - `GET /jobs/{id}`: read a job back with its log
//!
//! When an admin token is configured, the `/jobs` routes require it in
//! `x-worker-token` or as an `Authorization: Bearer` header.

use crate::core::Jobsmith;
use crate::error::{WorkerError, WorkerResult};
use crate::job::{JobOptions, JobRecord};
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    jobsmith: Arc<Jobsmith>,
}

/// An error response: a status code and a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<WorkerError> for ApiError {
    fn from(error: WorkerError) -> Self {
        match error {
            WorkerError::InvalidJob { message } => Self::new(StatusCode::BAD_REQUEST, message),
            WorkerError::JobNotFound { .. } => Self::new(StatusCode::NOT_FOUND, "Job not found"),
            other => {
                tracing::error!("Request failed: {}", other);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

/// Body of `POST /jobs/{type}`; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    payload: Option<Map<String, Value>>,
    schedule: Option<ScheduleRequest>,
    options: Option<OptionsRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    delay_ms: Option<u64>,
    run_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionsRequest {
    attempts: Option<u32>,
    backoff_ms: Option<u64>,
    priority: Option<u32>,
}

impl JobRequest {
    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let request: Self = serde_json::from_slice(body).map_err(|e| ApiError {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": "Invalid request", "details": e.to_string() }),
        })?;

        if let Some(options) = &request.options {
            if options.attempts == Some(0) || options.backoff_ms == Some(0) {
                return Err(ApiError {
                    status: StatusCode::BAD_REQUEST,
                    body: json!({
                        "error": "Invalid request",
                        "details": "attempts and backoffMs must be positive",
                    }),
                });
            }
        }
        Ok(request)
    }

    /// Delay before first eligibility; `delayMs` wins over `runAt`.
    fn delay_ms(&self, now: DateTime<Utc>) -> Result<Option<u64>, ApiError> {
        let Some(schedule) = &self.schedule else {
            return Ok(None);
        };
        if let Some(delay_ms) = schedule.delay_ms {
            return Ok(Some(delay_ms));
        }
        let Some(run_at) = &schedule.run_at else {
            return Ok(None);
        };

        let run_at = DateTime::parse_from_rfc3339(run_at)
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid schedule.runAt"))?;
        let delay = (run_at.with_timezone(&Utc) - now).num_milliseconds().max(0);
        Ok(Some(delay as u64))
    }
}

/// Build the router.
pub fn router(jobsmith: Arc<Jobsmith>) -> Router {
    let state = AppState { jobsmith };

    let jobs = Router::new()
        .route("/jobs/types", get(job_types))
        .route("/jobs/{key}", get(get_job).post(enqueue_job))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(jobs)
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn serve<F>(jobsmith: Arc<Jobsmith>, shutdown: F) -> WorkerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = jobsmith.config().server.bind_addr();
    let listener = TcpListener::bind(addr.as_str()).await?;
    tracing::info!(%addr, "HTTP endpoint listening");

    axum::serve(listener, router(jobsmith))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get("x-worker-token").and_then(|v| v.to_str().ok()) {
        return Some(token);
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Compare secrets without stopping at the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.jobsmith.config().server.admin_token {
        let presented = presented_token(request.headers()).unwrap_or_default();
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(ApiError::unauthorized());
        }
    }
    Ok(next.run(request).await)
}

async fn health(State(state): State<AppState>) -> Response {
    let jobsmith = &state.jobsmith;
    let queue = jobsmith.config().queue_name.clone();
    let workers = jobsmith.stats();

    let counts = match jobsmith.client().health_check().await {
        Ok(()) => jobsmith.counts().await,
        Err(e) => Err(e),
    };

    match counts {
        Ok(counts) => Json(json!({
            "status": "ok",
            "queue": queue,
            "counts": counts,
            "workers": workers,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "queue": queue,
                    "error": e.to_string(),
                    "workers": workers,
                })),
            )
                .into_response()
        }
    }
}

async fn job_types(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "types": state.jobsmith.registry().types() }))
}

async fn enqueue_job(
    State(state): State<AppState>,
    Path(job_type): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request = JobRequest::parse(&body)?;

    let registry = state.jobsmith.registry();
    if !registry.supports(&job_type) {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": "Unsupported job type", "supported": registry.types() }),
        });
    }

    let mut options = JobOptions {
        delay_ms: request.delay_ms(Utc::now())?,
        ..Default::default()
    };
    if let Some(requested) = &request.options {
        options.max_attempts = requested.attempts;
        options.backoff_delay_ms = requested.backoff_ms;
        options.priority = requested.priority;
    }

    let payload = Value::Object(request.payload.unwrap_or_default());
    let job_id = state.jobsmith.enqueue(&job_type, payload, options).await?;

    Ok(Json(json!({ "jobId": job_id, "queued": true })))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state
        .jobsmith
        .get_job(&job_id)
        .await?
        .ok_or(WorkerError::JobNotFound { job_id })?;
    Ok(Json(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsmithConfig;
    use crate::core::HandlerRegistry;
    use crate::job::JobStatus;
    use crate::queue::InMemoryQueue;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app_with_token(token: Option<&str>) -> (Arc<Jobsmith>, Router) {
        let mut config = JobsmithConfig::testing();
        config.server.admin_token = token.map(str::to_string);
        let jobsmith = Arc::new(
            Jobsmith::new(
                config,
                Arc::new(InMemoryQueue::new()),
                HandlerRegistry::standard(),
            )
            .unwrap(),
        );
        (jobsmith.clone(), router(jobsmith))
    }

    async fn json_body(res: Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (_, app) = app_with_token(Some("s3cret"));
        let res = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"], "jobs");
        assert_eq!(body["counts"]["waiting"], 0);
        assert_eq!(body["workers"]["activeSlots"], 0);
    }

    #[tokio::test]
    async fn test_types_lists_registered_handlers() {
        let (_, app) = app_with_token(None);
        let res = app.oneshot(get("/jobs/types")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(
            body["types"],
            json!(["email.send", "reminder.send", "ai.match", "integration.invoice"])
        );
    }

    #[tokio::test]
    async fn test_enqueue_then_read_back() {
        let (jobsmith, app) = app_with_token(None);
        let res = app
            .clone()
            .oneshot(post(
                "/jobs/email.send",
                r#"{"payload":{"to":"x@example.com"},"options":{"attempts":5,"backoffMs":100,"priority":3}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["queued"], true);
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let job = jobsmith.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff_delay_ms, 100);
        assert_eq!(job.priority, 3);

        let res = app.oneshot(get(&format!("/jobs/{job_id}"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["type"], "email.send");
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["payload"], json!({"to": "x@example.com"}));
    }

    #[tokio::test]
    async fn test_empty_body_uses_defaults() {
        let (jobsmith, app) = app_with_token(None);
        let res = app.oneshot(post("/jobs/ai.match", "")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let job_id = json_body(res).await["jobId"].as_str().unwrap().to_string();
        let job = jobsmith.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.payload, json!({}));
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_scheduled_job_is_delayed() {
        let (jobsmith, app) = app_with_token(None);
        let run_at = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        let body = json!({ "schedule": { "runAt": run_at } }).to_string();

        let res = app.oneshot(post("/jobs/reminder.send", &body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let counts = jobsmith.counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let (_, app) = app_with_token(None);

        let res = app
            .clone()
            .oneshot(post("/jobs/email.send", r#"{"payload":[1,2,3]}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "Invalid request");

        let res = app
            .clone()
            .oneshot(post("/jobs/email.send", r#"{"options":{"attempts":0}}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(post("/jobs/email.send", r#"{"options":{"priority":4000000}}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(post("/jobs/email.send", r#"{"schedule":{"runAt":"tomorrow"}}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "Invalid schedule.runAt");

        let res = app
            .oneshot(post("/jobs/unknown.kind", "{}"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = json_body(res).await;
        assert_eq!(body["error"], "Unsupported job type");
        assert_eq!(body["supported"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let (_, app) = app_with_token(None);
        let res = app.oneshot(get("/jobs/does-not-exist")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_token_is_enforced_on_jobs_routes() {
        let (_, app) = app_with_token(Some("s3cret"));

        let res = app
            .clone()
            .oneshot(post("/jobs/email.send", "{}"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(res).await["error"], "Unauthorized");

        let mut request = post("/jobs/email.send", "{}");
        request
            .headers_mut()
            .insert("x-worker-token", "s3cret".parse().unwrap());
        let res = app.clone().oneshot(request).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let mut request = get("/jobs/types");
        request
            .headers_mut()
            .insert("authorization", "Bearer s3cret".parse().unwrap());
        let res = app.clone().oneshot(request).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let mut request = get("/jobs/types");
        request
            .headers_mut()
            .insert("authorization", "Bearer wrong".parse().unwrap());
        let res = app.oneshot(request).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret!"));
        assert!(!constant_time_eq(b"", b"s3cret"));
        assert!(constant_time_eq(b"", b""));
    }
}
