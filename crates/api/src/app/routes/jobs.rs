use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use contentflow_infra::LifecycleError;
use contentflow_jobs::{JobRecord, NewJob};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/stats", get(get_stats))
        .route("/:id", get(get_job))
        .route("/:id/start", post(start_job))
        .route("/:id/progress", post(update_progress))
        .route("/:id/complete", post(complete_job))
        .route("/:id/fail", post(fail_job))
        .route("/:id/retry", post(retry_job))
        .route("/:id/permanently-fail", post(permanently_fail_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/resume", post(resume_job))
        .route("/:id/stale", post(mark_stale))
}

/// Unwraps a parse result or returns its error response.
macro_rules! try_parse {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(resp) => return resp,
        }
    };
}

fn job_response(
    services: &AppServices,
    status: StatusCode,
    job: JobRecord,
) -> axum::response::Response {
    let now = services.jobs.now();
    (status, Json(dto::JobResponse::new(job, now))).into_response()
}

fn record_result(
    services: &AppServices,
    result: Result<JobRecord, LifecycleError>,
) -> axum::response::Response {
    match result {
        Ok(job) => job_response(services, StatusCode::OK, job),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let job_type = try_parse!(dto::parse_job_type(&body.job_type));
    let source_id = try_parse!(dto::parse_source_id(&body.source_id));

    let mut new_job = NewJob::new(job_type, source_id);
    if let Some(metadata) = body.metadata {
        new_job = new_job.with_metadata(metadata);
    }
    if let Some(max_retries) = body.max_retries {
        new_job = new_job.with_max_retries(max_retries);
    }

    match services.jobs.create_job(new_job).await {
        Ok(job) => job_response(&services, StatusCode::CREATED, job),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = try_parse!(query.into_filter());

    match services.jobs.list_jobs(&filter).await {
        Ok(jobs) => {
            let now = services.jobs.now();
            let jobs: Vec<_> = jobs
                .into_iter()
                .map(|job| dto::JobResponse::new(job, now))
                .collect();
            (StatusCode::OK, Json(jobs)).into_response()
        }
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn get_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.jobs.get_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let result = services.jobs.get_job(id).await;
    record_result(&services, result)
}

pub async fn start_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let result = services.jobs.start_processing(id).await;
    record_result(&services, result)
}

pub async fn update_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::ProgressRequest>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let result = services
        .jobs
        .update_progress(id, body.progress, body.message, body.metadata)
        .await;
    record_result(&services, result)
}

pub async fn complete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::CompleteRequest>>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let (output, metrics) = body.map(|Json(b)| b).unwrap_or_default().into_parts();
    let result = services.jobs.complete_job(id, output, metrics).await;
    record_result(&services, result)
}

pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::FailRequest>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let error = body.into_error(services.jobs.now());
    let result = services.jobs.fail_job(id, error).await;
    record_result(&services, result)
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    match services.jobs.retry_job(id).await {
        Ok(scheduled) => {
            let now = services.jobs.now();
            (StatusCode::OK, Json(dto::RetryResponse::new(scheduled, now))).into_response()
        }
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn permanently_fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let result = services.jobs.permanently_fail_job(id).await;
    record_result(&services, result)
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::CancelRequest>>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let reason = body.and_then(|Json(b)| b.reason);
    let result = services.jobs.cancel_job(id, reason).await;
    record_result(&services, result)
}

pub async fn resume_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::ResumeRequest>>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let force = body.is_some_and(|Json(b)| b.force);
    let result = services.jobs.resume_job(id, force).await;
    record_result(&services, result)
}

pub async fn mark_stale(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = try_parse!(dto::parse_job_id(&id));
    let result = services.jobs.mark_stale(id).await;
    record_result(&services, result)
}
