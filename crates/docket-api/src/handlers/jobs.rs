//! Job submission, status, listing and cancellation.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use docket_core::{
    JobFilter, JobStatus, JobStatusView, JobType, QueueStats, ResourceRequirements, SubmitJob,
    Submission,
};

use crate::error::ApiResult;
use crate::identity::Caller;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitJobBody {
    pub job_type: JobType,
    pub document_ref: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub parameters: Option<JsonValue>,
    /// Return an equivalent pending job instead of queueing a new one.
    #[serde(default)]
    pub dedupe: bool,
}

/// 202 for a new job, 200 when an existing one was returned.
pub async fn submit_job(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<SubmitJobBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let Json(body) = body?;
    let submission = state
        .scheduler
        .submit(SubmitJob {
            tenant_id: caller.tenant_id,
            actor_id: caller.actor_id,
            role: caller.role,
            job_type: body.job_type,
            document_ref: body.document_ref,
            priority: body.priority,
            resources: body.resources,
            parameters: body.parameters,
            dedupe: body.dedupe,
        })
        .await?;
    let status = if submission.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(submission)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    caller: Caller,
    params: Result<Query<ListJobsParams>, QueryRejection>,
) -> ApiResult<Json<JsonValue>> {
    let Query(params) = params?;
    state.admit(&caller, "jobs.list").await?;
    let filter = JobFilter {
        status: params.status,
        job_type: params.job_type,
        include_archived: params.include_archived,
    };
    let jobs = state
        .scheduler
        .list(&caller.tenant_id, &filter, params.limit, params.offset)
        .await?;
    Ok(Json(json!({ "jobs": jobs })))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    /// Queue-wide figures; administrators only.
    #[serde(default)]
    pub all: bool,
}

pub async fn queue_stats(
    State(state): State<AppState>,
    caller: Caller,
    params: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<QueueStats>> {
    let Query(params) = params?;
    state.admit(&caller, "jobs.stats").await?;
    let scope = if params.all {
        caller.require_admin()?;
        None
    } else {
        Some(caller.tenant_id.as_str())
    };
    Ok(Json(state.scheduler.stats(scope).await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<JobStatusView>> {
    let Path(job_id) = id?;
    state.admit(&caller, "jobs.status").await?;
    Ok(Json(state.scheduler.status(&caller.tenant_id, job_id).await?))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<JsonValue>> {
    let Path(job_id) = id?;
    state.admit(&caller, "jobs.cancel").await?;
    let (outcome, job) = state
        .scheduler
        .cancel(&caller.tenant_id, job_id, &caller.actor_id)
        .await?;
    Ok(Json(json!({
        "outcome": outcome,
        "job": JobStatusView::from(&job),
    })))
}
