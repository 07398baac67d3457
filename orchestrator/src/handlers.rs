use anyhow::anyhow;
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use panto_common::response;

use crate::advance::{self, CompletionUpdate, LAUNCH_SPACING};
use crate::db;
use crate::models::{
    CallbackEvent, CallbackResponse, CheckAllResponse, Dimensions, JobStatus, ResumeRequest,
    ResumeResponse, StatusQuery, StitchRequest, StitchResponse, SubmitRequest, SubmitResponse,
    TileStatus,
};
use crate::reconcile;
use crate::server::AppState;
use crate::status;
use crate::stitch;
use crate::submit::{self, SubmitError};

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// The principal comes from the request body's userId or the gateway's
/// X-Principal-Id header; authentication itself happens upstream.
fn principal_of(headers: &HeaderMap, body_user: Option<&str>) -> Option<String> {
    if let Some(user) = body_user
        && !user.trim().is_empty()
    {
        return Some(user.trim().to_string());
    }
    headers
        .get("x-principal-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Begin an upscale.
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Response {
    let Some(principal) = principal_of(&headers, req.user_id.as_deref()) else {
        return response::unauthorized(anyhow!("missing principal"));
    };

    let tracker = crate::metrics::LatencyTracker::new("submit");
    let result = submit::submit(&state, &principal, &req).await;
    tracker.finish();

    match result {
        Ok(outcome) => Json(SubmitResponse {
            success: true,
            job_id: outcome.job_id,
            estimated_time: outcome.estimated_time,
            estimated_cost: outcome.estimated_cost,
            total_stages: outcome.total_stages,
            total_tiles: outcome.total_tiles,
            original_dimensions: Dimensions {
                width: outcome.width,
                height: outcome.height,
            },
            target_scale: outcome.target_scale,
        })
        .into_response(),
        Err(e) => submit_error_response(e),
    }
}

fn submit_error_response(e: SubmitError) -> Response {
    match e {
        SubmitError::InvalidScale { ref valid } => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": e.to_string(),
                "validScales": valid,
            })),
        )
            .into_response(),
        SubmitError::ScaleTooLarge {
            ref max_safe,
            ref valid,
            ..
        } => {
            let message = match max_safe {
                Some(safe) => format!(
                    "reduce the target scale to {safe} or below, or resize the input image first"
                ),
                None => "resize the input image and retry with a supported scale".to_string(),
            };
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "success": false,
                    "error": e.to_string(),
                    "message": message,
                    "validScales": valid,
                })),
            )
                .into_response()
        }
        SubmitError::PlanCap { cap, .. } => response::err_resp_with_message(
            &e.to_string(),
            format!("your plan allows upscaling up to {cap}x"),
            StatusCode::FORBIDDEN,
        ),
        SubmitError::MissingImage | SubmitError::Unscalable | SubmitError::Decode(_) => {
            response::bad_request(e)
        }
        SubmitError::Internal(err) => response::internal_server_error(err),
    }
}

/// Provider-initiated completion webhook.
pub async fn callback(State(state): State<AppState>, Json(event): Json<CallbackEvent>) -> Response {
    let update = CompletionUpdate::from_callback(&event);
    let tracker = crate::metrics::LatencyTracker::new("callback");
    let result = advance::handle_completion(&state, &update).await;
    tracker.finish();
    match result {
        Ok(outcome) => {
            tracing::debug!(prediction_id = %event.id, ?outcome, "callback handled");
            Json(CallbackResponse {
                ok: true,
                received: event.id,
            })
            .into_response()
        }
        Err(e) => response::internal_server_error(e.context("failed to handle callback")),
    }
}

/// Progress snapshot.
pub async fn status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Response {
    let job = match db::get_job(&state.pool, query.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return response::not_found(anyhow!("job {} not found", query.job_id)),
        Err(e) => return response::internal_server_error(e),
    };

    let tiles = if job.using_tiling {
        match db::get_tiles(&state.pool, job.id).await {
            Ok(tiles) => tiles,
            Err(e) => return response::internal_server_error(e),
        }
    } else {
        Vec::new()
    };

    Json(status::build_status(&job, &tiles)).into_response()
}

/// Client-side-split continuation for a needs_split job.
pub async fn resume(State(state): State<AppState>, Json(req): Json<ResumeRequest>) -> Response {
    let job = match db::get_job(&state.pool, req.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return response::not_found(anyhow!("job {} not found", req.job_id)),
        Err(e) => return response::internal_server_error(e),
    };

    if req.tiles_data.is_empty() {
        return response::bad_request(anyhow!("tilesData must not be empty"));
    }
    if req.next_stage < 1 || req.next_stage > job.total_stages {
        return response::bad_request(anyhow!(
            "nextStage {} is outside this job's {} stages",
            req.next_stage,
            job.total_stages
        ));
    }
    if job.status != JobStatus::NeedsSplit {
        return response::conflict(anyhow!(
            "job {} is {}, not awaiting a split",
            job.id,
            job.status.as_str()
        ));
    }

    let rows: Vec<_> = req
        .tiles_data
        .iter()
        .map(|t| {
            (
                t.index,
                t.x,
                t.y,
                t.width,
                t.height,
                t.url.clone(),
                t.parent_tile,
            )
        })
        .collect();
    if let Err(e) = db::replace_tiles(&state.pool, job.id, &rows).await {
        return response::internal_server_error(e);
    }

    if let Err(e) = db::transition_job_status(
        &state.pool,
        job.id,
        JobStatus::NeedsSplit,
        JobStatus::Processing,
    )
    .await
    {
        return response::internal_server_error(e);
    }

    let next = req.next_stage;
    let mut launched = 0u32;
    let mut failed = 0u32;
    for row in &rows {
        let index = row.0;
        let ok = db::transition_tile(
            &state.pool,
            job.id,
            index,
            TileStatus::Pending,
            TileStatus::StageProcessing(next),
        )
        .await
        .unwrap_or(false);
        if !ok {
            failed += 1;
            continue;
        }
        match advance::launch_tile_stage(&state, &job, index, next, &row.5).await {
            Ok(_) => launched += 1,
            Err(e) => {
                tracing::error!(job_id = %job.id, tile_index = index, error = ?e,
                    "resume launch failed");
                db::mark_tile_failed(&state.pool, job.id, index, &format!("launch failed: {e}"))
                    .await
                    .ok();
                failed += 1;
            }
        }
        tokio::time::sleep(LAUNCH_SPACING).await;
    }

    Json(ResumeResponse {
        success: true,
        job_id: job.id,
        next_stage: next,
        tiles_launched: launched,
        tiles_failed: failed,
        total_tiles: rows.len() as u32,
    })
    .into_response()
}

/// Reconciler trigger: one sweep over every silent job.
pub async fn check_all(State(state): State<AppState>) -> Response {
    match reconcile::sweep(&state).await {
        Ok(results) => Json(CheckAllResponse {
            success: true,
            checked: results.len(),
            results,
        })
        .into_response(),
        Err(e) => response::internal_server_error(e),
    }
}

/// Manual stitch trigger.
pub async fn stitch(State(state): State<AppState>, Json(req): Json<StitchRequest>) -> Response {
    let job = match db::get_job(&state.pool, req.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return response::not_found(anyhow!("job {} not found", req.job_id)),
        Err(e) => return response::internal_server_error(e),
    };

    match job.status {
        JobStatus::TilesReady | JobStatus::Completed => {}
        JobStatus::Failed
            if job
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("timed out")) =>
        {
            return response::gateway_timeout(anyhow!(
                "job {} failed on a stage timeout",
                job.id
            ));
        }
        other => {
            return response::conflict(anyhow!(
                "job {} is {}, not ready to stitch",
                job.id,
                other.as_str()
            ));
        }
    }

    match stitch::finalize(&state, req.job_id).await {
        Ok(outcome) => Json(StitchResponse {
            success: true,
            job_id: outcome.job_id,
            final_url: outcome.final_url,
            dimensions: Dimensions {
                width: outcome.width,
                height: outcome.height,
            },
        })
        .into_response(),
        Err(e) => response::internal_server_error(e),
    }
}
