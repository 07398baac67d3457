//! Completion handling: the single routine both the webhook path and the
//! reconciler converge through, so there is only one state machine to
//! reason about.
//!
//! All coordination happens through conditional row updates; a handler that
//! loses a transition simply stops. The processed-callback record is the
//! at-most-once gate for webhook deliveries; the reconciler applies polled
//! results directly to the rows, which is idempotent by construction.

use std::time::Duration;

use anyhow::{Context, Result};
use panto_provider::{Prediction, PredictionStatus, is_memory_error};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::metrics;
use crate::models::{CallbackEvent, Job, JobStatus, TileStatus};
use crate::server::AppState;
use crate::stitch;

/// Minimum spacing between prediction launches, to stay under the
/// provider's burst limit.
pub const LAUNCH_SPACING: Duration = Duration::from_millis(200);

/// Transient provider failures on non-tiled jobs are retried this many
/// times before the job gives up.
pub const NON_TILED_RETRY_LIMIT: u32 = 3;

/// A terminal prediction result, normalized from either a webhook body or a
/// provider poll.
#[derive(Debug, Clone)]
pub struct CompletionUpdate {
    pub prediction_id: String,
    pub status: PredictionStatus,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

impl CompletionUpdate {
    pub fn from_callback(event: &CallbackEvent) -> Self {
        Self {
            prediction_id: event.id.clone(),
            status: event.status,
            output_url: event
                .output
                .as_ref()
                .and_then(|o| o.first_url())
                .map(str::to_string),
            error: event.error.clone(),
        }
    }

    pub fn from_prediction(prediction: &Prediction) -> Self {
        Self {
            prediction_id: prediction.id.clone(),
            status: prediction.status,
            output_url: prediction
                .output
                .as_ref()
                .and_then(|o| o.first_url())
                .map(str::to_string),
            error: prediction.error.clone(),
        }
    }
}

/// What a completion event amounted to, for logs and the check-all report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    Duplicate,
    Orphaned,
    Ignored,
}

/// Handle one completion event end to end. Idempotent: the same event
/// applied twice leaves the stored state unchanged.
pub async fn handle_completion(
    state: &AppState,
    update: &CompletionUpdate,
) -> Result<CompletionOutcome> {
    if !update.status.is_terminal() {
        return Ok(CompletionOutcome::Ignored);
    }

    // Locate the owner before recording: the record row carries the job id.
    if let Some((job_id, tile_index, stage)) =
        db::find_tile_stage_by_prediction(&state.pool, &update.prediction_id).await?
    {
        if !db::insert_processed_callback(&state.pool, &update.prediction_id, job_id).await? {
            metrics::callback_duplicate();
            return Ok(CompletionOutcome::Duplicate);
        }
        db::touch_last_callback(&state.pool, job_id).await?;
        apply_tile_result(state, job_id, tile_index, stage, update).await?;
        metrics::callback_applied();
        return Ok(CompletionOutcome::Applied);
    }

    if let Some(job) = db::get_job_by_prediction(&state.pool, &update.prediction_id).await? {
        if !db::insert_processed_callback(&state.pool, &update.prediction_id, job.id).await? {
            metrics::callback_duplicate();
            return Ok(CompletionOutcome::Duplicate);
        }
        db::touch_last_callback(&state.pool, job.id).await?;
        apply_single_result(state, &job, update).await?;
        metrics::callback_applied();
        return Ok(CompletionOutcome::Applied);
    }

    tracing::warn!(
        prediction_id = %update.prediction_id,
        "completion event for unknown prediction"
    );
    metrics::callback_orphaned();
    Ok(CompletionOutcome::Orphaned)
}

/// Apply a terminal result to a tile row. Called by the webhook path after
/// the dedup gate and by the reconciler directly; every write is either an
/// idempotent upsert or a conditional transition, so replays are no-ops.
pub async fn apply_tile_result(
    state: &AppState,
    job_id: Uuid,
    tile_index: u32,
    stage: u32,
    update: &CompletionUpdate,
) -> Result<()> {
    match update.status {
        PredictionStatus::Succeeded => {
            let Some(output) = update.output_url.as_deref() else {
                tracing::error!(
                    %job_id, tile_index, stage,
                    "prediction succeeded without an output URL"
                );
                fail_tile(state, job_id, tile_index, "prediction returned no output").await?;
                return Ok(());
            };
            db::set_tile_stage_output(&state.pool, job_id, tile_index, stage, output).await?;
            db::transition_tile(
                &state.pool,
                job_id,
                tile_index,
                TileStatus::StageProcessing(stage),
                TileStatus::StageComplete(stage),
            )
            .await?;
            tracing::info!(%job_id, tile_index, stage, "tile stage complete");
            check_stage_close(state, job_id, stage).await?;
        }
        PredictionStatus::Failed | PredictionStatus::Canceled => {
            let error = update.error.as_deref().unwrap_or("prediction failed");
            fail_tile(state, job_id, tile_index, error).await?;
            // A failed tile stops counting toward the stage gate, which may
            // close the stage for the surviving tiles.
            check_stage_close(state, job_id, stage).await?;
        }
        _ => {}
    }
    Ok(())
}

async fn fail_tile(state: &AppState, job_id: Uuid, tile_index: u32, error: &str) -> Result<()> {
    if db::mark_tile_failed(&state.pool, job_id, tile_index, error).await? {
        metrics::tile_failed();
        tracing::warn!(%job_id, tile_index, error, "tile failed");
    }

    let tiles = db::get_tiles(&state.pool, job_id).await?;
    let failed = tiles.iter().filter(|t| t.status.is_failed()).count();
    if failed * 2 > tiles.len() && !tiles.is_empty() {
        let summary = format!("{} of {} tiles failed", failed, tiles.len());
        if db::fail_job(&state.pool, job_id, &summary).await? {
            metrics::job_finished("failed");
            tracing::error!(%job_id, %summary, "job failed");
        }
    }
    Ok(())
}

/// If every non-failed tile of the job has completed stage `stage`, either
/// fan out the next stage or, at the final stage, move the job to
/// tiles_ready and kick off the stitcher.
pub async fn check_stage_close(state: &AppState, job_id: Uuid, stage: u32) -> Result<()> {
    // Refetch: the gate must be evaluated against the freshest rows.
    let Some(job) = db::get_job(&state.pool, job_id).await? else {
        return Ok(());
    };
    if job.status != JobStatus::Processing || !job.using_tiling {
        return Ok(());
    }

    let tiles = db::get_tiles(&state.pool, job_id).await?;
    let non_failed: Vec<_> = tiles.iter().filter(|t| !t.status.is_failed()).collect();
    if non_failed.is_empty() {
        if db::fail_job(&state.pool, job_id, "all tiles failed").await? {
            metrics::job_finished("failed");
        }
        return Ok(());
    }
    if !non_failed.iter().all(|t| t.status.at_or_beyond_complete(stage)) {
        return Ok(());
    }

    if stage < job.total_stages {
        let next = stage + 1;
        // Cursor bump is advisory; losing it just means another handler got
        // here first and the launch loop below finds nothing to claim.
        db::advance_job_stage(&state.pool, job_id, stage).await?;
        tracing::info!(%job_id, stage = next, "stage closed, launching next stage");

        for tile in &non_failed {
            if tile.status != TileStatus::StageComplete(stage) {
                continue;
            }
            // The conditional transition is the claim: whoever wins the row
            // performs the launch.
            if !db::transition_tile(
                &state.pool,
                job_id,
                tile.index,
                TileStatus::StageComplete(stage),
                TileStatus::StageProcessing(next),
            )
            .await?
            {
                continue;
            }
            let Some(input) = tile.slot(stage).and_then(|s| s.output_url.clone()) else {
                fail_tile(state, job_id, tile.index, "missing stage output for launch").await?;
                continue;
            };
            if let Err(e) = launch_tile_stage(state, &job, tile.index, next, &input).await {
                tracing::error!(%job_id, tile_index = tile.index, error = ?e, "next-stage launch failed");
                fail_tile(state, job_id, tile.index, &format!("launch failed: {e}")).await?;
            }
            tokio::time::sleep(LAUNCH_SPACING).await;
        }
    } else if db::transition_job_status(
        &state.pool,
        job_id,
        JobStatus::Processing,
        JobStatus::TilesReady,
    )
    .await?
    {
        // Zero rows would mean another callback already moved the job;
        // winning the update makes finalization ours to start.
        tracing::info!(%job_id, "all tiles complete, job is tiles_ready");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = stitch::finalize(&state, job_id).await {
                tracing::error!(%job_id, error = ?e, "stitch after tiles_ready failed");
            }
        });
    }

    Ok(())
}

/// Submit one tile-stage prediction and record it on the slot.
pub async fn launch_tile_stage(
    state: &AppState,
    job: &Job,
    tile_index: u32,
    stage: u32,
    input_url: &str,
) -> Result<String> {
    let chain_stage = job
        .stage(stage)
        .with_context(|| format!("job {} has no stage {}", job.id, stage))?;

    let mut input = chain_stage.base_input.clone();
    input["image"] = json!(input_url);

    let prediction = state
        .provider
        .submit(
            &chain_stage.model,
            &chain_stage.version,
            input,
            &state.webhook_url,
        )
        .await
        .with_context(|| format!("submit stage {stage} for tile {tile_index}"))?;

    db::set_tile_stage_prediction(&state.pool, job.id, tile_index, stage, &prediction.id).await?;
    metrics::prediction_launched(&chain_stage.model, stage);
    Ok(prediction.id)
}

/// Terminal result for a non-tiled job's current prediction.
async fn apply_single_result(state: &AppState, job: &Job, update: &CompletionUpdate) -> Result<()> {
    let stage = job.current_stage;

    match update.status {
        PredictionStatus::Succeeded => {
            let Some(output) = update.output_url.as_deref() else {
                return fail_or_partial(state, job, "prediction returned no output").await;
            };

            if stage >= job.total_stages {
                // Provider CDN URLs expire; the final output gets its own copy.
                let final_url = state.blob.promote(job.id, "final.png", output).await?;
                if db::complete_job(&state.pool, job.id, JobStatus::Processing, &final_url).await? {
                    metrics::job_finished("completed");
                    tracing::info!(job_id = %job.id, %final_url, "job completed");
                }
                return Ok(());
            }

            db::set_job_current_output(&state.pool, job.id, output).await?;
            let next = stage + 1;
            match launch_single_stage(state, job, next, output).await {
                Ok(prediction_id) => {
                    db::set_job_prediction(&state.pool, job.id, &prediction_id, next).await?;
                    tracing::info!(job_id = %job.id, stage = next, "launched next stage");
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = ?e, "next-stage launch failed");
                    return fail_or_partial(state, job, &format!("launch failed: {e}")).await;
                }
            }
        }
        PredictionStatus::Failed | PredictionStatus::Canceled => {
            let error = update.error.as_deref().unwrap_or("prediction failed");

            if is_memory_error(error) {
                // The same call cannot succeed at this input size.
                tracing::warn!(job_id = %job.id, stage, "provider ran out of GPU memory");
                return fail_or_partial(state, job, error).await;
            }

            let retries = db::increment_retry(&state.pool, job.id).await?;
            if retries <= NON_TILED_RETRY_LIMIT {
                let input = if stage <= 1 {
                    job.input_url.clone()
                } else {
                    job.current_output_url
                        .clone()
                        .unwrap_or_else(|| job.input_url.clone())
                };
                match launch_single_stage(state, job, stage, &input).await {
                    Ok(prediction_id) => {
                        db::set_job_prediction(&state.pool, job.id, &prediction_id, stage).await?;
                        tracing::info!(job_id = %job.id, stage, retries, "retrying stage");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = ?e, "retry launch failed");
                    }
                }
            }
            return fail_or_partial(state, job, error).await;
        }
        _ => {}
    }
    Ok(())
}

/// Submit one whole-image prediction for a non-tiled job's stage.
pub async fn launch_single_stage(
    state: &AppState,
    job: &Job,
    stage: u32,
    input_url: &str,
) -> Result<String> {
    let chain_stage = job
        .stage(stage)
        .with_context(|| format!("job {} has no stage {}", job.id, stage))?;

    let mut input = chain_stage.base_input.clone();
    input["image"] = json!(input_url);

    let prediction = state
        .provider
        .submit(
            &chain_stage.model,
            &chain_stage.version,
            input,
            &state.webhook_url,
        )
        .await
        .with_context(|| format!("submit stage {stage}"))?;

    metrics::prediction_launched(&chain_stage.model, stage);
    Ok(prediction.id)
}

/// Exhausted or unretryable failure on a non-tiled job: end in partial
/// success when an earlier stage left a usable output, failed otherwise.
async fn fail_or_partial(state: &AppState, job: &Job, error: &str) -> Result<()> {
    if job.current_stage > 1
        && let Some(intermediate) = job.current_output_url.as_deref()
    {
        let message = format!(
            "completed {}/{} stages: {}",
            job.current_stage - 1,
            job.total_stages,
            error
        );
        if db::partial_success_job(&state.pool, job.id, intermediate, &message).await? {
            metrics::job_finished("partial_success");
            tracing::warn!(job_id = %job.id, %message, "job ended in partial success");
        }
        return Ok(());
    }

    if db::fail_job(&state.pool, job.id, error).await? {
        metrics::job_finished("failed");
        tracing::error!(job_id = %job.id, error, "job failed");
    }
    Ok(())
}
