//! Reconciler: timer-driven repair for jobs whose callbacks went silent.
//!
//! The webhook path is primary; this loop polls the provider for stale
//! jobs and feeds terminal results through the same advance routines, so
//! a lost callback only ever costs latency, not correctness. It never
//! deletes data and never contradicts a recorded terminal state.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use panto_common::now_ms;

use crate::advance::{self, CompletionUpdate};
use crate::db;
use crate::metrics;
use crate::models::{Job, JobCheckResult, JobStatus, TileStatus};
use crate::server::AppState;
use crate::stitch;
use panto_provider::PredictionStatus;

/// A job is considered stale when no callback has arrived for this long.
pub const SILENCE_THRESHOLD: Duration = Duration::from_secs(10);

/// A stage that has been in flight longer than this is declared failed.
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(240);

/// Run the reconciler until cancelled.
pub async fn run_loop(state: AppState, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "reconciler started");
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("reconciler stopped");
                break;
            }
            _ = tick.tick() => {}
        }
        match sweep(&state).await {
            Ok(results) => {
                let repaired = results.iter().filter(|r| r.action != "none").count();
                if repaired > 0 {
                    tracing::info!(checked = results.len(), repaired, "reconciler sweep");
                }
            }
            Err(e) => tracing::warn!(error = ?e, "reconciler sweep failed"),
        }
    }
}

/// One full pass over every silent job. Also what POST /check-all runs.
pub async fn sweep(state: &AppState) -> Result<Vec<JobCheckResult>> {
    let cutoff = now_ms() - SILENCE_THRESHOLD.as_millis() as i64;
    let mut results = Vec::new();

    for job in db::list_stale_processing(&state.pool, cutoff).await? {
        let job_id = job.id;
        match reconcile_job(state, &job).await {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::warn!(%job_id, error = ?e, "failed to reconcile job");
                results.push(JobCheckResult {
                    job_id,
                    action: "error".to_string(),
                    detail: Some(format!("{e:#}")),
                });
            }
        }
    }

    // Stitch pickup: a crash between the tiles_ready transition and the
    // stitch leaves the job parked. Only touch jobs that have been sitting
    // for a full silence window so an in-flight stitch isn't raced.
    for job in db::list_tiles_ready(&state.pool).await? {
        if job.updated_at >= cutoff {
            continue;
        }
        let job_id = job.id;
        metrics::reconciler_repair("stitch_pickup");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = stitch::finalize(&state, job_id).await {
                tracing::error!(%job_id, error = ?e, "stitch pickup failed");
            }
        });
        results.push(JobCheckResult {
            job_id,
            action: "stitch_pickup".to_string(),
            detail: None,
        });
    }

    Ok(results)
}

async fn reconcile_job(state: &AppState, job: &Job) -> Result<JobCheckResult> {
    if job.using_tiling {
        reconcile_tiled(state, job).await
    } else {
        reconcile_single(state, job).await
    }
}

async fn reconcile_tiled(state: &AppState, job: &Job) -> Result<JobCheckResult> {
    let tiles = db::get_tiles(&state.pool, job.id).await?;
    let non_failed: Vec<_> = tiles.iter().filter(|t| !t.status.is_failed()).collect();

    // Stuck-completion recovery: every tile finished but the final
    // callback's tiles_ready transition was lost.
    if !non_failed.is_empty()
        && non_failed
            .iter()
            .all(|t| t.status.at_or_beyond_complete(job.total_stages))
    {
        if db::transition_job_status(
            &state.pool,
            job.id,
            JobStatus::Processing,
            JobStatus::TilesReady,
        )
        .await?
        {
            metrics::reconciler_repair("stuck_completion");
            tracing::info!(job_id = %job.id, "recovered stuck completion, job is tiles_ready");
            let state = state.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(e) = stitch::finalize(&state, job_id).await {
                    tracing::error!(%job_id, error = ?e, "stitch after recovery failed");
                }
            });
        }
        return Ok(JobCheckResult {
            job_id: job.id,
            action: "stuck_completion".to_string(),
            detail: None,
        });
    }

    // Poll every in-flight tile prediction and apply terminal results
    // directly to the rows; the advance routine keeps the invariants.
    let now = now_ms();
    let mut polled = 0u32;
    let mut timed_out = 0u32;
    let mut relaunched = 0u32;
    for tile in &tiles {
        let TileStatus::StageProcessing(stage) = tile.status else {
            continue;
        };
        let slot = tile.slot(stage);

        let Some(prediction_id) = slot.and_then(|s| s.prediction_id.clone()) else {
            // Claimed but never launched: the process died between the
            // conditional transition and the submit. Relaunch in place.
            let input = if stage == 1 {
                Some(tile.input_url.clone())
            } else {
                tile.slot(stage - 1).and_then(|s| s.output_url.clone())
            };
            match input {
                Some(input) => {
                    if let Err(e) =
                        advance::launch_tile_stage(state, job, tile.index, stage, &input).await
                    {
                        tracing::warn!(job_id = %job.id, tile_index = tile.index, error = ?e,
                            "launch-gap relaunch failed");
                    } else {
                        metrics::reconciler_repair("launch_gap");
                        relaunched += 1;
                    }
                }
                None => {
                    db::mark_tile_failed(
                        &state.pool,
                        job.id,
                        tile.index,
                        "no input available for relaunch",
                    )
                    .await?;
                }
            }
            tokio::time::sleep(advance::LAUNCH_SPACING).await;
            continue;
        };

        match state.provider.get(&prediction_id).await {
            Ok(prediction) if prediction.status.is_terminal() => {
                let update = CompletionUpdate::from_prediction(&prediction);
                // Record the handling, then apply directly; replaying over
                // already-applied rows is a no-op.
                db::insert_processed_callback(&state.pool, &prediction_id, job.id).await?;
                advance::apply_tile_result(state, job.id, tile.index, stage, &update).await?;
                db::touch_last_callback(&state.pool, job.id).await?;
                metrics::reconciler_repair("polled_completion");
                polled += 1;
            }
            Ok(_) => {
                let launched = slot.and_then(|s| s.launched_at).unwrap_or(job.created_at);
                if now - launched > STAGE_TIMEOUT.as_millis() as i64 {
                    let update = CompletionUpdate {
                        prediction_id: prediction_id.clone(),
                        status: PredictionStatus::Failed,
                        output_url: None,
                        error: Some(format!(
                            "stage {stage} timed out after {}s",
                            STAGE_TIMEOUT.as_secs()
                        )),
                    };
                    db::insert_processed_callback(&state.pool, &prediction_id, job.id).await?;
                    advance::apply_tile_result(state, job.id, tile.index, stage, &update).await?;
                    metrics::reconciler_repair("stage_timeout");
                    timed_out += 1;
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, tile_index = tile.index, error = ?e,
                    "provider poll failed");
            }
        }
    }

    // Gate repair, one stage per run: if a closed stage's fan-out was lost,
    // the earliest completed stage among surviving tiles is where to look.
    let repair_stage = non_failed
        .iter()
        .filter_map(|t| match t.status {
            TileStatus::StageComplete(k) => Some(k),
            _ => None,
        })
        .min();
    if let Some(stage) = repair_stage {
        advance::check_stage_close(state, job.id, stage).await?;
    }

    let action = if polled + timed_out + relaunched > 0 {
        "repaired"
    } else {
        "none"
    };
    Ok(JobCheckResult {
        job_id: job.id,
        action: action.to_string(),
        detail: Some(format!(
            "polled={polled} timed_out={timed_out} relaunched={relaunched}"
        )),
    })
}

async fn reconcile_single(state: &AppState, job: &Job) -> Result<JobCheckResult> {
    let Some(prediction_id) = job.prediction_id.clone() else {
        // The job row exists but stage 1 never launched; finish submission's
        // work in place.
        match advance::launch_single_stage(state, job, job.current_stage, &job.input_url).await {
            Ok(prediction_id) => {
                db::set_job_prediction(&state.pool, job.id, &prediction_id, job.current_stage)
                    .await?;
                metrics::reconciler_repair("launch_gap");
                return Ok(JobCheckResult {
                    job_id: job.id,
                    action: "relaunched".to_string(),
                    detail: None,
                });
            }
            Err(e) => {
                db::fail_job(&state.pool, job.id, &format!("relaunch failed: {e}")).await?;
                return Ok(JobCheckResult {
                    job_id: job.id,
                    action: "failed".to_string(),
                    detail: Some(format!("{e:#}")),
                });
            }
        }
    };

    match state.provider.get(&prediction_id).await {
        Ok(prediction) if prediction.status.is_terminal() => {
            // Relay through the standard completion path so retry policy
            // and partial-success handling run exactly as for a webhook.
            let update = CompletionUpdate::from_prediction(&prediction);
            let outcome = advance::handle_completion(state, &update).await?;
            metrics::reconciler_repair("polled_completion");
            Ok(JobCheckResult {
                job_id: job.id,
                action: "polled".to_string(),
                detail: Some(format!("{outcome:?}")),
            })
        }
        Ok(_) => {
            if now_ms() - job.updated_at > STAGE_TIMEOUT.as_millis() as i64 {
                let update = CompletionUpdate {
                    prediction_id,
                    status: PredictionStatus::Failed,
                    output_url: None,
                    error: Some(format!(
                        "stage {} timed out after {}s",
                        job.current_stage,
                        STAGE_TIMEOUT.as_secs()
                    )),
                };
                advance::handle_completion(state, &update).await?;
                metrics::reconciler_repair("stage_timeout");
                return Ok(JobCheckResult {
                    job_id: job.id,
                    action: "timed_out".to_string(),
                    detail: None,
                });
            }
            Ok(JobCheckResult {
                job_id: job.id,
                action: "none".to_string(),
                detail: None,
            })
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = ?e, "provider poll failed");
            Ok(JobCheckResult {
                job_id: job.id,
                action: "none".to_string(),
                detail: Some(format!("poll failed: {e}")),
            })
        }
    }
}
