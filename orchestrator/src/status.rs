//! Status reader: derive a read-only progress view from job and tile rows.

use crate::models::{Job, JobStatus, StageView, StatusResponse, Tile, TileView};
use crate::submit::{SECS_PER_STAGE, SECS_PER_TILE_STAGE};

/// Percent complete, derived purely from the rows.
///
/// Tiled jobs with one or two stages credit each stage by the fraction of
/// tiles at or past it; longer chains credit whole stages uniformly plus
/// the current stage's tile fraction. Non-tiled jobs get half a stage of
/// credit for the stage in flight.
pub fn compute_progress(job: &Job, tiles: &[Tile]) -> f64 {
    if matches!(job.status, JobStatus::Completed) {
        return 100.0;
    }
    let n = job.total_stages.max(1);
    let per_stage = 100.0 / n as f64;

    let progress = if job.using_tiling {
        let total = tiles.len().max(1) as f64;
        if n <= 2 {
            (1..=n)
                .map(|k| {
                    let done = tiles
                        .iter()
                        .filter(|t| t.status.at_or_beyond_complete(k))
                        .count() as f64;
                    done / total * per_stage
                })
                .sum()
        } else {
            let current = job.current_stage.clamp(1, n);
            let done = tiles
                .iter()
                .filter(|t| t.status.at_or_beyond_complete(current))
                .count() as f64;
            (current - 1) as f64 * per_stage + done / total * per_stage
        }
    } else {
        let completed = job.current_stage.saturating_sub(1).min(n) as f64;
        let in_flight = if job.status == JobStatus::Processing {
            per_stage / 2.0
        } else {
            0.0
        };
        completed * per_stage + in_flight
    };

    progress.clamp(0.0, 100.0)
}

/// Estimated seconds until the job finishes, from fixed per-unit costs.
pub fn estimate_remaining_secs(job: &Job, tiles: &[Tile]) -> i64 {
    if job.status.is_terminal() {
        return 0;
    }
    let n = job.total_stages.max(1);
    if job.using_tiling {
        let total_units = (tiles.len() as i64) * n as i64;
        let done_units: i64 = (1..=n)
            .map(|k| {
                tiles
                    .iter()
                    .filter(|t| t.status.at_or_beyond_complete(k))
                    .count() as i64
            })
            .sum();
        (total_units - done_units).max(0) * SECS_PER_TILE_STAGE
    } else {
        let remaining = n as i64 - job.current_stage.saturating_sub(1) as i64;
        remaining.max(0) * SECS_PER_STAGE
    }
}

/// Assemble the full status payload. The raw tile list rides along only
/// when the job is tiles_ready, so an external client may stitch for
/// itself.
pub fn build_status(job: &Job, tiles: &[Tile]) -> StatusResponse {
    let progress = compute_progress(job, tiles);
    let estimated_time_remaining = estimate_remaining_secs(job, tiles);

    let stages = job
        .stages
        .iter()
        .map(|s| StageView {
            stage: s.stage,
            scale: s.scale,
            model: s.model.clone(),
        })
        .collect();

    let tiles_ready = job.status == JobStatus::TilesReady;
    let tiles_data = tiles_ready.then(|| {
        tiles
            .iter()
            .map(|t| TileView {
                index: t.index,
                x: t.x,
                y: t.y,
                width: t.width,
                height: t.height,
                status: t.status.encode(),
                output_url: t
                    .best_output_up_to(job.total_stages)
                    .map(str::to_string),
            })
            .collect()
    });

    StatusResponse {
        success: true,
        job_id: job.id,
        status: job.status.as_str().to_string(),
        progress,
        current_stage: job.current_stage,
        total_stages: job.total_stages,
        current_output_url: job.current_output_url.clone(),
        final_output_url: job.final_output_url.clone(),
        error_message: job.error_message.clone(),
        estimated_time_remaining,
        using_tiling: job.using_tiling,
        tiling_info: job.grid,
        stages,
        tiles_data,
        tile_grid: tiles_ready.then_some(job.grid).flatten(),
        target_scale: tiles_ready.then_some(job.effective_scale),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TileStatus, TileStageSlot};
    use panto_plan::{Category, ChainStage};
    use uuid::Uuid;

    fn job(using_tiling: bool, total_stages: u32, current: u32, status: JobStatus) -> Job {
        let stages = (1..=total_stages)
            .map(|k| ChainStage {
                stage: k,
                scale: 4,
                model: "nightmareai/real-esrgan".into(),
                version: "v".into(),
                base_input: serde_json::json!({}),
            })
            .collect();
        Job {
            id: Uuid::nil(),
            principal: "user".into(),
            input_url: "in".into(),
            original_width: 1000,
            original_height: 1000,
            category: Category::Photo,
            requested_scale: 16,
            effective_scale: 16,
            stages,
            templates: Vec::new(),
            grid: None,
            using_tiling,
            current_stage: current,
            total_stages,
            prediction_id: None,
            status,
            retry_count: 0,
            last_callback_at: None,
            error_message: None,
            current_output_url: None,
            final_output_url: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn tile(index: u32, status: TileStatus) -> Tile {
        Tile {
            job_id: Uuid::nil(),
            index,
            x: 0,
            y: 0,
            width: 100,
            height: 100,
            input_url: "in".into(),
            status,
            error_message: None,
            parent_tile: None,
            slots: vec![TileStageSlot {
                stage: 1,
                prediction_id: Some("p".into()),
                output_url: Some("out.png".into()),
                launched_at: None,
            }],
        }
    }

    #[test]
    fn completed_jobs_report_exactly_100() {
        let j = job(true, 2, 2, JobStatus::Completed);
        assert_eq!(compute_progress(&j, &[]), 100.0);
    }

    #[test]
    fn tiled_single_stage_tracks_tile_fraction() {
        let j = job(true, 1, 1, JobStatus::Processing);
        let tiles = vec![
            tile(0, TileStatus::StageComplete(1)),
            tile(1, TileStatus::StageComplete(1)),
            tile(2, TileStatus::StageProcessing(1)),
            tile(3, TileStatus::Pending),
        ];
        assert!((compute_progress(&j, &tiles) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn tiled_two_stage_closes_half_at_stage_boundary() {
        let j = job(true, 2, 1, JobStatus::Processing);
        let tiles = vec![
            tile(0, TileStatus::StageComplete(1)),
            tile(1, TileStatus::StageComplete(1)),
        ];
        assert!((compute_progress(&j, &tiles) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn tiles_past_later_stages_count_for_earlier_ones() {
        let j = job(true, 2, 2, JobStatus::Processing);
        let tiles = vec![
            tile(0, TileStatus::StageComplete(2)),
            tile(1, TileStatus::StageProcessing(2)),
        ];
        // stage 1: both past; stage 2: one of two
        assert!((compute_progress(&j, &tiles) - 75.0).abs() < 1e-9);
    }

    #[test]
    fn non_tiled_gets_half_stage_credit_while_in_flight() {
        let j = job(false, 2, 1, JobStatus::Processing);
        assert!((compute_progress(&j, &[]) - 25.0).abs() < 1e-9);

        let j2 = job(false, 2, 2, JobStatus::Processing);
        assert!((compute_progress(&j2, &[]) - 75.0).abs() < 1e-9);
    }

    #[test]
    fn failed_tiles_never_count_as_progress() {
        let j = job(true, 1, 1, JobStatus::Processing);
        let tiles = vec![
            tile(0, TileStatus::Failed),
            tile(1, TileStatus::StageComplete(1)),
        ];
        assert!((compute_progress(&j, &tiles) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn eta_counts_remaining_tile_stage_units() {
        let j = job(true, 2, 1, JobStatus::Processing);
        let tiles = vec![
            tile(0, TileStatus::StageComplete(1)),
            tile(1, TileStatus::StageProcessing(1)),
        ];
        // 4 units total, 1 done
        assert_eq!(estimate_remaining_secs(&j, &tiles), 3 * SECS_PER_TILE_STAGE);
    }

    #[test]
    fn eta_is_zero_once_terminal() {
        let j = job(false, 2, 2, JobStatus::Completed);
        assert_eq!(estimate_remaining_secs(&j, &[]), 0);
    }

    #[test]
    fn tiles_data_only_rides_along_when_tiles_ready() {
        let processing = job(true, 2, 2, JobStatus::Processing);
        let ready = job(true, 2, 2, JobStatus::TilesReady);
        let tiles = vec![tile(0, TileStatus::StageComplete(2))];

        assert!(build_status(&processing, &tiles).tiles_data.is_none());
        let view = build_status(&ready, &tiles);
        assert!(view.tiles_data.is_some());
        assert_eq!(view.target_scale, Some(16));
    }
}
