//! Submission pipeline: validate, plan, persist, and launch stage 1.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use image::DynamicImage;
use rayon::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use panto_common::now_ms;
use panto_plan::{
    Category, MAX_SCALE, TileRect, VALID_SCALES, apply_dimension_guard, build_plan,
    max_safe_scale, plan_cap,
};

use crate::advance::{self, LAUNCH_SPACING};
use crate::db;
use crate::metrics;
use crate::models::{Job, JobStatus, SubmitRequest, TileStatus};
use crate::server::AppState;

/// Rough wall-clock cost of one tile-stage prediction, for ETA reporting.
pub const SECS_PER_TILE_STAGE: i64 = 3;

/// Rough wall-clock cost of one whole-image stage.
pub const SECS_PER_STAGE: i64 = 5;

/// Provider charge per prediction, used for the upfront cost estimate.
const COST_PER_PREDICTION: f64 = 0.0023;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("missing image payload")]
    MissingImage,

    #[error("scale must be one of the supported integer values")]
    InvalidScale { valid: Vec<u32> },

    #[error("scale {requested} exceeds the supported maximum of {max}")]
    ScaleTooLarge {
        requested: i64,
        max: u32,
        /// Largest target that would work for this image, when one exists.
        max_safe: Option<u32>,
        valid: Vec<u32>,
    },

    #[error("scale {requested} exceeds the plan limit of {cap}")]
    PlanCap { requested: u32, cap: u32 },

    #[error("image cannot be upscaled: even 2x would exceed the output dimension limit")]
    Unscalable,

    #[error("could not decode input image: {0}")]
    Decode(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    pub estimated_time: i64,
    pub estimated_cost: f64,
    pub total_stages: u32,
    pub total_tiles: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub target_scale: u32,
}

/// Create a job from a submission and launch its first stage.
pub async fn submit(
    state: &AppState,
    principal: &str,
    req: &SubmitRequest,
) -> Result<SubmitOutcome, SubmitError> {
    if req.image_base64.trim().is_empty() {
        metrics::job_rejected("missing_image");
        return Err(SubmitError::MissingImage);
    }

    if !req.scale.is_finite() || req.scale.fract() != 0.0 || req.scale < 1.0 {
        metrics::job_rejected("invalid_scale");
        return Err(SubmitError::InvalidScale {
            valid: VALID_SCALES.to_vec(),
        });
    }
    let scale = req.scale as i64;

    let bytes = BASE64
        .decode(req.image_base64.trim())
        .map_err(|e| SubmitError::Decode(format!("invalid base64: {e}")))?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| SubmitError::Decode(format!("unsupported image: {e}")))?;
    let (width, height) = (img.width(), img.height());

    if scale > MAX_SCALE as i64 {
        metrics::job_rejected("scale_too_large");
        return Err(SubmitError::ScaleTooLarge {
            requested: scale,
            max: MAX_SCALE,
            max_safe: max_safe_scale(width, height),
            valid: VALID_SCALES.to_vec(),
        });
    }
    let requested = u32::try_from(scale)
        .ok()
        .filter(|s| VALID_SCALES.contains(s))
        .ok_or_else(|| {
            metrics::job_rejected("invalid_scale");
            SubmitError::InvalidScale {
                valid: VALID_SCALES.to_vec(),
            }
        })?;

    let cap = plan_cap(&req.plan);
    if requested > cap {
        metrics::job_rejected("plan_cap");
        return Err(SubmitError::PlanCap { requested, cap });
    }

    let effective =
        apply_dimension_guard(width, height, requested, cap).ok_or(SubmitError::Unscalable)?;
    if effective != requested {
        tracing::info!(
            requested,
            effective,
            width,
            height,
            "dimension guard reduced the target scale"
        );
    }

    let category = Category::parse(req.quality.as_deref().unwrap_or("photo"));
    let plan = build_plan(
        width,
        height,
        category,
        effective,
        req.selected_model.as_deref(),
    )
    .map_err(|e| SubmitError::Internal(anyhow!(e).context("planning failed")))?;

    let job_id = Uuid::new_v4();
    let input_name = input_blob_name(&bytes);
    let input_url = state
        .blob
        .put_staging(
            job_id,
            &input_name.0,
            Bytes::from(bytes),
            input_name.1,
        )
        .await
        .context("failed to store input image")?;

    let now = now_ms();
    let total_stages = plan.stages.len() as u32;
    let job = Job {
        id: job_id,
        principal: principal.to_string(),
        input_url: input_url.clone(),
        original_width: width,
        original_height: height,
        category,
        requested_scale: requested,
        effective_scale: effective,
        stages: plan.stages.clone(),
        templates: plan.templates.clone(),
        grid: plan.grid,
        using_tiling: plan.using_tiling,
        current_stage: 1,
        total_stages,
        prediction_id: None,
        status: JobStatus::Processing,
        retry_count: 0,
        last_callback_at: None,
        error_message: None,
        current_output_url: None,
        final_output_url: None,
        created_at: now,
        updated_at: now,
    };
    db::insert_job(&state.pool, &job)
        .await
        .context("failed to persist job")?;

    let total_tiles = if plan.using_tiling {
        let count = plan.tiles.len() as u32;
        launch_tiled(state, &job, img, &plan.tiles).await?;
        Some(count)
    } else {
        launch_whole(state, &job).await?;
        None
    };

    metrics::job_submitted(category.as_str(), effective);
    tracing::info!(
        %job_id,
        category = category.as_str(),
        scale = effective,
        stages = total_stages,
        tiles = total_tiles.unwrap_or(0),
        "job submitted"
    );

    let calls = total_tiles.unwrap_or(1) as i64 * total_stages as i64;
    let estimated_time = if plan.using_tiling {
        calls * SECS_PER_TILE_STAGE
    } else {
        total_stages as i64 * SECS_PER_STAGE
    };
    Ok(SubmitOutcome {
        job_id,
        estimated_time,
        estimated_cost: (calls as f64 * COST_PER_PREDICTION * 10_000.0).round() / 10_000.0,
        total_stages,
        total_tiles,
        width,
        height,
        target_scale: effective,
    })
}

fn input_blob_name(bytes: &[u8]) -> (String, &'static str) {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => ("input.jpg".to_string(), "image/jpeg"),
        Ok(image::ImageFormat::WebP) => ("input.webp".to_string(), "image/webp"),
        _ => ("input.png".to_string(), "image/png"),
    }
}

/// Crop and PNG-encode every tile. CPU-bound, so the crops run on the
/// blocking pool with rayon fanning the encoding out across cores.
async fn encode_tiles(img: DynamicImage, rects: Vec<TileRect>) -> Result<Vec<(u32, Vec<u8>)>> {
    let img = Arc::new(img);
    tokio::task::spawn_blocking(move || {
        rects
            .par_iter()
            .map(|rect| {
                let crop = img.crop_imm(rect.x, rect.y, rect.width, rect.height);
                let mut buf = Vec::new();
                crop.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
                    .with_context(|| format!("failed to encode tile {}", rect.index))?;
                Ok((rect.index, buf))
            })
            .collect::<Result<Vec<_>>>()
    })
    .await
    .context("tile encoding task panicked")?
}

/// Split the input, persist every tile crop, and launch stage 1 per tile.
/// Launches are staggered to respect the provider's burst limit; any tile
/// that cannot be launched fails the whole job with a summary.
async fn launch_tiled(
    state: &AppState,
    job: &Job,
    img: DynamicImage,
    rects: &[TileRect],
) -> Result<(), SubmitError> {
    let encoded = encode_tiles(img, rects.to_vec()).await?;

    let mut tile_rows = Vec::with_capacity(rects.len());
    for (rect, (index, bytes)) in rects.iter().zip(encoded) {
        debug_assert_eq!(rect.index, index);
        let url = state
            .blob
            .put_staging(
                job.id,
                &format!("tiles/{index}.png"),
                Bytes::from(bytes),
                "image/png",
            )
            .await
            .with_context(|| format!("failed to store tile {index}"))?;
        tile_rows.push((rect.index, rect.x, rect.y, rect.width, rect.height, url));
    }
    db::insert_tiles(&state.pool, job.id, &tile_rows)
        .await
        .context("failed to persist tiles")?;

    let mut launch_failures = 0u32;
    for (index, _, _, _, _, url) in &tile_rows {
        db::transition_tile(
            &state.pool,
            job.id,
            *index,
            TileStatus::Pending,
            TileStatus::StageProcessing(1),
        )
        .await
        .context("failed to claim tile for launch")?;

        if let Err(e) = advance::launch_tile_stage(state, job, *index, 1, url).await {
            tracing::error!(job_id = %job.id, tile_index = index, error = ?e, "stage-1 launch failed");
            db::mark_tile_failed(&state.pool, job.id, *index, &format!("launch failed: {e}"))
                .await
                .ok();
            launch_failures += 1;
        }
        tokio::time::sleep(LAUNCH_SPACING).await;
    }

    if launch_failures > 0 {
        let summary = format!(
            "{launch_failures} of {} tiles failed to launch",
            tile_rows.len()
        );
        db::fail_job(&state.pool, job.id, &summary).await.ok();
        metrics::job_finished("failed");
        return Err(SubmitError::Internal(anyhow!(summary)));
    }
    Ok(())
}

/// Launch the single whole-image prediction for an untiled job.
async fn launch_whole(state: &AppState, job: &Job) -> Result<(), SubmitError> {
    match advance::launch_single_stage(state, job, 1, &job.input_url).await {
        Ok(prediction_id) => {
            db::set_job_prediction(&state.pool, job.id, &prediction_id, 1)
                .await
                .context("failed to record prediction")?;
            Ok(())
        }
        Err(e) => {
            let summary = format!("stage-1 launch failed: {e}");
            db::fail_job(&state.pool, job.id, &summary).await.ok();
            metrics::job_finished("failed");
            Err(SubmitError::Internal(anyhow!(summary)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_name_follows_magic_bytes() {
        let png = [0x89u8, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(input_blob_name(&png), ("input.png".to_string(), "image/png"));

        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xE0];
        assert_eq!(input_blob_name(&jpeg), ("input.jpg".to_string(), "image/jpeg"));

        // unknown bytes default to png
        assert_eq!(input_blob_name(&[0u8; 8]).0, "input.png");
    }
}
