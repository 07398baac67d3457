//! Stitcher: composite a tiles_ready job's outputs into the final image.

use std::io::Cursor;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use image::{Rgba, RgbaImage};
use uuid::Uuid;

use crate::db;
use crate::metrics;
use crate::models::{JobStatus, Tile};
use crate::server::AppState;

#[derive(Debug, Clone)]
pub struct StitchOutcome {
    pub job_id: Uuid,
    pub final_url: String,
    pub width: u32,
    pub height: u32,
}

/// Pick the output to composite for a tile: the final stage's URL, or the
/// newest earlier stage's output when the final one is missing. A
/// resolution gap beats a hole.
fn composite_source(tile: &Tile, total_stages: u32) -> Option<&str> {
    tile.best_output_up_to(total_stages)
}

/// Download, decode and composite every tile, then publish the result and
/// complete the job.
pub async fn finalize(state: &AppState, job_id: Uuid) -> Result<StitchOutcome> {
    let job = db::get_job(&state.pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    let scale = job.effective_scale;
    let out_width = job.original_width * scale;
    let out_height = job.original_height * scale;

    match job.status {
        JobStatus::TilesReady => {}
        JobStatus::Completed => {
            // Another stitcher finished first; hand back its result.
            let final_url = job
                .final_output_url
                .context("completed job without a final URL")?;
            return Ok(StitchOutcome {
                job_id,
                final_url,
                width: out_width,
                height: out_height,
            });
        }
        other => bail!("job {} is {}, not ready to stitch", job_id, other.as_str()),
    }

    let tiles = db::get_tiles(&state.pool, job_id).await?;

    // Row-major download pass. Per-tile failures leave a hole and are
    // logged; only a fully empty canvas fails the job.
    let mut downloaded: Vec<(u32, u32, Bytes)> = Vec::with_capacity(tiles.len());
    let mut skipped = 0u64;
    for tile in &tiles {
        if tile.status.is_failed() {
            skipped += 1;
            continue;
        }
        let Some(url) = composite_source(tile, job.total_stages) else {
            tracing::warn!(%job_id, tile_index = tile.index, "tile has no output at any stage");
            skipped += 1;
            continue;
        };
        match state.blob.fetch(url).await {
            Ok(bytes) => downloaded.push((tile.x * scale, tile.y * scale, bytes)),
            Err(e) => {
                tracing::warn!(%job_id, tile_index = tile.index, error = ?e, "tile download failed, skipping");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        metrics::stitch_tiles_skipped(skipped);
    }

    if downloaded.is_empty() {
        db::fail_job(&state.pool, job_id, "no tile outputs could be composited").await?;
        metrics::stitch_finished("failed");
        metrics::job_finished("failed");
        bail!("job {} had no compositable tiles", job_id);
    }

    // Decode, composite and encode on the blocking pool; this is pure CPU
    // work over a potentially multi-gigabyte canvas.
    let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut canvas = RgbaImage::from_pixel(out_width, out_height, Rgba([255, 255, 255, 255]));
        let mut composited = 0usize;
        for (x, y, bytes) in &downloaded {
            match image::load_from_memory(bytes) {
                Ok(img) => {
                    // Overlapped regions resolve last-writer-wins; the
                    // overlap is wide enough that seams are not visible.
                    image::imageops::replace(&mut canvas, &img.to_rgba8(), *x as i64, *y as i64);
                    composited += 1;
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "tile decode failed, skipping");
                }
            }
        }
        if composited == 0 {
            bail!("every downloaded tile failed to decode");
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(canvas)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .context("failed to encode final image")?;
        Ok(buf)
    })
    .await
    .context("stitch task panicked")?;

    let png = match png {
        Ok(p) => p,
        Err(e) => {
            db::fail_job(&state.pool, job_id, &format!("stitch failed: {e}")).await?;
            metrics::stitch_finished("failed");
            metrics::job_finished("failed");
            return Err(e);
        }
    };

    let final_url = state
        .blob
        .put_permanent(job_id, "final.png", Bytes::from(png), "image/png")
        .await
        .context("failed to upload final image")?;

    if db::complete_job(&state.pool, job_id, JobStatus::TilesReady, &final_url).await? {
        metrics::stitch_finished("completed");
        metrics::job_finished("completed");
        tracing::info!(%job_id, %final_url, out_width, out_height, "job stitched and completed");
        return Ok(StitchOutcome {
            job_id,
            final_url,
            width: out_width,
            height: out_height,
        });
    }

    // Lost the completion race; report whatever the winner installed.
    let job = db::get_job(&state.pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} vanished during stitch"))?;
    let final_url = job
        .final_output_url
        .unwrap_or(final_url);
    Ok(StitchOutcome {
        job_id,
        final_url,
        width: out_width,
        height: out_height,
    })
}
