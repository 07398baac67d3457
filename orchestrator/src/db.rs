use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use panto_plan::Category;
use tokio_postgres::Row;
use uuid::Uuid;

use panto_common::now_ms;

use crate::models::{Job, JobStatus, Tile, TileStageSlot, TileStatus};

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                principal TEXT NOT NULL,
                input_url TEXT NOT NULL,
                original_width INT NOT NULL,
                original_height INT NOT NULL,
                category TEXT NOT NULL,
                requested_scale INT NOT NULL,
                effective_scale INT NOT NULL,
                chain JSONB NOT NULL,
                templates JSONB NOT NULL,
                tile_grid JSONB,
                using_tiling BOOL NOT NULL,
                current_stage INT NOT NULL DEFAULT 1,
                total_stages INT NOT NULL,
                prediction_id TEXT,
                status TEXT NOT NULL,
                retry_count INT NOT NULL DEFAULT 0,
                last_callback_at BIGINT,
                error_message TEXT,
                current_output_url TEXT,
                final_output_url TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create jobs table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)
            "#,
            &[],
        )
        .await
        .context("failed to create jobs status index")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_prediction ON jobs (prediction_id)
            "#,
            &[],
        )
        .await
        .context("failed to create jobs prediction index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS tiles (
                job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                tile_index INT NOT NULL,
                x INT NOT NULL,
                y INT NOT NULL,
                width INT NOT NULL,
                height INT NOT NULL,
                input_url TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                parent_tile INT,
                PRIMARY KEY (job_id, tile_index)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create tiles table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS tile_stages (
                job_id UUID NOT NULL,
                tile_index INT NOT NULL,
                stage INT NOT NULL,
                prediction_id TEXT,
                output_url TEXT,
                launched_at BIGINT,
                PRIMARY KEY (job_id, tile_index, stage),
                FOREIGN KEY (job_id, tile_index)
                    REFERENCES tiles(job_id, tile_index) ON DELETE CASCADE
            )
            "#,
            &[],
        )
        .await
        .context("failed to create tile_stages table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tile_stages_prediction
                ON tile_stages (prediction_id)
            "#,
            &[],
        )
        .await
        .context("failed to create tile_stages prediction index")?;

    // At-most-once application of completion events. Inserted before any
    // effect is applied; a conflicting insert means another handler owns
    // this prediction's event.
    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS processed_callbacks (
                prediction_id TEXT PRIMARY KEY,
                job_id UUID NOT NULL,
                received_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create processed_callbacks table")?;

    tracing::info!("database schema initialized");
    Ok(())
}

fn row_to_job(row: &Row) -> Result<Job> {
    let category: String = row.get("category");
    let status: String = row.get("status");
    let chain: serde_json::Value = row.get("chain");
    let templates: serde_json::Value = row.get("templates");
    let grid: Option<serde_json::Value> = row.get("tile_grid");

    Ok(Job {
        id: row.get("id"),
        principal: row.get("principal"),
        input_url: row.get("input_url"),
        original_width: row.get::<_, i32>("original_width") as u32,
        original_height: row.get::<_, i32>("original_height") as u32,
        category: Category::parse(&category),
        requested_scale: row.get::<_, i32>("requested_scale") as u32,
        effective_scale: row.get::<_, i32>("effective_scale") as u32,
        stages: serde_json::from_value(chain).context("corrupt chain column")?,
        templates: serde_json::from_value(templates).context("corrupt templates column")?,
        grid: grid
            .map(serde_json::from_value)
            .transpose()
            .context("corrupt tile_grid column")?,
        using_tiling: row.get("using_tiling"),
        current_stage: row.get::<_, i32>("current_stage") as u32,
        total_stages: row.get::<_, i32>("total_stages") as u32,
        prediction_id: row.get("prediction_id"),
        status: JobStatus::parse(&status)
            .with_context(|| format!("unknown job status {status:?}"))?,
        retry_count: row.get::<_, i32>("retry_count") as u32,
        last_callback_at: row.get("last_callback_at"),
        error_message: row.get("error_message"),
        current_output_url: row.get("current_output_url"),
        final_output_url: row.get("final_output_url"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const JOB_COLUMNS: &str = "id, principal, input_url, original_width, original_height, category, \
     requested_scale, effective_scale, chain, templates, tile_grid, using_tiling, \
     current_stage, total_stages, prediction_id, status, retry_count, last_callback_at, \
     error_message, current_output_url, final_output_url, created_at, updated_at";

/// Insert a freshly planned job.
pub async fn insert_job(pool: &Pool, job: &Job) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    let chain = serde_json::to_value(&job.stages).context("serialize chain")?;
    let templates = serde_json::to_value(&job.templates).context("serialize templates")?;
    let grid = job
        .grid
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .context("serialize tile grid")?;

    client
        .execute(
            r#"
            INSERT INTO jobs (
                id, principal, input_url, original_width, original_height, category,
                requested_scale, effective_scale, chain, templates, tile_grid, using_tiling,
                current_stage, total_stages, prediction_id, status, retry_count,
                last_callback_at, error_message, current_output_url, final_output_url,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            "#,
            &[
                &job.id,
                &job.principal,
                &job.input_url,
                &(job.original_width as i32),
                &(job.original_height as i32),
                &job.category.as_str(),
                &(job.requested_scale as i32),
                &(job.effective_scale as i32),
                &chain,
                &templates,
                &grid,
                &job.using_tiling,
                &(job.current_stage as i32),
                &(job.total_stages as i32),
                &job.prediction_id,
                &job.status.as_str(),
                &(job.retry_count as i32),
                &job.last_callback_at,
                &job.error_message,
                &job.current_output_url,
                &job.final_output_url,
                &job.created_at,
                &job.updated_at,
            ],
        )
        .await
        .context("failed to insert job")?;

    Ok(())
}

pub async fn get_job(pool: &Pool, id: Uuid) -> Result<Option<Job>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query job")?;

    row.map(|r| row_to_job(&r)).transpose()
}

/// Find the non-tiled job driving the given prediction.
pub async fn get_job_by_prediction(pool: &Pool, prediction_id: &str) -> Result<Option<Job>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE prediction_id = $1"),
            &[&prediction_id],
        )
        .await
        .context("failed to query job by prediction")?;

    row.map(|r| row_to_job(&r)).transpose()
}

/// Locate the tile stage slot holding the given prediction.
/// Returns (job id, tile index, stage).
pub async fn find_tile_stage_by_prediction(
    pool: &Pool,
    prediction_id: &str,
) -> Result<Option<(Uuid, u32, u32)>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            r#"
            SELECT job_id, tile_index, stage
            FROM tile_stages
            WHERE prediction_id = $1
            "#,
            &[&prediction_id],
        )
        .await
        .context("failed to query tile stage by prediction")?;

    Ok(row.map(|r| {
        (
            r.get("job_id"),
            r.get::<_, i32>("tile_index") as u32,
            r.get::<_, i32>("stage") as u32,
        )
    }))
}

/// Record a handled completion event. Returns false when the prediction was
/// already recorded, in which case the caller must not re-apply effects.
pub async fn insert_processed_callback(
    pool: &Pool,
    prediction_id: &str,
    job_id: Uuid,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            INSERT INTO processed_callbacks (prediction_id, job_id, received_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (prediction_id) DO NOTHING
            "#,
            &[&prediction_id, &job_id, &now_ms()],
        )
        .await
        .context("failed to record processed callback")?;

    Ok(rows > 0)
}

pub async fn touch_last_callback(pool: &Pool, job_id: Uuid) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            "UPDATE jobs SET last_callback_at = $2, updated_at = $2 WHERE id = $1",
            &[&job_id, &now_ms()],
        )
        .await
        .context("failed to touch last_callback_at")?;

    Ok(())
}

/// Insert the initial tile set for a tiled job, all pending.
pub async fn insert_tiles(pool: &Pool, job_id: Uuid, tiles: &[(u32, u32, u32, u32, u32, String)]) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    for (index, x, y, width, height, input_url) in tiles {
        client
            .execute(
                r#"
                INSERT INTO tiles (job_id, tile_index, x, y, width, height, input_url, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
                "#,
                &[
                    &job_id,
                    &(*index as i32),
                    &(*x as i32),
                    &(*y as i32),
                    &(*width as i32),
                    &(*height as i32),
                    input_url,
                ],
            )
            .await
            .with_context(|| format!("failed to insert tile {index}"))?;
    }

    Ok(())
}

/// Drop a job's tiles and install a replacement set (client-side split
/// continuation). The new tiles start pending.
pub async fn replace_tiles(
    pool: &Pool,
    job_id: Uuid,
    tiles: &[(u32, u32, u32, u32, u32, String, Option<u32>)],
) -> Result<()> {
    let mut client = pool.get().await.context("failed to get db connection")?;
    let tx = client.transaction().await.context("begin transaction")?;

    tx.execute("DELETE FROM tiles WHERE job_id = $1", &[&job_id])
        .await
        .context("failed to delete old tiles")?;

    for (index, x, y, width, height, input_url, parent) in tiles {
        tx.execute(
            r#"
            INSERT INTO tiles (job_id, tile_index, x, y, width, height, input_url, status, parent_tile)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            "#,
            &[
                &job_id,
                &(*index as i32),
                &(*x as i32),
                &(*y as i32),
                &(*width as i32),
                &(*height as i32),
                input_url,
                &parent.map(|p| p as i32),
            ],
        )
        .await
        .with_context(|| format!("failed to insert replacement tile {index}"))?;
    }

    tx.commit().await.context("commit tile replacement")?;
    Ok(())
}

fn row_to_tile(row: &Row) -> Result<Tile> {
    let status: String = row.get("status");
    Ok(Tile {
        job_id: row.get("job_id"),
        index: row.get::<_, i32>("tile_index") as u32,
        x: row.get::<_, i32>("x") as u32,
        y: row.get::<_, i32>("y") as u32,
        width: row.get::<_, i32>("width") as u32,
        height: row.get::<_, i32>("height") as u32,
        input_url: row.get("input_url"),
        status: TileStatus::parse(&status)
            .with_context(|| format!("unknown tile status {status:?}"))?,
        error_message: row.get("error_message"),
        parent_tile: row.get::<_, Option<i32>>("parent_tile").map(|p| p as u32),
        slots: Vec::new(),
    })
}

/// Fetch every tile of a job with its stage slots attached, ordered by index.
pub async fn get_tiles(pool: &Pool, job_id: Uuid) -> Result<Vec<Tile>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let tile_rows = client
        .query(
            r#"
            SELECT job_id, tile_index, x, y, width, height, input_url, status,
                   error_message, parent_tile
            FROM tiles
            WHERE job_id = $1
            ORDER BY tile_index ASC
            "#,
            &[&job_id],
        )
        .await
        .context("failed to query tiles")?;

    let mut tiles = tile_rows
        .iter()
        .map(row_to_tile)
        .collect::<Result<Vec<_>>>()?;

    let slot_rows = client
        .query(
            r#"
            SELECT tile_index, stage, prediction_id, output_url, launched_at
            FROM tile_stages
            WHERE job_id = $1
            ORDER BY tile_index ASC, stage ASC
            "#,
            &[&job_id],
        )
        .await
        .context("failed to query tile stages")?;

    for row in &slot_rows {
        let index = row.get::<_, i32>("tile_index") as u32;
        if let Some(tile) = tiles.iter_mut().find(|t| t.index == index) {
            tile.slots.push(TileStageSlot {
                stage: row.get::<_, i32>("stage") as u32,
                prediction_id: row.get("prediction_id"),
                output_url: row.get("output_url"),
                launched_at: row.get("launched_at"),
            });
        }
    }

    Ok(tiles)
}

/// Record the prediction now driving a tile's stage.
pub async fn set_tile_stage_prediction(
    pool: &Pool,
    job_id: Uuid,
    tile_index: u32,
    stage: u32,
    prediction_id: &str,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            INSERT INTO tile_stages (job_id, tile_index, stage, prediction_id, launched_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id, tile_index, stage)
            DO UPDATE SET prediction_id = EXCLUDED.prediction_id,
                          launched_at = EXCLUDED.launched_at
            "#,
            &[
                &job_id,
                &(tile_index as i32),
                &(stage as i32),
                &prediction_id,
                &now_ms(),
            ],
        )
        .await
        .context("failed to set tile stage prediction")?;

    Ok(())
}

/// Write a stage's output URL into the tile's slot.
pub async fn set_tile_stage_output(
    pool: &Pool,
    job_id: Uuid,
    tile_index: u32,
    stage: u32,
    output_url: &str,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            INSERT INTO tile_stages (job_id, tile_index, stage, output_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id, tile_index, stage)
            DO UPDATE SET output_url = EXCLUDED.output_url
            "#,
            &[&job_id, &(tile_index as i32), &(stage as i32), &output_url],
        )
        .await
        .context("failed to set tile stage output")?;

    Ok(())
}

/// Conditionally advance a tile's status. Returns false when the row was no
/// longer in `from`, meaning another handler won the transition.
pub async fn transition_tile(
    pool: &Pool,
    job_id: Uuid,
    tile_index: u32,
    from: TileStatus,
    to: TileStatus,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE tiles SET status = $4
            WHERE job_id = $1 AND tile_index = $2 AND status = $3
            "#,
            &[
                &job_id,
                &(tile_index as i32),
                &from.encode(),
                &to.encode(),
            ],
        )
        .await
        .context("failed to transition tile")?;

    Ok(rows > 0)
}

/// Mark a tile failed unless it already is. Failure is terminal for tiles.
pub async fn mark_tile_failed(
    pool: &Pool,
    job_id: Uuid,
    tile_index: u32,
    error: &str,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE tiles SET status = 'failed', error_message = $3
            WHERE job_id = $1 AND tile_index = $2 AND status != 'failed'
            "#,
            &[&job_id, &(tile_index as i32), &error],
        )
        .await
        .context("failed to mark tile failed")?;

    Ok(rows > 0)
}

/// Conditionally move the job between statuses. Zero rows means another
/// contender already performed (or overtook) the transition; callers treat
/// that as a clean loss, not an error.
pub async fn transition_job_status(
    pool: &Pool,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE jobs SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
            &[&job_id, &from.as_str(), &to.as_str(), &now_ms()],
        )
        .await
        .context("failed to transition job status")?;

    Ok(rows > 0)
}

/// Bump the job's stage cursor from `from_stage` to the next stage.
pub async fn advance_job_stage(pool: &Pool, job_id: Uuid, from_stage: u32) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE jobs SET current_stage = $3, updated_at = $4
            WHERE id = $1 AND current_stage = $2 AND status = 'processing'
            "#,
            &[
                &job_id,
                &(from_stage as i32),
                &((from_stage + 1) as i32),
                &now_ms(),
            ],
        )
        .await
        .context("failed to advance job stage")?;

    Ok(rows > 0)
}

/// Point a non-tiled job at the prediction driving its current stage.
pub async fn set_job_prediction(
    pool: &Pool,
    job_id: Uuid,
    prediction_id: &str,
    stage: u32,
) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            UPDATE jobs SET prediction_id = $2, current_stage = $3, updated_at = $4
            WHERE id = $1
            "#,
            &[&job_id, &prediction_id, &(stage as i32), &now_ms()],
        )
        .await
        .context("failed to set job prediction")?;

    Ok(())
}

/// Record the newest intermediate output.
pub async fn set_job_current_output(pool: &Pool, job_id: Uuid, url: &str) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            "UPDATE jobs SET current_output_url = $2, updated_at = $3 WHERE id = $1",
            &[&job_id, &url, &now_ms()],
        )
        .await
        .context("failed to set current output url")?;

    Ok(())
}

/// Complete a job from the given status, installing the final URL.
pub async fn complete_job(
    pool: &Pool,
    job_id: Uuid,
    from: JobStatus,
    final_url: &str,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE jobs SET status = 'completed', final_output_url = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            "#,
            &[&job_id, &from.as_str(), &final_url, &now_ms()],
        )
        .await
        .context("failed to complete job")?;

    Ok(rows > 0)
}

/// Fail a job. Terminal states are never overwritten.
pub async fn fail_job(pool: &Pool, job_id: Uuid, error: &str) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE jobs SET status = 'failed', error_message = $2, updated_at = $3
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'partial_success')
            "#,
            &[&job_id, &error, &now_ms()],
        )
        .await
        .context("failed to fail job")?;

    Ok(rows > 0)
}

/// End a job in partial success: a later stage could not complete but an
/// earlier stage's output is usable as the final result.
pub async fn partial_success_job(
    pool: &Pool,
    job_id: Uuid,
    final_url: &str,
    message: &str,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .execute(
            r#"
            UPDATE jobs
            SET status = 'partial_success', final_output_url = $2, error_message = $3,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
            &[&job_id, &final_url, &message, &now_ms()],
        )
        .await
        .context("failed to set partial success")?;

    Ok(rows > 0)
}

/// Bump the retry counter and return the new value.
pub async fn increment_retry(pool: &Pool, job_id: Uuid) -> Result<u32> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_one(
            r#"
            UPDATE jobs SET retry_count = retry_count + 1, updated_at = $2
            WHERE id = $1
            RETURNING retry_count
            "#,
            &[&job_id, &now_ms()],
        )
        .await
        .context("failed to increment retry count")?;

    Ok(row.get::<_, i32>("retry_count") as u32)
}

/// Jobs still processing whose callbacks have gone silent: last callback
/// older than the cutoff, or no callback ever received.
pub async fn list_stale_processing(pool: &Pool, cutoff_ms: i64) -> Result<Vec<Job>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE status = 'processing' \
                 AND (last_callback_at IS NULL OR last_callback_at < $1) \
                 ORDER BY created_at ASC"
            ),
            &[&cutoff_ms],
        )
        .await
        .context("failed to list stale jobs")?;

    rows.iter().map(row_to_job).collect()
}

/// Jobs sitting in tiles_ready, for stitch pickup after a crash.
pub async fn list_tiles_ready(pool: &Pool) -> Result<Vec<Job>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'tiles_ready' \
                 ORDER BY created_at ASC"
            ),
            &[],
        )
        .await
        .context("failed to list tiles_ready jobs")?;

    rows.iter().map(row_to_job).collect()
}
