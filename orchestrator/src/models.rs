use panto_plan::{Category, ChainStage, StageTemplate, TilingGrid};
use panto_provider::{PredictionOutput, PredictionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job row. `Processing` is the only non-terminal state for
/// non-tiled jobs; tiled jobs pass through `TilesReady` on their way to
/// `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    TilesReady,
    Completed,
    Failed,
    PartialSuccess,
    NeedsSplit,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::TilesReady => "tiles_ready",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::NeedsSplit => "needs_split",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "processing" => Some(JobStatus::Processing),
            "tiles_ready" => Some(JobStatus::TilesReady),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "partial_success" => Some(JobStatus::PartialSuccess),
            "needs_split" => Some(JobStatus::NeedsSplit),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::PartialSuccess
        )
    }
}

/// Tagged per-tile state machine. Stage numbers are 1-indexed; the string
/// encoding (`stage2_processing`) is what lands in the status column, so the
/// codec here and the conditional updates in `db` must agree exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Pending,
    StageProcessing(u32),
    StageComplete(u32),
    Failed,
}

impl TileStatus {
    pub fn encode(&self) -> String {
        match self {
            TileStatus::Pending => "pending".to_string(),
            TileStatus::StageProcessing(k) => format!("stage{k}_processing"),
            TileStatus::StageComplete(k) => format!("stage{k}_complete"),
            TileStatus::Failed => "failed".to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<TileStatus> {
        match s {
            "pending" => return Some(TileStatus::Pending),
            "failed" => return Some(TileStatus::Failed),
            _ => {}
        }
        let rest = s.strip_prefix("stage")?;
        if let Some(k) = rest.strip_suffix("_processing") {
            return k.parse().ok().map(TileStatus::StageProcessing);
        }
        if let Some(k) = rest.strip_suffix("_complete") {
            return k.parse().ok().map(TileStatus::StageComplete);
        }
        None
    }

    /// Position along the stage ladder: pending < stage1_processing <
    /// stage1_complete < stage2_processing < ... Failed tiles sit outside
    /// the ladder and never count as progress.
    pub fn rank(&self) -> i64 {
        match self {
            TileStatus::Pending => 0,
            TileStatus::StageProcessing(k) => 2 * (*k as i64) - 1,
            TileStatus::StageComplete(k) => 2 * (*k as i64),
            TileStatus::Failed => -1,
        }
    }

    /// True when this tile has completed stage `stage` (possibly having
    /// moved on to a later stage already).
    pub fn at_or_beyond_complete(&self, stage: u32) -> bool {
        !matches!(self, TileStatus::Failed) && self.rank() >= 2 * stage as i64
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TileStatus::Failed)
    }
}

/// Per-stage slot on a tile: the prediction driving the stage and, once it
/// completes, the output URL.
#[derive(Debug, Clone, Default)]
pub struct TileStageSlot {
    pub stage: u32,
    pub prediction_id: Option<String>,
    pub output_url: Option<String>,
    pub launched_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub job_id: Uuid,
    pub index: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub input_url: String,
    pub status: TileStatus,
    pub error_message: Option<String>,
    /// Set when this tile came from a client-side split of another tile.
    pub parent_tile: Option<u32>,
    /// Stage slots, ordered by stage number; missing stages have no slot.
    pub slots: Vec<TileStageSlot>,
}

impl Tile {
    pub fn slot(&self, stage: u32) -> Option<&TileStageSlot> {
        self.slots.iter().find(|s| s.stage == stage)
    }

    /// Newest non-null output at or below `stage`, for stitch fallback.
    pub fn best_output_up_to(&self, stage: u32) -> Option<&str> {
        (1..=stage).rev().find_map(|k| {
            self.slot(k)
                .and_then(|s| s.output_url.as_deref())
        })
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub principal: String,
    pub input_url: String,
    pub original_width: u32,
    pub original_height: u32,
    pub category: Category,
    pub requested_scale: u32,
    pub effective_scale: u32,
    pub stages: Vec<ChainStage>,
    pub templates: Vec<StageTemplate>,
    pub grid: Option<TilingGrid>,
    pub using_tiling: bool,
    pub current_stage: u32,
    pub total_stages: u32,
    /// Prediction in flight for non-tiled jobs.
    pub prediction_id: Option<String>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_callback_at: Option<i64>,
    pub error_message: Option<String>,
    pub current_output_url: Option<String>,
    pub final_output_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn stage(&self, k: u32) -> Option<&ChainStage> {
        self.stages.iter().find(|s| s.stage == k)
    }
}

// ---------------------------------------------------------------------------
// Public API payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub image_base64: String,
    /// Target scale. Deserialized as a float so a non-integer value can be
    /// rejected with the proper validation error instead of a parse failure.
    pub scale: f64,
    /// Content category; unknown values fall back to photo.
    #[serde(default)]
    pub quality: Option<String>,
    pub plan: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub quality_mode: Option<String>,
    #[serde(default)]
    pub selected_model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub estimated_time: i64,
    pub estimated_cost: f64,
    pub total_stages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tiles: Option<u32>,
    pub original_dimensions: Dimensions,
    pub target_scale: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Completion webhook body. The shape mirrors the provider's prediction
/// object so the reconciler can feed polled predictions through the same
/// handler.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEvent {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<PredictionOutput>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackResponse {
    pub ok: bool,
    pub received: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageView {
    pub stage: u32,
    pub scale: u32,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub status: String,
    pub progress: f64,
    pub current_stage: u32,
    pub total_stages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub estimated_time_remaining: i64,
    pub using_tiling: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiling_info: Option<TilingGrid>,
    pub stages: Vec<StageView>,
    /// Raw tile list, only when the job is tiles_ready so an external
    /// client may perform its own stitching.
    #[serde(rename = "tiles_data", skip_serializing_if = "Option::is_none")]
    pub tiles_data: Option<Vec<TileView>>,
    #[serde(rename = "tile_grid", skip_serializing_if = "Option::is_none")]
    pub tile_grid: Option<TilingGrid>,
    #[serde(rename = "target_scale", skip_serializing_if = "Option::is_none")]
    pub target_scale: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileView {
    pub index: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub job_id: Uuid,
    pub tiles_data: Vec<ResumeTile>,
    pub next_stage: u32,
    #[serde(default)]
    pub split_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeTile {
    pub index: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Input for the next stage, produced by the client-side split.
    pub url: String,
    #[serde(default)]
    pub parent_tile: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub next_stage: u32,
    pub tiles_launched: u32,
    pub tiles_failed: u32,
    pub total_tiles: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAllResponse {
    pub success: bool,
    pub checked: usize,
    pub results: Vec<JobCheckResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCheckResult {
    pub job_id: Uuid,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub final_url: String,
    pub dimensions: Dimensions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_status_round_trips_through_the_column_encoding() {
        let cases = [
            TileStatus::Pending,
            TileStatus::StageProcessing(1),
            TileStatus::StageComplete(1),
            TileStatus::StageProcessing(2),
            TileStatus::StageComplete(2),
            TileStatus::Failed,
        ];
        for status in cases {
            assert_eq!(TileStatus::parse(&status.encode()), Some(status));
        }
    }

    #[test]
    fn tile_status_rejects_garbage() {
        assert_eq!(TileStatus::parse("stagex_processing"), None);
        assert_eq!(TileStatus::parse("stage1_done"), None);
        assert_eq!(TileStatus::parse(""), None);
    }

    #[test]
    fn rank_orders_the_stage_ladder() {
        let ladder = [
            TileStatus::Pending,
            TileStatus::StageProcessing(1),
            TileStatus::StageComplete(1),
            TileStatus::StageProcessing(2),
            TileStatus::StageComplete(2),
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn at_or_beyond_counts_later_stages_but_never_failures() {
        assert!(TileStatus::StageComplete(1).at_or_beyond_complete(1));
        assert!(TileStatus::StageProcessing(2).at_or_beyond_complete(1));
        assert!(TileStatus::StageComplete(2).at_or_beyond_complete(1));
        assert!(!TileStatus::StageProcessing(1).at_or_beyond_complete(1));
        assert!(!TileStatus::Pending.at_or_beyond_complete(1));
        assert!(!TileStatus::Failed.at_or_beyond_complete(1));
    }

    #[test]
    fn best_output_walks_backwards() {
        let tile = Tile {
            job_id: Uuid::nil(),
            index: 0,
            x: 0,
            y: 0,
            width: 100,
            height: 100,
            input_url: "in".into(),
            status: TileStatus::StageComplete(1),
            error_message: None,
            parent_tile: None,
            slots: vec![
                TileStageSlot {
                    stage: 1,
                    prediction_id: Some("p1".into()),
                    output_url: Some("s1.png".into()),
                    launched_at: None,
                },
                TileStageSlot {
                    stage: 2,
                    prediction_id: Some("p2".into()),
                    output_url: None,
                    launched_at: None,
                },
            ],
        };
        assert_eq!(tile.best_output_up_to(2), Some("s1.png"));
    }

    #[test]
    fn job_status_round_trips() {
        for s in [
            JobStatus::Processing,
            JobStatus::TilesReady,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::PartialSuccess,
            JobStatus::NeedsSplit,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
    }
}
