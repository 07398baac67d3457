use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Target scales accepted on the public surface.
pub const VALID_SCALES: [u32; 8] = [2, 4, 8, 10, 12, 16, 20, 24];

/// Authoritative maximum target scale.
pub const MAX_SCALE: u32 = 24;

/// No output dimension may exceed this, regardless of plan or quota.
pub const MAX_OUTPUT_DIMENSION: u32 = 65_536;

/// Largest per-call input the provider's GPUs accept, as a pixel count.
pub const GPU_PIXEL_BUDGET: u64 = 2_096_704;

/// Side of the square equivalent of [`GPU_PIXEL_BUDGET`].
pub const GPU_BUDGET_SIDE: u32 = 1448;

/// Images within this square can go through a single-stage model call whole.
pub const NATIVE_SAFE_SIDE: u32 = 1400;

/// Tile overlap in pixels before adaptive reduction.
pub const BASE_OVERLAP: u32 = 64;

/// Adaptive overlap never shrinks below this.
pub const MIN_OVERLAP: u32 = 32;

/// Tiles never get smaller than this, whatever the chain demands.
pub const MIN_TILE_FLOOR: u32 = 64;

/// Grids beyond this tile count make reconciliation and stitching unreliable.
pub const MAX_TILE_COUNT: u32 = 60;

/// Per-stage scale cap for the photo model.
pub const PHOTO_STAGE_CAP: u32 = 10;

/// The specialized art model runs at exactly this scale, nothing else.
pub const ART_STAGE_SCALE: u32 = 4;

/// Content category of the input image; drives model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Photo,
    Art,
    Text,
    Anime,
}

impl Category {
    /// Parse a user-supplied category string. Unknown values fall back to
    /// photo rather than failing the request.
    pub fn parse(s: &str) -> Category {
        match s.to_lowercase().as_str() {
            "photo" => Category::Photo,
            "art" => Category::Art,
            "text" => Category::Text,
            "anime" => Category::Anime,
            other => {
                tracing::warn!(category = %other, "unknown content category, treating as photo");
                Category::Photo
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Photo => "photo",
            Category::Art => "art",
            Category::Text => "text",
            Category::Anime => "anime",
        }
    }
}

/// One model invocation within a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStage {
    /// 1-indexed position in the chain.
    pub stage: u32,
    /// Scale factor this stage applies to its input.
    pub scale: u32,
    /// Model identifier at the provider.
    pub model: String,
    /// Version hash pinned for reproducibility.
    pub version: String,
    /// Model input parameters before the image URL is attached.
    pub base_input: serde_json::Value,
}

/// Tiling grid description, persisted on the job row and echoed on the
/// status endpoint for clients that stitch themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilingGrid {
    pub tiles_x: u32,
    pub tiles_y: u32,
    /// Core tile size before overlap expansion.
    pub tile_width: u32,
    pub tile_height: u32,
    pub overlap: u32,
    pub total_tiles: u32,
}

/// Crop rectangle of one tile in original-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub index: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Per-stage template config: how many tiles the stage expects and whether
/// the client must split tiles before it may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTemplate {
    pub stage: u32,
    pub scale: u32,
    pub expected_tiles: u32,
    /// k² sub-tiles the client must split each tile into before this stage
    /// may launch. 1 means no split required.
    pub split_from_previous: u32,
}

/// The complete plan for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscalePlan {
    pub stages: Vec<ChainStage>,
    pub grid: Option<TilingGrid>,
    pub tiles: Vec<TileRect>,
    pub templates: Vec<StageTemplate>,
    pub using_tiling: bool,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("scale {0} is not a supported target scale")]
    InvalidScale(u32),

    #[error("scale {requested} exceeds the supported maximum of {max}")]
    ScaleTooLarge { requested: u32, max: u32 },

    #[error("tiling produced a non-positive tile dimension for {width}x{height}")]
    DegenerateTile { width: u32, height: u32 },

    #[error("stage {stage} per-tile input of {side}px exceeds the GPU budget")]
    BudgetExceeded { stage: u32, side: u32 },

    #[error("image cannot be upscaled within the output dimension limit")]
    Unscalable,
}
