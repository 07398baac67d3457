use crate::types::{
    BASE_OVERLAP, GPU_BUDGET_SIDE, MAX_OUTPUT_DIMENSION, MAX_TILE_COUNT, MIN_OVERLAP,
    MIN_TILE_FLOOR, NATIVE_SAFE_SIDE, PlanError, StageTemplate, TileRect, TilingGrid,
    VALID_SCALES,
};

/// Overlap shrinks for very high targets so the stage-2 inputs keep room
/// for the core pixels, but never below the seam-hiding floor.
pub fn adaptive_overlap(target: u32) -> u32 {
    if target > 16 {
        (BASE_OVERLAP * 16 / target).max(MIN_OVERLAP)
    } else {
        BASE_OVERLAP
    }
}

/// Decide whether the image must be tiled for the given chain and, if so,
/// compute the grid.
///
/// The minimum tile size comes from the stage-2 input constraint: after the
/// first stage multiplies a tile by `s1`, the result must still fit the GPU
/// budget side. Tiles are laid out on a uniform stride; interior tiles are
/// expanded by the overlap on their right and bottom edges, and the last
/// row/column extends to the image edge. The clamp of the core size to
/// `min_tile - overlap` keeps every expanded tile within the minimum, so
/// both stage inputs are bounded by construction.
pub fn plan_tiling(
    width: u32,
    height: u32,
    scales: &[u32],
    target: u32,
) -> Result<Option<(TilingGrid, Vec<TileRect>)>, PlanError> {
    if width == 0 || height == 0 {
        return Err(PlanError::DegenerateTile { width, height });
    }

    // A single-stage chain over an image within the native-safe square goes
    // through whole; the model's own tile parameter covers the GPU side.
    if scales.len() == 1 && width <= NATIVE_SAFE_SIDE && height <= NATIVE_SAFE_SIDE {
        return Ok(None);
    }

    // The binding constraint is the largest per-stage input: stage k sees a
    // tile grown by every earlier scale, so the minimum tile side is the
    // budget divided by the largest prefix product of scales.
    let s1 = scales[0];
    let mut min_tile = GPU_BUDGET_SIDE;
    let mut grown = 1u32;
    for &s in &scales[..scales.len() - 1] {
        grown *= s;
        min_tile = min_tile.min(GPU_BUDGET_SIDE / grown);
    }
    let min_tile = min_tile.max(MIN_TILE_FLOOR);
    let overlap = adaptive_overlap(target);
    if min_tile <= overlap {
        return Err(PlanError::DegenerateTile { width, height });
    }

    let tiles_x = width.div_ceil(min_tile);
    let tiles_y = height.div_ceil(min_tile);
    let stride_x = width.div_ceil(tiles_x);
    let stride_y = height.div_ceil(tiles_y);
    let core_w = stride_x.min(min_tile - overlap);
    let core_h = stride_y.min(min_tile - overlap);
    if core_w == 0 || core_h == 0 {
        return Err(PlanError::DegenerateTile { width, height });
    }

    let mut tiles = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x = tx * stride_x;
            let y = ty * stride_y;
            let w = if tx == tiles_x - 1 {
                width - x
            } else {
                core_w + overlap
            };
            let h = if ty == tiles_y - 1 {
                height - y
            } else {
                core_h + overlap
            };
            if w == 0 || h == 0 {
                return Err(PlanError::DegenerateTile { width, height });
            }
            tiles.push(TileRect {
                index: ty * tiles_x + tx,
                x,
                y,
                width: w,
                height: h,
            });
        }
    }

    // Validate the budget at stage 1 and, via the first scale factor, at
    // the stage-2 input. Failures here are planner bugs, not user input.
    let max_side = tiles
        .iter()
        .map(|t| t.width.max(t.height))
        .max()
        .unwrap_or(0);
    if max_side > GPU_BUDGET_SIDE {
        return Err(PlanError::BudgetExceeded {
            stage: 1,
            side: max_side,
        });
    }
    if scales.len() > 1 && max_side * s1 > GPU_BUDGET_SIDE {
        return Err(PlanError::BudgetExceeded {
            stage: 2,
            side: max_side * s1,
        });
    }

    let grid = TilingGrid {
        tiles_x,
        tiles_y,
        tile_width: core_w,
        tile_height: core_h,
        overlap,
        total_tiles: tiles_x * tiles_y,
    };
    Ok(Some((grid, tiles)))
}

/// Per-stage template config: expected tile counts and required client-side
/// splits. Stage k's input side is the largest tile side grown by every
/// earlier stage's scale; a side beyond the budget demands a k² split before
/// the stage may start.
pub fn stage_templates(
    width: u32,
    height: u32,
    scales: &[u32],
    tiling: Option<&(TilingGrid, Vec<TileRect>)>,
) -> Vec<StageTemplate> {
    let base_side = match tiling {
        Some((_, tiles)) => tiles
            .iter()
            .map(|t| t.width.max(t.height))
            .max()
            .unwrap_or(0),
        None => width.max(height),
    };
    let base_tiles = match tiling {
        Some((grid, _)) => grid.total_tiles,
        None => 1,
    };

    let mut templates = Vec::with_capacity(scales.len());
    let mut side = base_side as u64;
    let mut expected = base_tiles;
    for (i, &scale) in scales.iter().enumerate() {
        let split = if side > GPU_BUDGET_SIDE as u64 {
            let k = side.div_ceil(GPU_BUDGET_SIDE as u64) as u32;
            k * k
        } else {
            1
        };
        expected *= split;
        if split > 1 {
            // Client-side splits shrink the working side back under budget.
            side = side.div_ceil(side.div_ceil(GPU_BUDGET_SIDE as u64));
        }
        templates.push(StageTemplate {
            stage: (i + 1) as u32,
            scale,
            expected_tiles: expected,
            split_from_previous: split,
        });
        side *= scale as u64;
    }
    templates
}

/// Reduce the requested scale so no output dimension exceeds the guard,
/// staying within the plan quota. Returns the largest valid scale that
/// satisfies every bound, or None when even 2x would overflow.
pub fn apply_dimension_guard(
    width: u32,
    height: u32,
    requested: u32,
    quota_cap: u32,
) -> Option<u32> {
    let max_dim = width.max(height) as u64;
    VALID_SCALES
        .iter()
        .rev()
        .copied()
        .find(|&s| s <= requested && s <= quota_cap && max_dim * s as u64 <= MAX_OUTPUT_DIMENSION as u64)
}

/// Largest valid target for which the photo-path plan keeps the effective
/// tile count within bounds and the output within the dimension guard.
/// Surfaced in refusal suggestions for over-limit requests.
pub fn max_safe_scale(width: u32, height: u32) -> Option<u32> {
    let max_dim = width.max(height) as u64;
    VALID_SCALES.iter().rev().copied().find(|&s| {
        if max_dim * s as u64 > MAX_OUTPUT_DIMENSION as u64 {
            return false;
        }
        let Ok(chain) = crate::chain::plan_chain(crate::types::Category::Photo, s) else {
            return false;
        };
        match plan_tiling(width, height, &chain, s) {
            Ok(None) => true,
            Ok(Some((grid, _))) => grid.total_tiles <= MAX_TILE_COUNT,
            Err(_) => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered(width: u32, height: u32, tiles: &[TileRect]) -> bool {
        // Sampled coverage check: every probe point must land in some tile.
        let step = 7;
        for y in (0..height).step_by(step) {
            for x in (0..width).step_by(step) {
                let hit = tiles.iter().any(|t| {
                    x >= t.x && x < t.x + t.width && y >= t.y && y < t.y + t.height
                });
                if !hit {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn single_stage_within_native_safe_bypasses_tiling() {
        assert!(plan_tiling(1200, 800, &[8], 8).unwrap().is_none());
        assert!(plan_tiling(1400, 1400, &[2], 2).unwrap().is_none());
    }

    #[test]
    fn single_stage_beyond_native_safe_tiles() {
        let (grid, tiles) = plan_tiling(3000, 2000, &[8], 8).unwrap().unwrap();
        assert!(grid.total_tiles > 1);
        assert!(covered(3000, 2000, &tiles));
    }

    #[test]
    fn multi_stage_always_tiles() {
        let (grid, _) = plan_tiling(100, 100, &[4, 6], 24).unwrap().unwrap();
        assert_eq!(grid.total_tiles, 1);
    }

    #[test]
    fn art_16x_on_1000_square_gives_3x3() {
        let (grid, tiles) = plan_tiling(1000, 1000, &[4, 4], 16).unwrap().unwrap();
        assert_eq!((grid.tiles_x, grid.tiles_y), (3, 3));
        assert_eq!(grid.overlap, 64);
        // min tile = 1448/4 = 362: both stage inputs stay within budget
        let max_side = tiles.iter().map(|t| t.width.max(t.height)).max().unwrap();
        assert!(max_side <= 362);
        assert!(max_side * 4 <= GPU_BUDGET_SIDE);
        assert!(covered(1000, 1000, &tiles));
    }

    #[test]
    fn photo_24x_on_2000_square_respects_budget_both_stages() {
        let (grid, tiles) = plan_tiling(2000, 2000, &[4, 6], 24).unwrap().unwrap();
        let max_side = tiles.iter().map(|t| t.width.max(t.height)).max().unwrap();
        assert!(max_side <= GPU_BUDGET_SIDE);
        assert!(max_side * 4 <= GPU_BUDGET_SIDE);
        assert!(grid.overlap >= MIN_OVERLAP && grid.overlap < BASE_OVERLAP);
        assert!(covered(2000, 2000, &tiles));
    }

    #[test]
    fn overlap_adapts_above_16x() {
        assert_eq!(adaptive_overlap(8), 64);
        assert_eq!(adaptive_overlap(16), 64);
        assert_eq!(adaptive_overlap(20), 51);
        assert_eq!(adaptive_overlap(24), 42);
        // floor engages for hypothetical far targets
        assert_eq!(adaptive_overlap(48), 32);
    }

    #[test]
    fn tile_indices_are_row_major_and_dense() {
        let (grid, tiles) = plan_tiling(1000, 700, &[4, 4], 16).unwrap().unwrap();
        for (i, t) in tiles.iter().enumerate() {
            assert_eq!(t.index, i as u32);
        }
        assert_eq!(tiles.len() as u32, grid.total_tiles);
    }

    #[test]
    fn guard_reduces_oversized_targets() {
        // 4000 * 24 = 96000 > 65536; largest valid scale that fits is 16
        assert_eq!(apply_dimension_guard(4000, 4000, 24, 24), Some(16));
        // quota wins when lower
        assert_eq!(apply_dimension_guard(4000, 4000, 24, 8), Some(8));
        // nothing fits below 2x
        assert_eq!(apply_dimension_guard(40_000, 200, 4, 24), None);
    }

    #[test]
    fn guard_is_identity_when_already_safe() {
        assert_eq!(apply_dimension_guard(100, 100, 2, 24), Some(2));
        assert_eq!(apply_dimension_guard(2000, 2000, 24, 24), Some(24));
    }

    #[test]
    fn templates_cover_every_stage_without_splits_in_scope() {
        let tiling = plan_tiling(2000, 2000, &[4, 6], 24).unwrap();
        let templates = stage_templates(2000, 2000, &[4, 6], tiling.as_ref());
        assert_eq!(templates.len(), 2);
        assert!(templates.iter().all(|t| t.split_from_previous == 1));
        assert_eq!(templates[0].scale, 4);
        assert_eq!(templates[1].scale, 6);
    }

    #[test]
    fn max_safe_scale_drops_with_image_size() {
        let small = max_safe_scale(500, 500).unwrap();
        let large = max_safe_scale(6000, 6000).unwrap();
        assert!(small >= large);
        assert!(large >= 2);
    }

    #[test]
    fn templates_demand_splits_for_over_budget_inputs() {
        // An untiled input far beyond the budget side needs a client-side
        // split before its first stage may run.
        let templates = stage_templates(20_000, 20_000, &[2], None);
        assert_eq!(templates.len(), 1);
        let k = 20_000u64.div_ceil(GPU_BUDGET_SIDE as u64) as u32;
        assert_eq!(templates[0].split_from_previous, k * k);
        assert_eq!(templates[0].expected_tiles, k * k);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(matches!(
            plan_tiling(0, 500, &[4, 4], 16),
            Err(PlanError::DegenerateTile { .. })
        ));
        assert!(matches!(
            plan_tiling(500, 0, &[4, 4], 16),
            Err(PlanError::DegenerateTile { .. })
        ));
    }

    #[test]
    fn tiny_image_multi_stage_yields_single_tile_grid() {
        let (grid, tiles) = plan_tiling(100, 100, &[4, 6], 24).unwrap().unwrap();
        assert_eq!(grid.total_tiles, 1);
        assert_eq!(tiles[0].width, 100);
        assert_eq!(tiles[0].height, 100);
    }
}
