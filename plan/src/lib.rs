//! Planning library for the upscale orchestrator.
//!
//! Everything in this crate is pure: given image dimensions, a content
//! category and a target scale it produces the model chain, the tiling grid
//! and the per-stage template config. No I/O happens here, which is what
//! makes the planner exhaustively unit-testable.

pub mod chain;
pub mod quota;
pub mod registry;
pub mod tiling;
pub mod types;

pub use chain::plan_chain;
pub use quota::plan_cap;
pub use registry::{ModelChoice, pick_model};
pub use tiling::{apply_dimension_guard, max_safe_scale, plan_tiling, stage_templates};
pub use types::*;

/// Build the complete execution plan for one upscale request.
///
/// `effective_scale` must already have passed the dimension guard
/// ([`apply_dimension_guard`]); this function assumes it is a member of
/// [`VALID_SCALES`].
pub fn build_plan(
    width: u32,
    height: u32,
    category: Category,
    effective_scale: u32,
    pinned_model: Option<&str>,
) -> Result<UpscalePlan, PlanError> {
    let scales = chain::plan_chain(category, effective_scale)?;
    let tiling = tiling::plan_tiling(width, height, &scales, effective_scale)?;
    let using_tiling = tiling.is_some();

    let mut stages = Vec::with_capacity(scales.len());
    for (i, &scale) in scales.iter().enumerate() {
        let stage = (i + 1) as u32;
        let choice = registry::pick_model(category, scale, stage, pinned_model, using_tiling);
        stages.push(ChainStage {
            stage,
            scale,
            model: choice.model,
            version: choice.version,
            base_input: choice.base_input,
        });
    }

    let templates = tiling::stage_templates(width, height, &scales, tiling.as_ref());
    let (grid, tiles) = match tiling {
        Some((grid, tiles)) => (Some(grid), tiles),
        None => (None, Vec::new()),
    };

    Ok(UpscalePlan {
        stages,
        grid,
        tiles,
        templates,
        using_tiling,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_photo_2x_is_single_stage_untiled() {
        let plan = build_plan(400, 300, Category::Photo, 2, None).unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].scale, 2);
        assert!(!plan.using_tiling);
        assert!(plan.grid.is_none());
        assert!(plan.tiles.is_empty());
    }

    #[test]
    fn photo_24x_is_two_stage_4_6() {
        let plan = build_plan(2000, 2000, Category::Photo, 24, None).unwrap();
        let scales: Vec<u32> = plan.stages.iter().map(|s| s.scale).collect();
        assert_eq!(scales, vec![4, 6]);
        assert!(plan.using_tiling);
    }

    #[test]
    fn art_16x_uses_specialized_model_then_photo() {
        let plan = build_plan(1000, 1000, Category::Art, 16, None).unwrap();
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].model, registry::ART_MODEL_ID);
        assert_eq!(plan.stages[1].model, registry::PHOTO_MODEL_ID);
        assert_eq!(
            plan.stages[1].base_input.get("face_enhance"),
            Some(&serde_json::json!(false))
        );
    }

    #[test]
    fn anime_8x_uses_anime_model_then_photo() {
        let plan = build_plan(800, 1200, Category::Anime, 8, None).unwrap();
        let scales: Vec<u32> = plan.stages.iter().map(|s| s.scale).collect();
        assert_eq!(scales, vec![4, 2]);
        assert_eq!(plan.stages[0].model, registry::ANIME_MODEL_ID);
        assert_eq!(plan.stages[1].model, registry::PHOTO_MODEL_ID);
    }

    #[test]
    fn chain_product_equals_effective_scale() {
        for &target in &VALID_SCALES {
            for category in [Category::Photo, Category::Art, Category::Text, Category::Anime] {
                let plan = build_plan(1600, 900, category, target, None).unwrap();
                let product: u32 = plan.stages.iter().map(|s| s.scale).product();
                assert_eq!(product, target, "category {category:?} target {target}");
            }
        }
    }

    #[test]
    fn tiled_plans_respect_gpu_budget_at_both_stages() {
        let plan = build_plan(2000, 2000, Category::Photo, 24, None).unwrap();
        let grid = plan.grid.unwrap();
        let s1 = plan.stages[0].scale;
        let max_side = plan
            .tiles
            .iter()
            .map(|t| t.width.max(t.height))
            .max()
            .unwrap();
        assert!(max_side <= GPU_BUDGET_SIDE);
        assert!(max_side * s1 <= GPU_BUDGET_SIDE);
        assert_eq!(grid.total_tiles as usize, plan.tiles.len());
    }

    #[test]
    fn template_stage_count_matches_chain() {
        let plan = build_plan(1000, 1000, Category::Art, 16, None).unwrap();
        assert_eq!(plan.templates.len(), plan.stages.len());
        assert!(plan.templates.iter().all(|t| t.split_from_previous == 1));
    }
}
