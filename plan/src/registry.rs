use serde_json::json;

use crate::types::{ART_STAGE_SCALE, Category};

/// Photo-realistic 4x upscaler; accepts a continuous scale parameter up to
/// 10 and an optional GFPGAN face-enhancement pass.
pub const PHOTO_MODEL_ID: &str = "nightmareai/real-esrgan";
const PHOTO_MODEL_VERSION: &str =
    "f121d640bd286e1fdc67f9799164c1d5be36ff74576ee11c803ae5b665dd46aa";

/// Specialized super-resolution model for flat art and text. Runs at exactly
/// 4x and cannot tile large intermediates, so it is only ever placed at
/// stage 1 of a chain.
pub const ART_MODEL_ID: &str = "mv-lab/swin2sr";
const ART_MODEL_VERSION: &str =
    "a01b0512004918ca55d02e554914a9eca63909fa83a29ff0f115c78a7045574f";

/// Anime-tuned Real-ESRGAN checkpoint, 4x native.
pub const ANIME_MODEL_ID: &str = "xinntao/realesrgan";
const ANIME_MODEL_VERSION: &str =
    "1b976a4d456ed9e4d1a846597b7614e79eadad3032e9124fa63859db0fd59b56";

/// Provider-side internal tiling parameter for the photo model. Used when a
/// whole image goes through a single call at a scale the GPU could not
/// otherwise hold.
const PHOTO_TILE_HINT: u32 = 256;

/// A resolved model choice for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub model: String,
    pub version: String,
    /// Input parameters minus the image URL, which is attached at launch.
    pub base_input: serde_json::Value,
}

fn photo_choice(stage_scale: u32, face_enhance: bool, untiled: bool) -> ModelChoice {
    let mut input = json!({
        "scale": stage_scale,
        "face_enhance": face_enhance,
    });
    if untiled && stage_scale > 2 {
        input["tile"] = json!(PHOTO_TILE_HINT);
    }
    ModelChoice {
        model: PHOTO_MODEL_ID.to_string(),
        version: PHOTO_MODEL_VERSION.to_string(),
        base_input: input,
    }
}

fn art_choice() -> ModelChoice {
    ModelChoice {
        model: ART_MODEL_ID.to_string(),
        version: ART_MODEL_VERSION.to_string(),
        base_input: json!({ "task": "classical_sr" }),
    }
}

fn anime_choice(stage_scale: u32) -> ModelChoice {
    ModelChoice {
        model: ANIME_MODEL_ID.to_string(),
        version: ANIME_MODEL_VERSION.to_string(),
        base_input: json!({
            "model_name": "RealESRGAN_x4plus_anime_6B",
            "scale": stage_scale,
        }),
    }
}

/// Select the model for one stage of a chain.
///
/// `orchestrator_tiling` reports whether the orchestrator splits the image
/// itself; when it does not, the photo model gets a provider-side tile hint
/// for stage scales above 2.
pub fn pick_model(
    category: Category,
    stage_scale: u32,
    stage: u32,
    pinned_model: Option<&str>,
    orchestrator_tiling: bool,
) -> ModelChoice {
    if let Some(pin) = pinned_model
        && let Some(choice) = resolve_pin(pin, stage_scale, orchestrator_tiling)
    {
        return choice;
    }

    match category {
        Category::Art | Category::Text => {
            if stage == 1 && stage_scale == ART_STAGE_SCALE {
                art_choice()
            } else {
                // Later stages operate on already-upscaled intermediates the
                // specialized model cannot tile. Face enhancement stays off
                // for non-photographic content.
                photo_choice(stage_scale, false, !orchestrator_tiling)
            }
        }
        Category::Anime => {
            // The anime checkpoint is 4x native and only sees the original
            // pixels at stage 1; upscaled intermediates go to the photo model.
            if stage == 1 && stage_scale <= 4 {
                anime_choice(stage_scale)
            } else {
                photo_choice(stage_scale, false, !orchestrator_tiling)
            }
        }
        Category::Photo => {
            photo_choice(stage_scale, stage_scale <= 4, !orchestrator_tiling)
        }
    }
}

fn resolve_pin(pin: &str, stage_scale: u32, orchestrator_tiling: bool) -> Option<ModelChoice> {
    match pin {
        PHOTO_MODEL_ID => Some(photo_choice(
            stage_scale,
            stage_scale <= 4,
            !orchestrator_tiling,
        )),
        ART_MODEL_ID => {
            if stage_scale == ART_STAGE_SCALE {
                Some(art_choice())
            } else {
                tracing::warn!(
                    model = %pin,
                    stage_scale,
                    "pinned model only supports 4x stages, ignoring pin"
                );
                None
            }
        }
        ANIME_MODEL_ID => {
            if stage_scale <= 4 {
                Some(anime_choice(stage_scale))
            } else {
                tracing::warn!(
                    model = %pin,
                    stage_scale,
                    "pinned model does not support this stage scale, ignoring pin"
                );
                None
            }
        }
        other => {
            tracing::warn!(model = %other, "unknown pinned model, ignoring pin");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_enables_face_enhance_only_at_low_stage_scales() {
        let low = pick_model(Category::Photo, 4, 1, None, true);
        assert_eq!(low.base_input["face_enhance"], serde_json::json!(true));

        let high = pick_model(Category::Photo, 8, 1, None, true);
        assert_eq!(high.base_input["face_enhance"], serde_json::json!(false));
    }

    #[test]
    fn untiled_photo_above_2x_carries_tile_hint() {
        let hinted = pick_model(Category::Photo, 8, 1, None, false);
        assert_eq!(hinted.base_input["tile"], serde_json::json!(256));

        let plain = pick_model(Category::Photo, 2, 1, None, false);
        assert!(plain.base_input.get("tile").is_none());

        let tiled = pick_model(Category::Photo, 8, 1, None, true);
        assert!(tiled.base_input.get("tile").is_none());
    }

    #[test]
    fn art_uses_specialized_model_only_at_stage_one_4x() {
        assert_eq!(pick_model(Category::Art, 4, 1, None, true).model, ART_MODEL_ID);
        assert_eq!(pick_model(Category::Art, 2, 2, None, true).model, PHOTO_MODEL_ID);
        assert_eq!(pick_model(Category::Art, 4, 2, None, true).model, PHOTO_MODEL_ID);
    }

    #[test]
    fn text_behaves_like_art() {
        assert_eq!(pick_model(Category::Text, 4, 1, None, true).model, ART_MODEL_ID);
    }

    #[test]
    fn anime_runs_only_at_stage_one() {
        assert_eq!(pick_model(Category::Anime, 4, 1, None, true).model, ANIME_MODEL_ID);
        assert_eq!(pick_model(Category::Anime, 5, 2, None, true).model, PHOTO_MODEL_ID);
        // stage 2 of an 8x chain operates on an upscaled intermediate
        assert_eq!(pick_model(Category::Anime, 2, 2, None, true).model, PHOTO_MODEL_ID);
    }

    #[test]
    fn invalid_pin_is_ignored() {
        let choice = pick_model(Category::Photo, 8, 1, Some(ART_MODEL_ID), true);
        assert_eq!(choice.model, PHOTO_MODEL_ID);

        let choice = pick_model(Category::Photo, 4, 1, Some("nope/unknown"), true);
        assert_eq!(choice.model, PHOTO_MODEL_ID);
    }

    #[test]
    fn valid_pin_overrides_category() {
        let choice = pick_model(Category::Photo, 4, 1, Some(ANIME_MODEL_ID), true);
        assert_eq!(choice.model, ANIME_MODEL_ID);
    }
}
