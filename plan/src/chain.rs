use crate::types::{Category, PlanError, VALID_SCALES};

/// Decompose a target scale into per-stage scale factors.
///
/// Chains are at most two stages: taller chains compound GPU memory growth
/// and stretch the reconciler's visibility window past what the provider's
/// webhook retention tolerates, so targets above 24 are rejected upstream.
///
/// Art and text chains lead with a 4x pass for the specialized model, which
/// only runs at exactly that scale; every later stage operates on an
/// already-upscaled intermediate and goes to the photo model.
pub fn plan_chain(category: Category, target: u32) -> Result<Vec<u32>, PlanError> {
    if !VALID_SCALES.contains(&target) {
        return Err(PlanError::InvalidScale(target));
    }

    let chain = match category {
        Category::Art | Category::Text => match target {
            2 => vec![2],
            4 => vec![4],
            8 => vec![4, 2],
            10 => vec![2, 5],
            12 => vec![4, 3],
            16 => vec![4, 4],
            20 => vec![4, 5],
            24 => vec![4, 6],
            other => return Err(PlanError::InvalidScale(other)),
        },
        Category::Photo | Category::Anime => match target {
            2 => vec![2],
            4 => vec![4],
            8 => vec![8],
            10 => vec![2, 5],
            12 => vec![3, 4],
            16 => vec![4, 4],
            20 => vec![4, 5],
            24 => vec![4, 6],
            other => return Err(PlanError::InvalidScale(other)),
        },
    };

    debug_assert_eq!(chain.iter().product::<u32>(), target);
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ART_STAGE_SCALE, PHOTO_STAGE_CAP};

    #[test]
    fn every_chain_multiplies_to_its_target() {
        for &target in &VALID_SCALES {
            for category in [Category::Photo, Category::Art, Category::Text, Category::Anime] {
                let chain = plan_chain(category, target).unwrap();
                assert_eq!(
                    chain.iter().product::<u32>(),
                    target,
                    "{category:?} {target}"
                );
            }
        }
    }

    #[test]
    fn chains_never_exceed_two_stages() {
        for &target in &VALID_SCALES {
            for category in [Category::Photo, Category::Art, Category::Text, Category::Anime] {
                assert!(plan_chain(category, target).unwrap().len() <= 2);
            }
        }
    }

    #[test]
    fn single_stage_up_to_eight_for_photo() {
        assert_eq!(plan_chain(Category::Photo, 2).unwrap(), vec![2]);
        assert_eq!(plan_chain(Category::Photo, 4).unwrap(), vec![4]);
        assert_eq!(plan_chain(Category::Photo, 8).unwrap(), vec![8]);
    }

    #[test]
    fn photo_stages_respect_the_per_call_cap() {
        for &target in &VALID_SCALES {
            for &s in plan_chain(Category::Photo, target).unwrap().iter() {
                assert!(s <= PHOTO_STAGE_CAP);
            }
        }
    }

    #[test]
    fn art_chains_lead_with_the_specialized_scale() {
        for target in [8, 12, 16, 20, 24] {
            let chain = plan_chain(Category::Art, target).unwrap();
            assert_eq!(chain[0], ART_STAGE_SCALE, "target {target}");
        }
        // 10 has no integer decomposition with a leading 4; it takes the
        // photo-path chain and skips the specialized model entirely.
        assert_eq!(plan_chain(Category::Art, 10).unwrap(), vec![2, 5]);
    }

    #[test]
    fn art_eight_splits_into_4_then_2() {
        assert_eq!(plan_chain(Category::Art, 8).unwrap(), vec![4, 2]);
    }

    #[test]
    fn unsupported_scales_are_rejected() {
        for target in [0, 1, 3, 5, 6, 7, 9, 28, 32, 48] {
            assert!(plan_chain(Category::Photo, target).is_err(), "{target}");
        }
    }
}
