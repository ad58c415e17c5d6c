//! Classifier-free guidance for the denoiser.

use ndarray::{Array4, Zip};

/// Default guidance scale for diffusion requests.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 15.0;

/// Lowest accepted scale (no guidance).
pub const MIN_GUIDANCE_SCALE: f32 = 1.0;

/// Highest accepted scale.
pub const MAX_GUIDANCE_SCALE: f32 = 30.0;

/// Combines conditional and unconditional predictions:
/// `guided = uncond + scale * (cond - uncond)`.
pub fn apply_cfg(cond: &Array4<f32>, uncond: &Array4<f32>, scale: f32) -> Array4<f32> {
    let mut guided = Array4::zeros(cond.raw_dim());
    Zip::from(&mut guided)
        .and(cond)
        .and(uncond)
        .for_each(|g, &c, &u| *g = u + scale * (c - u));
    guided
}

/// Range check for a requested scale. Returns a message for invalid values.
pub fn validate_guidance_scale(scale: f32) -> Option<String> {
    if scale.is_nan() || scale.is_infinite() {
        Some("guidance_scale must be finite".to_string())
    } else if !(MIN_GUIDANCE_SCALE..=MAX_GUIDANCE_SCALE).contains(&scale) {
        Some(format!(
            "guidance_scale must be {MIN_GUIDANCE_SCALE}-{MAX_GUIDANCE_SCALE}, got {scale}"
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_one_is_conditional() {
        let cond = Array4::from_elem((1, 2, 2, 2), 1.0f32);
        let uncond = Array4::from_elem((1, 2, 2, 2), 0.25f32);
        let guided = apply_cfg(&cond, &uncond, 1.0);
        assert!((guided[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scale_amplifies_difference() {
        let cond = Array4::from_elem((1, 2, 2, 2), 1.0f32);
        let uncond = Array4::from_elem((1, 2, 2, 2), 0.0f32);
        let guided = apply_cfg(&cond, &uncond, DEFAULT_GUIDANCE_SCALE);
        assert!((guided[[0, 0, 0, 0]] - 15.0).abs() < 1e-5);
    }

    #[test]
    fn validation_bounds() {
        assert!(validate_guidance_scale(1.0).is_none());
        assert!(validate_guidance_scale(15.0).is_none());
        assert!(validate_guidance_scale(30.0).is_none());
        assert!(validate_guidance_scale(0.9).is_some());
        assert!(validate_guidance_scale(30.1).is_some());
        assert!(validate_guidance_scale(f32::NAN).is_some());
    }
}
