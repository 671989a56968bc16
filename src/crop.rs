use crate::transform::{FitMode, Gravity, TransformOptions};

/// Transform options that crop a source of any aspect ratio to exactly fill
/// the target viewport. Subject-aware gravity keeps the photographic subject
/// in frame even on aggressive ratio changes (16:9 desktop art on a 9:19.5
/// phone).
pub fn crop_for(width: f64, height: f64) -> TransformOptions {
    TransformOptions {
        width: Some(round_dimension(width)),
        height: Some(round_dimension(height)),
        fit: Some(FitMode::Fill),
        gravity: Some(Gravity::AutoSubject),
        auto_quality: true,
        auto_format: true,
        ..TransformOptions::default()
    }
}

fn round_dimension(value: f64) -> u32 {
    if !value.is_finite() || value < 1.0 {
        return 1;
    }
    value.round().min(u32::MAX as f64) as u32
}
