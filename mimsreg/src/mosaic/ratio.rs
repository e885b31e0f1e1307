//! Synthetic ratio channels derived from two base mosaics.

use common::Buffer2;
use hashbrown::HashMap;

use crate::mosaic::raster::Raster;
use crate::registration::config::RatioDefinition;
use crate::registration::error::RegistrationError;

/// `round(num / den * scale)` per pixel. `den == 0` gives 0; non-finite or
/// above `ceiling` gives `ceiling`.
pub fn ratio_value(numerator: f64, denominator: f64, scale: f64, ceiling: f64) -> u16 {
    if denominator == 0.0 {
        return 0;
    }
    let r = numerator / denominator * scale;
    if !r.is_finite() || r > ceiling {
        return ceiling as u16;
    }
    r.round().max(0.0) as u16
}

/// Per-pixel ratio mosaic. Bit depth follows [`Raster::from_u16`], so a
/// ratio whose values all fit in 8 bits is stored as `U8`.
pub fn compute_ratio(
    name: &str,
    numerator: &Raster,
    denominator: &Raster,
    scale: f64,
    ceiling: f64,
) -> Result<Raster, RegistrationError> {
    if numerator.width() != denominator.width() || numerator.height() != denominator.height() {
        return Err(RegistrationError::CompositeChannel {
            channel: name.to_string(),
            message: format!(
                "base mosaics differ in size: {}x{} vs {}x{}",
                numerator.width(),
                numerator.height(),
                denominator.width(),
                denominator.height()
            ),
        });
    }
    let (w, h) = (numerator.width(), numerator.height());
    let values = (0..w * h)
        .map(|i| {
            ratio_value(
                numerator.value(i) as f64,
                denominator.value(i) as f64,
                scale,
                ceiling,
            )
        })
        .collect();
    Ok(Raster::from_u16(Buffer2::new(w, h, values)))
}

/// First numerator and denominator candidates present in `available`.
pub fn resolve_bases<'a, V>(
    definition: &'a RatioDefinition,
    available: &HashMap<String, V>,
) -> Option<(&'a str, &'a str)> {
    let pick = |candidates: &'a [String]| {
        candidates
            .iter()
            .find(|c| available.contains_key(c.as_str()))
            .map(String::as_str)
    };
    Some((pick(&definition.numerator)?, pick(&definition.denominator)?))
}
