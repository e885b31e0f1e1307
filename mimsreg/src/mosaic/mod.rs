//! Canvas-wide mosaics per channel plus derived ratio channels.

pub mod compositor;
pub mod ratio;
pub mod raster;

use hashbrown::HashMap;
use rayon::prelude::*;

use crate::geometry::CanvasSize;
use crate::registration::config::MosaicConfig;
use crate::registration::error::RegistrationError;
use crate::registration::warp::ChannelPatch;

pub use compositor::{ChannelMosaic, composite_channel};
pub use ratio::{compute_ratio, ratio_value, resolve_bases};
pub use raster::{BitDepth, Quantized, Raster};

/// A channel that produced no mosaic, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedChannel {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompositeOutcome {
    /// Base channels in input order, then ratio channels in definition order.
    pub mosaics: Vec<(String, Raster)>,
    pub skipped: Vec<SkippedChannel>,
}

impl CompositeOutcome {
    pub fn mosaic(&self, channel: &str) -> Option<&Raster> {
        self.mosaics
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, raster)| raster)
    }
}

/// Composites every base channel, then derives the configured ratios.
///
/// `channels` pairs each channel name with its patches in set order. A failure
/// in one channel skips only that channel.
pub fn composite_set(
    canvas: CanvasSize,
    channels: &[(String, Vec<ChannelPatch>)],
    config: &MosaicConfig,
) -> CompositeOutcome {
    let results: Vec<(String, Result<ChannelMosaic, RegistrationError>)> = channels
        .par_iter()
        .map(|(name, patches)| {
            let refs: Vec<&ChannelPatch> = patches.iter().collect();
            (name.clone(), composite_channel(name, canvas, &refs))
        })
        .collect();

    let mut outcome = CompositeOutcome::default();
    let mut base: HashMap<String, Raster> = HashMap::new();
    for (name, result) in results {
        match result {
            Ok(mosaic) => {
                base.insert(name.clone(), mosaic.raster.clone());
                outcome.mosaics.push((name, mosaic.raster));
            }
            Err(err) => {
                tracing::warn!(channel = %name, "Skipping channel: {}", err);
                outcome.skipped.push(SkippedChannel {
                    channel: name,
                    reason: err.to_string(),
                });
            }
        }
    }

    for definition in &config.ratios {
        let Some((num, den)) = resolve_bases(definition, &base) else {
            tracing::info!(
                ratio = %definition.name,
                "Ratio skipped: base channels not present"
            );
            outcome.skipped.push(SkippedChannel {
                channel: definition.name.clone(),
                reason: format!(
                    "no base channel among {:?} / {:?}",
                    definition.numerator, definition.denominator
                ),
            });
            continue;
        };
        let (Some(num_raster), Some(den_raster)) = (base.get(num), base.get(den)) else {
            continue;
        };
        match compute_ratio(
            &definition.name,
            num_raster,
            den_raster,
            config.ratio_scale,
            config.ratio_ceiling,
        ) {
            Ok(raster) => {
                tracing::debug!(ratio = %definition.name, num, den, "Ratio channel derived");
                outcome.mosaics.push((definition.name.clone(), raster));
            }
            Err(err) => {
                tracing::warn!(ratio = %definition.name, "Skipping ratio: {}", err);
                outcome.skipped.push(SkippedChannel {
                    channel: definition.name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    outcome
}
