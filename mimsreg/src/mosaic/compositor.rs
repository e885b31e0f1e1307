//! First-valid-wins stitching of channel patches into a canvas mosaic.

use common::{BitBuffer2, Buffer2};

use crate::geometry::CanvasSize;
use crate::mosaic::raster::Raster;
use crate::registration::error::RegistrationError;
use crate::registration::warp::ChannelPatch;

/// A canvas-sized channel after compositing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMosaic {
    pub channel: String,
    pub raster: Raster,
    /// Cells written by some patch.
    pub coverage: BitBuffer2,
}

/// Merges `patches` in order. A canvas cell takes the value of the first
/// patch that is valid there; later patches never overwrite it.
///
/// Fails without producing anything if a patch belongs to another channel or
/// its buffers disagree with its box.
pub fn composite_channel(
    channel: &str,
    canvas: CanvasSize,
    patches: &[&ChannelPatch],
) -> Result<ChannelMosaic, RegistrationError> {
    let mut values = Buffer2::<f32>::new_default(canvas.width, canvas.height);
    let mut filled = BitBuffer2::new_default(canvas.width, canvas.height);
    let bounds = canvas.bounds();

    for patch in patches {
        check_patch(channel, patch)?;
        let visible = patch.bbox.intersect(&bounds);
        if visible.is_empty() {
            continue;
        }
        let pw = patch.data.width();
        for cy in visible.y0..visible.y1 {
            let py = (cy - patch.bbox.y0) as usize;
            for cx in visible.x0..visible.x1 {
                let px = (cx - patch.bbox.x0) as usize;
                if !patch.valid.get(py * pw + px) {
                    continue;
                }
                let dst = cy as usize * canvas.width + cx as usize;
                if filled.get(dst) {
                    continue;
                }
                values[dst] = patch.data[(px, py)];
                filled.set(dst, true);
            }
        }
    }

    let quantized = Raster::quantize(&values);
    if quantized.clamped > 0 {
        tracing::warn!(
            channel,
            clamped = quantized.clamped,
            "Mosaic values outside [0, 65535] were saturated"
        );
    }
    tracing::debug!(
        channel,
        patches = patches.len(),
        covered = filled.count_ones(),
        depth = %quantized.raster.depth(),
        "Channel composited"
    );

    Ok(ChannelMosaic {
        channel: channel.to_string(),
        raster: quantized.raster,
        coverage: filled,
    })
}

fn check_patch(channel: &str, patch: &ChannelPatch) -> Result<(), RegistrationError> {
    if patch.channel != channel {
        return Err(RegistrationError::CompositeChannel {
            channel: channel.to_string(),
            message: format!("received a patch of channel '{}'", patch.channel),
        });
    }
    let (w, h) = (patch.bbox.width() as usize, patch.bbox.height() as usize);
    if patch.data.width() != w
        || patch.data.height() != h
        || patch.valid.width() != w
        || patch.valid.height() != h
    {
        return Err(RegistrationError::CompositeChannel {
            channel: channel.to_string(),
            message: format!(
                "patch buffers {}x{} do not match box {}",
                patch.data.width(),
                patch.data.height(),
                patch.bbox
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PixelBox;

    fn patch(channel: &str, bbox: PixelBox, value: f32) -> ChannelPatch {
        let (w, h) = (bbox.width() as usize, bbox.height() as usize);
        ChannelPatch {
            channel: channel.to_string(),
            data: Buffer2::new_filled(w, h, value),
            valid: BitBuffer2::new_filled(w, h, true),
            bbox,
        }
    }

    #[test]
    fn test_first_valid_patch_wins() {
        let a = patch("12C", PixelBox::new(0, 0, 6, 6), 10.0);
        let b = patch("12C", PixelBox::new(3, 3, 9, 9), 20.0);
        let canvas = CanvasSize::new(10, 10);

        let ab = composite_channel("12C", canvas, &[&a, &b]).unwrap();
        assert_eq!(ab.raster.get(4, 4), 10);
        assert_eq!(ab.raster.get(8, 8), 20);
        assert_eq!(ab.raster.get(9, 9), 0);
        assert!(!ab.coverage.get_xy(9, 9));

        let ba = composite_channel("12C", canvas, &[&b, &a]).unwrap();
        assert_eq!(ba.raster.get(4, 4), 20);
        assert_eq!(ba.raster.get(1, 1), 10);
    }

    #[test]
    fn test_invalid_cells_fall_through_to_later_patches() {
        let mut a = patch("12C", PixelBox::new(0, 0, 4, 4), 5.0);
        a.valid.set_xy(1, 1, false);
        a.data[(1, 1)] = 0.0;
        let b = patch("12C", PixelBox::new(0, 0, 4, 4), 7.0);

        let mosaic = composite_channel("12C", CanvasSize::new(4, 4), &[&a, &b]).unwrap();
        assert_eq!(mosaic.raster.get(1, 1), 7);
        assert_eq!(mosaic.raster.get(0, 0), 5);
        assert!(mosaic.coverage.all());
    }

    #[test]
    fn test_patch_partly_off_canvas_is_cropped() {
        let p = patch("14N 12C", PixelBox::new(-2, 8, 3, 14), 300.0);
        let mosaic = composite_channel("14N 12C", CanvasSize::new(10, 10), &[&p]).unwrap();
        assert_eq!(mosaic.raster.get(0, 8), 300);
        assert_eq!(mosaic.raster.get(2, 9), 300);
        assert_eq!(mosaic.raster.get(3, 9), 0);
        assert_eq!(mosaic.coverage.count_ones(), 3 * 2);
    }

    #[test]
    fn test_values_saturate() {
        let p = patch("12C", PixelBox::new(0, 0, 2, 2), 90_000.0);
        let mosaic = composite_channel("12C", CanvasSize::new(2, 2), &[&p]).unwrap();
        assert_eq!(mosaic.raster.get(1, 1), 65535);
    }

    #[test]
    fn test_mismatched_patch_fails_whole_channel() {
        let good = patch("12C", PixelBox::new(0, 0, 2, 2), 1.0);
        let other = patch("13C", PixelBox::new(0, 0, 2, 2), 1.0);
        let err = composite_channel("12C", CanvasSize::new(4, 4), &[&good, &other]).unwrap_err();
        assert!(matches!(err, RegistrationError::CompositeChannel { .. }));

        let mut broken = patch("12C", PixelBox::new(0, 0, 2, 2), 1.0);
        broken.bbox = PixelBox::new(0, 0, 3, 2);
        assert!(composite_channel("12C", CanvasSize::new(4, 4), &[&broken]).is_err());
    }
}
