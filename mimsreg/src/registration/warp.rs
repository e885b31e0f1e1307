//! Rasterizes native channels through a [`TransformChain`] onto the canvas.
//!
//! The sampling positions depend only on the chain and the footprint, so they
//! are computed once per image in a [`WarpMap`] and reused for every channel.

use common::{BitBuffer2, Buffer2};
use rayon::prelude::*;

use crate::geometry::{PixelBox, Point2D, RasterIndex, local_to_canvas, pixel_center};
use crate::registration::canvas::CanvasGeometry;
use crate::registration::config::InterpolationMethod;
use crate::registration::error::RegistrationError;
use crate::registration::interpolation::{inside_extent, sample};
use crate::registration::transform::TransformChain;

const ROWS_PER_CHUNK: usize = 16;

/// One warped channel: intensities and validity over `bbox` (canvas pixels).
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPatch {
    pub channel: String,
    pub data: Buffer2<f32>,
    pub valid: BitBuffer2,
    pub bbox: PixelBox,
}

impl ChannelPatch {
    /// Canvas-space top-left offset.
    pub fn offset(&self) -> (i64, i64) {
        (self.bbox.x0, self.bbox.y0)
    }

    pub fn valid_count(&self) -> usize {
        self.valid.count_ones()
    }
}

/// Mirrored-native sampling position of every cell in the clamped box.
#[derive(Debug, Clone)]
pub struct WarpMap {
    bbox: PixelBox,
    sources: Buffer2<Point2D>,
    valid: BitBuffer2,
    mirrored: bool,
    native_width: usize,
    native_height: usize,
}

impl WarpMap {
    /// For each output cell: canvas centre, inverse local deformation,
    /// inverse similarity. A cell is valid when that point lies inside the
    /// native extent.
    pub fn build(chain: &TransformChain, geometry: &CanvasGeometry) -> Self {
        let bbox = geometry.clamped;
        let width = geometry.raster_width();
        let height = geometry.raster_height();
        let origin = (bbox.x0, bbox.y0);
        let (nw, nh) = (chain.native_width, chain.native_height);

        let mut sources = vec![Point2D::ZERO; width * height];
        let mut inside = vec![false; width * height];
        if width > 0 {
            sources
                .par_chunks_mut(width * ROWS_PER_CHUNK)
                .zip(inside.par_chunks_mut(width * ROWS_PER_CHUNK))
                .enumerate()
                .for_each(|(chunk_idx, (src_chunk, in_chunk))| {
                    let start_row = chunk_idx * ROWS_PER_CHUNK;
                    for (i, (src, ok)) in
                        src_chunk.iter_mut().zip(in_chunk.iter_mut()).enumerate()
                    {
                        let local =
                            pixel_center(RasterIndex::new(start_row + i / width, i % width));
                        let p = chain.canvas_to_mirrored(local_to_canvas(local, origin));
                        *src = p;
                        *ok = inside_extent(p, nw, nh);
                    }
                });
        }

        Self {
            bbox,
            sources: Buffer2::new(width, height, sources),
            valid: BitBuffer2::from_slice(width, height, &inside),
            mirrored: chain.mirrored,
            native_width: nw,
            native_height: nh,
        }
    }

    pub fn bbox(&self) -> PixelBox {
        self.bbox
    }

    pub fn valid(&self) -> &BitBuffer2 {
        &self.valid
    }

    /// Warps one native channel. Invalid cells are zero.
    pub fn apply(
        &self,
        channel: &str,
        native: &Buffer2<f32>,
        method: InterpolationMethod,
    ) -> Result<ChannelPatch, RegistrationError> {
        if native.width() == 0 || native.height() == 0 {
            return Err(RegistrationError::EmptyChannel(channel.to_string()));
        }
        if native.width() != self.native_width || native.height() != self.native_height {
            return Err(RegistrationError::InvalidFile(format!(
                "channel '{}' is {}x{}, image is {}x{}",
                channel,
                native.width(),
                native.height(),
                self.native_width,
                self.native_height
            )));
        }

        // Sampling happens in mirrored space, so the raster is flipped to match.
        let flipped;
        let source = if self.mirrored {
            flipped = native.flipped_horizontal();
            &flipped
        } else {
            native
        };

        let width = self.sources.width();
        let mut data = vec![0.0f32; self.sources.len()];
        if width > 0 {
            data.par_chunks_mut(width * ROWS_PER_CHUNK)
                .enumerate()
                .for_each(|(chunk_idx, chunk)| {
                    let base = chunk_idx * ROWS_PER_CHUNK * width;
                    for (i, out) in chunk.iter_mut().enumerate() {
                        let idx = base + i;
                        if self.valid.get(idx) {
                            *out = sample(source, self.sources[idx], method);
                        }
                    }
                });
        }

        Ok(ChannelPatch {
            channel: channel.to_string(),
            data: Buffer2::new(width, self.sources.height(), data),
            valid: self.valid.clone(),
            bbox: self.bbox,
        })
    }
}

/// Builds the map and warps a single channel.
pub fn warp_channel(
    chain: &TransformChain,
    geometry: &CanvasGeometry,
    channel: &str,
    native: &Buffer2<f32>,
    method: InterpolationMethod,
) -> Result<ChannelPatch, RegistrationError> {
    WarpMap::build(chain, geometry).apply(channel, native, method)
}

#[cfg(test)]
mod tests;
