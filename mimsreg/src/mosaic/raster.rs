//! Integer output rasters with explicit bit depth.

use common::Buffer2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BitDepth {
    U8,
    U16,
}

/// Row-major canvas raster stored at the smallest depth that holds its range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Raster {
    U8(Buffer2<u8>),
    U16(Buffer2<u16>),
}

/// Result of quantizing float values into a [`Raster`].
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub raster: Raster,
    /// Values that were negative, above 65535 or not finite.
    pub clamped: usize,
}

impl Raster {
    /// Rounds to the nearest integer and saturates to `[0, 65535]`.
    /// Non-finite values become 0.
    pub fn quantize(values: &Buffer2<f32>) -> Quantized {
        let mut clamped = 0usize;
        let ints: Vec<u16> = values
            .iter()
            .map(|&v| {
                if !v.is_finite() {
                    clamped += 1;
                    return 0;
                }
                let r = v.round();
                if r < 0.0 || r > u16::MAX as f32 {
                    clamped += 1;
                }
                r.clamp(0.0, u16::MAX as f32) as u16
            })
            .collect();
        Quantized {
            raster: Self::from_u16(Buffer2::new(values.width(), values.height(), ints)),
            clamped,
        }
    }

    /// Narrows to u8 when every value fits.
    pub fn from_u16(values: Buffer2<u16>) -> Self {
        let max = values.iter().copied().max().unwrap_or(0);
        if max <= u8::MAX as u16 {
            Raster::U8(values.map(|&v| v as u8))
        } else {
            Raster::U16(values)
        }
    }

    pub fn depth(&self) -> BitDepth {
        match self {
            Raster::U8(_) => BitDepth::U8,
            Raster::U16(_) => BitDepth::U16,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Raster::U8(b) => b.width(),
            Raster::U16(b) => b.width(),
        }
    }

    pub fn height(&self) -> usize {
        match self {
            Raster::U8(b) => b.height(),
            Raster::U16(b) => b.height(),
        }
    }

    /// Value at flat index `idx`, widened.
    #[inline]
    pub fn value(&self, idx: usize) -> u16 {
        match self {
            Raster::U8(b) => b[idx] as u16,
            Raster::U16(b) => b[idx],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u16 {
        self.value(y * self.width() + x)
    }

    pub fn to_u16(&self) -> Buffer2<u16> {
        match self {
            Raster::U8(b) => b.map(|&v| v as u16),
            Raster::U16(b) => b.clone(),
        }
    }

    /// Little-endian bytes, row-major.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Raster::U8(b) => b.pixels().to_vec(),
            Raster::U16(b) => b.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_range_narrows_to_u8() {
        let values = Buffer2::new(2, 2, vec![0.0, 12.4, 254.6, 100.0]);
        let q = Raster::quantize(&values);
        assert_eq!(q.raster.depth(), BitDepth::U8);
        assert_eq!(q.clamped, 0);
        assert_eq!(q.raster.get(1, 0), 12);
        assert_eq!(q.raster.get(0, 1), 255);
    }

    #[test]
    fn test_large_values_use_u16_and_saturate() {
        let values = Buffer2::new(4, 1, vec![300.0, 70_000.0, -5.0, f32::NAN]);
        let q = Raster::quantize(&values);
        assert_eq!(q.raster.depth(), BitDepth::U16);
        assert_eq!(q.clamped, 3);
        assert_eq!(q.raster.to_u16().pixels(), &[300, 65535, 0, 0]);
    }

    #[test]
    fn test_bytes_are_little_endian() {
        let raster = Raster::from_u16(Buffer2::new(2, 1, vec![0x0102, 0xFFFF]));
        assert_eq!(raster.to_bytes(), vec![0x02, 0x01, 0xFF, 0xFF]);
        assert_eq!(BitDepth::U16.to_string(), "u16");
    }
}
