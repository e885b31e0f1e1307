//! Bit-packed 2D mask.
//!
//! Used for validity masks of warped patches and the "already written"
//! bookkeeping of mosaics. One bit per cell, row-major, LSB first.

use std::ops::Index;

const BITS_PER_WORD: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitBuffer2 {
    words: Vec<u64>,
    width: usize,
    height: usize,
    len: usize,
}

impl BitBuffer2 {
    #[inline]
    pub fn new_filled(width: usize, height: usize, value: bool) -> Self {
        let len = width * height;
        let fill = if value { !0u64 } else { 0u64 };
        let mut buffer = Self {
            words: vec![fill; len.div_ceil(BITS_PER_WORD)],
            width,
            height,
            len,
        };
        buffer.clear_tail();
        buffer
    }

    #[inline]
    pub fn new_default(width: usize, height: usize) -> Self {
        Self::new_filled(width, height, false)
    }

    /// Builds a mask by evaluating `f(x, y)` for every cell.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> bool) -> Self {
        let mut buffer = Self::new_default(width, height);
        for y in 0..height {
            for x in 0..width {
                if f(x, y) {
                    buffer.set_xy(x, y, true);
                }
            }
        }
        buffer
    }

    pub fn from_slice(width: usize, height: usize, data: &[bool]) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length {} does not match dimensions {}x{}",
            data.len(),
            width,
            height
        );
        let mut buffer = Self::new_default(width, height);
        for (i, _) in data.iter().enumerate().filter(|(_, v)| **v) {
            buffer.set(i, true);
        }
        buffer
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        (self.words[idx / BITS_PER_WORD] >> (idx % BITS_PER_WORD)) & 1 != 0
    }

    #[inline]
    pub fn set(&mut self, idx: usize, value: bool) {
        debug_assert!(idx < self.len);
        let bit = 1u64 << (idx % BITS_PER_WORD);
        let word = &mut self.words[idx / BITS_PER_WORD];
        if value {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    #[inline]
    pub fn get_xy(&self, x: usize, y: usize) -> bool {
        debug_assert!(x < self.width && y < self.height);
        self.get(y * self.width + x)
    }

    #[inline]
    pub fn set_xy(&mut self, x: usize, y: usize, value: bool) {
        debug_assert!(x < self.width && y < self.height);
        self.set(y * self.width + x, value);
    }

    #[inline]
    pub fn fill(&mut self, value: bool) {
        self.words.fill(if value { !0u64 } else { 0u64 });
        self.clear_tail();
    }

    #[inline]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    #[inline]
    pub fn all(&self) -> bool {
        self.count_ones() == self.len
    }

    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    // Padding bits past `len` stay zero so word-level counts are exact.
    fn clear_tail(&mut self) {
        let used = self.len % BITS_PER_WORD;
        if used == 0 {
            return;
        }
        if let Some(last) = self.words.last_mut() {
            *last &= (1u64 << used) - 1;
        }
    }
}

impl Index<(usize, usize)> for BitBuffer2 {
    type Output = bool;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        if self.get_xy(x, y) { &true } else { &false }
    }
}

impl From<&BitBuffer2> for Vec<bool> {
    #[inline]
    fn from(buf: &BitBuffer2) -> Self {
        buf.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filled_true_counts_exactly() {
        // 10x10 = 100 bits spans two words; padding must not be counted.
        let buf = BitBuffer2::new_filled(10, 10, true);
        assert_eq!(buf.count_ones(), 100);
        assert!(buf.all());
    }

    #[test]
    fn test_set_get_across_word_boundary() {
        let mut buf = BitBuffer2::new_default(64, 4);
        for idx in [0, 63, 64, 127] {
            buf.set(idx, true);
        }
        assert!(buf.get(63) && buf.get(64));
        assert!(!buf.get(62) && !buf.get(65));
        buf.set(64, false);
        assert!(!buf.get(64));
        assert_eq!(buf.count_ones(), 3);
    }

    #[test]
    fn test_xy_addressing() {
        let mut buf = BitBuffer2::new_default(7, 5);
        buf.set_xy(6, 4, true);
        assert!(buf[(6, 4)]);
        assert!(buf.get(4 * 7 + 6));
        assert!(!buf[(5, 4)]);
    }

    #[test]
    fn test_from_fn_checkerboard() {
        let buf = BitBuffer2::from_fn(4, 4, |x, y| (x + y) % 2 == 0);
        assert_eq!(buf.count_ones(), 8);
        assert!(buf.get_xy(0, 0));
        assert!(!buf.get_xy(1, 0));
    }

    #[test]
    fn test_from_slice_matches_iter() {
        let data = vec![true, false, true, false, false, true];
        let buf = BitBuffer2::from_slice(3, 2, &data);
        let back: Vec<bool> = (&buf).into();
        assert_eq!(back, data);
    }

    #[test]
    #[should_panic(expected = "data length")]
    fn test_from_slice_wrong_length() {
        BitBuffer2::from_slice(2, 2, &[true, false, true]);
    }

    #[test]
    fn test_fill_and_any() {
        let mut buf = BitBuffer2::new_default(3, 3);
        assert!(!buf.any());
        buf.fill(true);
        assert_eq!(buf.count_ones(), 9);
        buf.fill(false);
        assert!(!buf.any());
    }
}
