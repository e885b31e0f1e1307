//! Separable Gaussian smoothing and central-difference gradients.

use common::Buffer2;
use rayon::prelude::*;

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let d = i as f64 - radius as f64;
            (-(d * d) / denom).exp() as f32
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Gaussian blur with edge replication. `sigma <= 0` returns a copy.
pub fn gaussian_blur(input: &Buffer2<f32>, sigma: f64) -> Buffer2<f32> {
    if sigma <= 0.0 || input.is_empty() {
        return input.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let width = input.width();
    let height = input.height();

    let mut horizontal: Buffer2<f32> = Buffer2::new_default(width, height);
    horizontal
        .pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let src = input.row(y);
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let sx = (x as isize + k as isize - radius).clamp(0, width as isize - 1);
                        w * src[sx as usize]
                    })
                    .sum();
            }
        });

    let mut output = Buffer2::new_default(width, height);
    output
        .pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let sy = (y as isize + k as isize - radius).clamp(0, height as isize - 1);
                        w * horizontal[(x, sy as usize)]
                    })
                    .sum();
            }
        });
    output
}

/// Central differences (one-sided at the borders). Returns `(d/dx, d/dy)`.
pub fn gradient(input: &Buffer2<f32>) -> (Buffer2<f32>, Buffer2<f32>) {
    let width = input.width();
    let height = input.height();
    let at = |x: isize, y: isize| {
        let cx = x.clamp(0, width as isize - 1) as usize;
        let cy = y.clamp(0, height as isize - 1) as usize;
        input[(cx, cy)]
    };
    let span = |i: usize, n: usize| -> f32 {
        if n < 2 || i == 0 || i == n - 1 {
            1.0
        } else {
            2.0
        }
    };

    let gx = Buffer2::from_fn(width, height, |x, y| {
        let (xi, yi) = (x as isize, y as isize);
        (at(xi + 1, yi) - at(xi - 1, yi)) / span(x, width)
    });
    let gy = Buffer2::from_fn(width, height, |x, y| {
        let (xi, yi) = (x as isize, y as isize);
        (at(xi, yi + 1) - at(xi, yi - 1)) / span(y, height)
    });
    (gx, gy)
}
