//! Synthetic data generators for tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use common::Buffer2;
use glam::DVec2;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::geometry::Point2D;
use crate::landmarks::Polygon;
use crate::orchestrator::{ChannelSource, InMemoryChannelSource};
use crate::registration::ChannelSourceError;

/// Initialize tracing for tests. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Tiny deterministic generator so tests do not depend on a RNG crate.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// `n` points spread over the inner 80% of a `width x height` area.
pub fn scattered_points(n: usize, width: f64, height: f64, seed: u64) -> Vec<Point2D> {
    let mut rng = Lcg::new(seed);
    (0..n)
        .map(|_| {
            DVec2::new(
                width * (0.1 + 0.8 * rng.next_f64()),
                height * (0.1 + 0.8 * rng.next_f64()),
            )
        })
        .collect()
}

pub fn map_points(points: &[Point2D], f: impl Fn(Point2D) -> Point2D) -> Vec<Point2D> {
    points.iter().map(|&p| f(p)).collect()
}

/// `n` irregular 8-vertex blobs laid out left to right across the area.
pub fn blob_polygons(n: usize, width: f64, height: f64, seed: u64) -> Vec<Polygon> {
    let mut rng = Lcg::new(seed);
    let radius = (width / (2.5 * n as f64)).min(height / 5.0);
    (0..n)
        .map(|i| {
            let center = DVec2::new(
                width * (i as f64 + 0.5) / n as f64,
                height * (0.35 + 0.3 * rng.next_f64()),
            );
            let vertices = (0..8)
                .map(|k| {
                    let angle = std::f64::consts::TAU * k as f64 / 8.0;
                    let r = radius * (0.7 + 0.3 * rng.next_f64());
                    center + r * DVec2::new(angle.cos(), angle.sin())
                })
                .collect();
            Polygon::new(vertices)
        })
        .collect()
}

/// Smooth, strictly positive test image.
pub fn gradient_raster(width: usize, height: usize) -> Buffer2<f32> {
    Buffer2::from_fn(width, height, |x, y| 10.0 + x as f32 + 2.0 * y as f32)
}

pub fn constant_raster(width: usize, height: usize, value: f32) -> Buffer2<f32> {
    Buffer2::new_filled(width, height, value)
}

/// Fails the first `failures` loads of every channel with a transient error.
pub struct FlakyChannelSource {
    pub inner: InMemoryChannelSource,
    failures: u32,
    calls: Mutex<HashMap<String, u32>>,
}

impl FlakyChannelSource {
    pub fn new(inner: InMemoryChannelSource, failures: u32) -> Self {
        Self {
            inner,
            failures,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self, channel: &str) -> u32 {
        self.calls.lock().get(channel).copied().unwrap_or(0)
    }
}

impl ChannelSource for FlakyChannelSource {
    fn load_channel(
        &self,
        path: &Path,
        channel: &str,
    ) -> Result<Buffer2<f32>, ChannelSourceError> {
        let call = {
            let mut calls = self.calls.lock();
            let entry = calls.entry(channel.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if call <= self.failures {
            return Err(ChannelSourceError::Transient {
                channel: channel.to_string(),
                message: format!("simulated timeout #{call}"),
            });
        }
        self.inner.load_channel(path, channel)
    }
}

/// Blocks loads of one path until [`GatedChannelSource::open`] is called.
pub struct GatedChannelSource {
    pub inner: InMemoryChannelSource,
    gated: PathBuf,
    state: Mutex<(bool, bool)>,
    changed: Condvar,
}

impl GatedChannelSource {
    pub fn new(
        inner: InMemoryChannelSource,
        gated: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner,
            gated: gated.into(),
            state: Mutex::new((false, false)),
            changed: Condvar::new(),
        }
    }

    /// Waits until some load of the gated path is blocked.
    pub fn wait_entered(&self) {
        let mut state = self.state.lock();
        while !state.0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn open(&self) {
        self.state.lock().1 = true;
        self.changed.notify_all();
    }
}

impl ChannelSource for GatedChannelSource {
    fn load_channel(
        &self,
        path: &Path,
        channel: &str,
    ) -> Result<Buffer2<f32>, ChannelSourceError> {
        if path == self.gated {
            let mut state = self.state.lock();
            state.0 = true;
            self.changed.notify_all();
            while !state.1 {
                self.changed.wait(&mut state);
            }
        }
        self.inner.load_channel(path, channel)
    }
}
