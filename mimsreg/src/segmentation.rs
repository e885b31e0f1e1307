//! Segmentation assistant seam.
//!
//! The assistant itself is opaque: it prepares a predictor for an image and
//! turns prompt points into polygons. Preparing is expensive, so predictors
//! are kept in a bounded [`PredictorCache`] owned by whoever serves the
//! requests, instead of a process-wide map.

use std::sync::Arc;

use common::Buffer2;
use moka::sync::Cache;
use thiserror::Error;
use uuid::Uuid;

use crate::geometry::{CanvasSize, PixelBox, Point2D, canvas_to_local, local_to_canvas};
use crate::landmarks::Polygon;

/// Context added around an image's canvas box before cropping the canvas.
pub const DEFAULT_CANVAS_MARGIN_PX: i64 = 1000;

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Segmentation prompt has no points")]
    EmptyPrompt,

    #[error("Segmentation prompt has {points} points but {labels} labels")]
    PromptMismatch { points: usize, labels: usize },

    #[error("Cannot segment an empty image")]
    EmptyImage,

    #[error("Segmentation model failed: {0}")]
    Model(String),
}

/// Which raster a predictor was prepared for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SegmentationTarget {
    /// The canvas around the image's box.
    Canvas,
    /// One native channel of the image.
    Channel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredictorKey {
    pub image: Uuid,
    pub target: SegmentationTarget,
}

/// Prompt points in the coordinates of the raster handed to the predictor.
/// `true` labels are foreground.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentationPrompt {
    pub points: Vec<Point2D>,
    pub labels: Vec<bool>,
}

impl SegmentationPrompt {
    pub fn new(points: Vec<Point2D>, labels: Vec<bool>) -> Self {
        Self { points, labels }
    }

    pub fn validate(&self) -> Result<(), SegmentationError> {
        if self.points.is_empty() {
            return Err(SegmentationError::EmptyPrompt);
        }
        if self.points.len() != self.labels.len() {
            return Err(SegmentationError::PromptMismatch {
                points: self.points.len(),
                labels: self.labels.len(),
            });
        }
        Ok(())
    }

    fn map(&self, f: impl Fn(Point2D) -> Point2D) -> Self {
        Self {
            points: self.points.iter().map(|&p| f(p)).collect(),
            labels: self.labels.clone(),
        }
    }
}

pub trait SegmentationAssistant: Send + Sync {
    type Predictor: Send + Sync + 'static;

    fn prepare(&self, image: &Buffer2<f32>) -> Result<Self::Predictor, SegmentationError>;

    /// Polygons in the coordinates of the prepared raster, best first.
    fn propose(
        &self,
        predictor: &Self::Predictor,
        prompt: &SegmentationPrompt,
    ) -> Result<Vec<Polygon>, SegmentationError>;
}

// =============================================================================
// Predictor cache
// =============================================================================

/// Bounded cache of prepared predictors.
pub struct PredictorCache<P> {
    capacity: usize,
    entries: Cache<PredictorKey, Arc<P>>,
}

impl<P: Send + Sync + 'static> PredictorCache<P> {
    /// `capacity` is raised to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Cache::builder()
                .max_capacity(capacity as u64)
                .eviction_listener(|key: Arc<PredictorKey>, _, cause| {
                    tracing::debug!(image = %key.image, ?cause, "Segmentation predictor dropped");
                })
                .build(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entry count once pending evictions have been applied.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &PredictorKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &PredictorKey) -> Option<Arc<P>> {
        self.entries.get(key)
    }

    /// Returns the cached predictor or builds one. The builder runs outside
    /// the cache; if another caller inserted the key meanwhile, that entry wins.
    pub fn get_or_try_insert<E>(
        &self,
        key: &PredictorKey,
        build: impl FnOnce() -> Result<P, E>,
    ) -> Result<Arc<P>, E> {
        if let Some(predictor) = self.entries.get(key) {
            return Ok(predictor);
        }
        let built = Arc::new(build()?);
        Ok(self.entries.get_with_by_ref(key, move || built))
    }

    /// Drops every predictor of `image`, e.g. after it was re-registered.
    pub fn invalidate(&self, image: Uuid) {
        let stale: Vec<Arc<PredictorKey>> = self
            .entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| key.image == image)
            .collect();
        for key in stale {
            self.entries.invalidate(key.as_ref());
        }
    }
}

// =============================================================================
// Cached assistant
// =============================================================================

pub struct CachedSegmentation<A: SegmentationAssistant> {
    assistant: A,
    cache: PredictorCache<A::Predictor>,
    canvas_margin_px: i64,
}

impl<A: SegmentationAssistant> CachedSegmentation<A> {
    pub fn new(assistant: A, capacity: usize) -> Self {
        Self {
            assistant,
            cache: PredictorCache::new(capacity),
            canvas_margin_px: DEFAULT_CANVAS_MARGIN_PX,
        }
    }

    pub fn with_canvas_margin(mut self, margin_px: i64) -> Self {
        self.canvas_margin_px = margin_px.max(0);
        self
    }

    pub fn cache(&self) -> &PredictorCache<A::Predictor> {
        &self.cache
    }

    /// Canvas region a predictor for an image with box `bbox` is prepared on.
    pub fn canvas_region(&self, bbox: PixelBox, canvas: CanvasSize) -> PixelBox {
        let m = self.canvas_margin_px;
        PixelBox::new(bbox.x0 - m, bbox.y0 - m, bbox.x1 + m, bbox.y1 + m).intersect(&canvas.bounds())
    }

    /// Proposes polygons on the canvas near `image`. Prompt and result are in
    /// canvas coordinates.
    pub fn propose_on_canvas(
        &self,
        image: Uuid,
        canvas: &Buffer2<f32>,
        bbox: PixelBox,
        prompt: &SegmentationPrompt,
    ) -> Result<Vec<Polygon>, SegmentationError> {
        prompt.validate()?;
        let size = CanvasSize::new(canvas.width(), canvas.height());
        let region = self.canvas_region(bbox, size);
        if region.is_empty() {
            return Err(SegmentationError::EmptyImage);
        }
        let origin = (region.x0, region.y0);
        let key = PredictorKey {
            image,
            target: SegmentationTarget::Canvas,
        };
        let predictor = self.cache.get_or_try_insert(&key, || {
            tracing::info!(image = %image, "Preparing canvas predictor on {}", region);
            let crop = canvas.crop(
                region.x0 as usize,
                region.y0 as usize,
                region.width() as usize,
                region.height() as usize,
            );
            self.assistant.prepare(&crop)
        })?;

        let local = prompt.map(|p| canvas_to_local(p, origin));
        let polygons = self.assistant.propose(&predictor, &local)?;
        Ok(polygons
            .iter()
            .map(|polygon| polygon.map(|p| local_to_canvas(p, origin)))
            .collect())
    }

    /// Proposes polygons on one native channel. Prompt and result are in
    /// native coordinates.
    pub fn propose_on_channel(
        &self,
        image: Uuid,
        channel: &str,
        native: &Buffer2<f32>,
        prompt: &SegmentationPrompt,
    ) -> Result<Vec<Polygon>, SegmentationError> {
        prompt.validate()?;
        if native.width() == 0 || native.height() == 0 {
            return Err(SegmentationError::EmptyImage);
        }
        let key = PredictorKey {
            image,
            target: SegmentationTarget::Channel(channel.to_string()),
        };
        let predictor = self.cache.get_or_try_insert(&key, || {
            tracing::info!(image = %image, channel, "Preparing channel predictor");
            self.assistant.prepare(native)
        })?;
        self.assistant.propose(&predictor, prompt)
    }

    pub fn invalidate(&self, image: Uuid) {
        self.cache.invalidate(image);
    }
}
