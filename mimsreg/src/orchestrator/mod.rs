//! Image and image-set state machines driving registration and compositing.
//!
//! Per image:
//! `PREPROCESSING -> PREPROCESSED -> REGISTERING -> {REGISTERED | INVALID_FILE |
//! OUTSIDE_CANVAS | REGISTRATION_ISSUE}`.
//!
//! Per set: `PREPROCESSING -> PREPROCESSED -> ROUGH_ALIGNMENT ->
//! PARTIALLY_REGISTERED -> REGISTERED`, derived from the images by
//! [`aggregate_set_status`]. Entering `REGISTERED` composites the set once.
//!
//! Every set has one mutex. Claiming an image, committing its result and
//! compositing happen under it; solving and warping do not.

pub mod records;
pub mod status;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::Buffer2;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use uuid::Uuid;

use crate::geometry::{CanvasSize, PixelBox};
use crate::landmarks::LandmarkSet;
use crate::mosaic::{SkippedChannel, composite_set};
use crate::registration::config::MimsRegConfig;
use crate::registration::error::{ChannelSourceError, Diagnostic, RegistrationError};
use crate::registration::warp::{ChannelPatch, WarpMap};
use crate::registration::{CanvasGeometry, TransformChain, solve_registration};

pub use records::{ImageRecord, ImageSetRecord, RegistrationRecord};
pub use status::{ImageStatus, SetStatus, aggregate_set_status};
pub use store::{
    ArtifactStore, ChannelSource, InMemoryArtifactStore, InMemoryChannelSource,
    InMemoryLandmarkStore, LandmarkStore,
};

/// What happened to one `register` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub image: Uuid,
    pub status: ImageStatus,
    pub set_status: SetStatus,
    /// Present whenever the attempt failed, including failures that restored
    /// the prior status.
    pub diagnostic: Option<Diagnostic>,
    /// Set when this call completed the set and triggered compositing.
    pub composite: Option<CompositeReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeReport {
    pub set: Uuid,
    pub run: u64,
    /// Published mosaics: base channels, then ratios.
    pub channels: Vec<String>,
    pub skipped: Vec<SkippedChannel>,
    pub bbox: Option<PixelBox>,
}

struct SetState {
    record: ImageSetRecord,
    /// In set order.
    images: Vec<ImageRecord>,
    /// An image entered or left the registered state, or changed its
    /// transform, since the last composite.
    stale: bool,
}

impl SetState {
    fn image(&self, id: Uuid) -> Option<&ImageRecord> {
        self.images.iter().find(|i| i.id == id)
    }

    fn image_mut(&mut self, id: Uuid) -> Option<&mut ImageRecord> {
        self.images.iter_mut().find(|i| i.id == id)
    }

    fn registered_bbox(&self) -> Option<PixelBox> {
        self.images
            .iter()
            .filter(|i| i.status == ImageStatus::Registered)
            .filter_map(|i| i.registration.as_ref())
            .map(|r| r.geometry.clamped)
            .reduce(|a, b| a.union(&b))
    }

    /// Recomputes the set status and box; returns the status before.
    fn refresh(&mut self) -> SetStatus {
        let previous = self.record.status;
        let statuses: Vec<ImageStatus> = self.images.iter().map(|i| i.status).collect();
        self.record.status = aggregate_set_status(&statuses, previous);
        self.record.bbox = self.registered_bbox();
        if self.record.status != previous {
            tracing::info!(
                set = %self.record.id,
                from = %previous,
                to = %self.record.status,
                "Image set status changed"
            );
        }
        previous
    }
}

/// Inputs captured when an image is claimed for registration.
struct Claim {
    image: Uuid,
    path: PathBuf,
    native_width: usize,
    native_height: usize,
    channels: Vec<String>,
    canvas: CanvasSize,
    prior_status: ImageStatus,
    landmarks: LandmarkSet,
}

/// Status a failed attempt leaves the image in. `None` restores the prior status.
fn failure_status(err: &RegistrationError) -> Option<ImageStatus> {
    match err {
        RegistrationError::ResidualTooLarge { .. } => Some(ImageStatus::RegistrationIssue),
        RegistrationError::OutsideCanvas { .. } => Some(ImageStatus::OutsideCanvas),
        RegistrationError::InvalidFile(_) => Some(ImageStatus::InvalidFile),
        RegistrationError::ChannelLoad {
            source: ChannelSourceError::Unreadable { .. },
            ..
        } => Some(ImageStatus::InvalidFile),
        _ => None,
    }
}

/// Channels the source does not have, or that hold no pixels, are left out
/// of the image instead of failing it.
fn skippable(err: &RegistrationError) -> bool {
    matches!(
        err,
        RegistrationError::EmptyChannel(_)
            | RegistrationError::ChannelLoad {
                source: ChannelSourceError::MissingChannel(_),
                ..
            }
    )
}

pub struct Orchestrator {
    config: MimsRegConfig,
    channels: Arc<dyn ChannelSource>,
    landmarks: Arc<dyn LandmarkStore>,
    artifacts: Arc<dyn ArtifactStore>,
    sets: RwLock<HashMap<Uuid, Arc<Mutex<SetState>>>>,
    image_sets: RwLock<HashMap<Uuid, Uuid>>,
}

impl Orchestrator {
    pub fn new(
        config: MimsRegConfig,
        channels: Arc<dyn ChannelSource>,
        landmarks: Arc<dyn LandmarkStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            channels,
            landmarks,
            artifacts,
            sets: RwLock::new(HashMap::new()),
            image_sets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MimsRegConfig {
        &self.config
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub fn create_set(&self, canvas_id: Uuid, canvas: CanvasSize) -> Uuid {
        let id = Uuid::new_v4();
        let record = ImageSetRecord {
            id,
            canvas_id,
            canvas,
            status: SetStatus::Preprocessing,
            bbox: None,
            images: Vec::new(),
            composite_runs: 0,
        };
        self.sets.write().insert(
            id,
            Arc::new(Mutex::new(SetState {
                record,
                images: Vec::new(),
                stale: true,
            })),
        );
        tracing::info!(set = %id, width = canvas.width, height = canvas.height, "Image set created");
        id
    }

    /// Appends an image in `PREPROCESSING` to the end of the set order.
    pub fn add_image(
        &self,
        set_id: Uuid,
        path: impl Into<PathBuf>,
    ) -> Result<Uuid, RegistrationError> {
        let set = self.set_entry(set_id)?;
        let id = Uuid::new_v4();
        {
            let mut state = set.lock();
            state.images.push(ImageRecord {
                id,
                set_id,
                path: path.into(),
                status: ImageStatus::Preprocessing,
                native_width: 0,
                native_height: 0,
                pixel_size_nm: None,
                channels: Vec::new(),
                registration: None,
                diagnostic: None,
                last_failed_revision: None,
            });
            state.record.images.push(id);
            state.stale = true;
            state.refresh();
        }
        self.image_sets.write().insert(id, set_id);
        Ok(id)
    }

    /// Records preprocessing output. A zero-sized raster marks the file invalid.
    pub fn mark_preprocessed(
        &self,
        image_id: Uuid,
        width: usize,
        height: usize,
        channels: Vec<String>,
        pixel_size_nm: Option<f64>,
    ) -> Result<Option<CompositeReport>, RegistrationError> {
        let set = self.set_of_image(image_id)?;
        let mut state = set.lock();
        let image = state
            .image_mut(image_id)
            .ok_or(RegistrationError::UnknownImage(image_id))?;
        if !matches!(
            image.status,
            ImageStatus::Preprocessing | ImageStatus::Preprocessed
        ) {
            return Err(RegistrationError::InvalidTransition {
                image: image_id,
                status: image.status.to_string(),
                action: "marked preprocessed",
            });
        }

        image.native_width = width;
        image.native_height = height;
        image.channels = channels;
        image.pixel_size_nm = pixel_size_nm;
        if width == 0 || height == 0 {
            let err = RegistrationError::InvalidFile(format!("raster is {width}x{height}"));
            tracing::warn!(image = %image_id, "Preprocessing produced an empty raster");
            image.diagnostic = Some(Diagnostic::from(&err));
            image.status = ImageStatus::InvalidFile;
        } else {
            image.status = ImageStatus::Preprocessed;
        }
        state.stale = true;
        Ok(self.settle(&mut state))
    }

    /// Preprocessing could not decode the file.
    pub fn mark_invalid_file(
        &self,
        image_id: Uuid,
        reason: &str,
    ) -> Result<Option<CompositeReport>, RegistrationError> {
        let set = self.set_of_image(image_id)?;
        let mut state = set.lock();
        let image = state
            .image_mut(image_id)
            .ok_or(RegistrationError::UnknownImage(image_id))?;
        if image.status == ImageStatus::Registering {
            return Err(RegistrationError::AlreadyRegistering(image_id));
        }
        let err = RegistrationError::InvalidFile(reason.to_string());
        image.diagnostic = Some(Diagnostic::from(&err));
        image.status = ImageStatus::InvalidFile;
        image.registration = None;
        self.artifacts.persist_registration(image_id, None);
        self.artifacts.release_patches(image_id);
        state.stale = true;
        Ok(self.settle(&mut state))
    }

    pub fn set(&self, set_id: Uuid) -> Result<ImageSetRecord, RegistrationError> {
        Ok(self.set_entry(set_id)?.lock().record.clone())
    }

    pub fn image(&self, image_id: Uuid) -> Result<ImageRecord, RegistrationError> {
        let set = self.set_of_image(image_id)?;
        let state = set.lock();
        state
            .image(image_id)
            .cloned()
            .ok_or(RegistrationError::UnknownImage(image_id))
    }

    fn set_entry(&self, set_id: Uuid) -> Result<Arc<Mutex<SetState>>, RegistrationError> {
        self.sets
            .read()
            .get(&set_id)
            .cloned()
            .ok_or(RegistrationError::UnknownImageSet(set_id))
    }

    fn set_of_image(&self, image_id: Uuid) -> Result<Arc<Mutex<SetState>>, RegistrationError> {
        let set_id = *self
            .image_sets
            .read()
            .get(&image_id)
            .ok_or(RegistrationError::UnknownImage(image_id))?;
        self.set_entry(set_id)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers one image and, if that completes its set, composites the set.
    ///
    /// Failures of the attempt itself are reported in the outcome. `Err` is
    /// returned only when the image cannot be claimed.
    pub fn register(&self, image_id: Uuid) -> Result<RegistrationOutcome, RegistrationError> {
        let set = self.set_of_image(image_id)?;
        let landmarks = self.landmarks.landmarks(image_id).unwrap_or_default();
        let claim = Self::claim(&mut set.lock(), image_id, landmarks)?;

        tracing::info!(
            image = %image_id,
            revision = claim.landmarks.revision,
            channels = claim.channels.len(),
            "Registering image"
        );
        let attempt = self.attempt(&claim);

        let mut state = set.lock();
        Ok(self.commit(&mut state, claim, attempt))
    }

    /// Registers every image of a set concurrently. Results follow set order.
    ///
    /// Runs on plain threads: compositing holds the set lock across rayon
    /// jobs, so no pool worker may block on that lock.
    pub fn register_set(
        &self,
        set_id: Uuid,
    ) -> Result<Vec<(Uuid, Result<RegistrationOutcome, RegistrationError>)>, RegistrationError> {
        let images = self.set(set_id)?.images;
        Ok(std::thread::scope(|scope| {
            let handles: Vec<_> = images
                .iter()
                .map(|&id| (id, scope.spawn(move || self.register(id))))
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                    (id, result)
                })
                .collect()
        }))
    }

    fn claim(
        state: &mut SetState,
        image_id: Uuid,
        landmarks: LandmarkSet,
    ) -> Result<Claim, RegistrationError> {
        let canvas = state.record.canvas;
        let image = state
            .image_mut(image_id)
            .ok_or(RegistrationError::UnknownImage(image_id))?;
        match image.status {
            ImageStatus::Preprocessing => return Err(RegistrationError::NotPreprocessed(image_id)),
            ImageStatus::Registering => return Err(RegistrationError::AlreadyRegistering(image_id)),
            ImageStatus::InvalidFile | ImageStatus::OutsideCanvas => {
                return Err(RegistrationError::TerminalStatus(
                    image_id,
                    image.status.to_string(),
                ));
            }
            ImageStatus::RegistrationIssue
                if image.last_failed_revision == Some(landmarks.revision) =>
            {
                return Err(RegistrationError::LandmarksUnchanged {
                    image: image_id,
                    revision: landmarks.revision,
                });
            }
            _ => {}
        }

        let claim = Claim {
            image: image_id,
            path: image.path.clone(),
            native_width: image.native_width,
            native_height: image.native_height,
            channels: image.channels.clone(),
            canvas,
            prior_status: image.status,
            landmarks,
        };
        image.status = ImageStatus::Registering;
        state.refresh();
        Ok(claim)
    }

    fn attempt(&self, claim: &Claim) -> Result<(RegistrationRecord, Vec<ChannelPatch>), RegistrationError> {
        let solved = solve_registration(
            &claim.landmarks,
            claim.native_width,
            claim.native_height,
            claim.canvas,
            &self.config,
        )?;
        let patches = self.warp_channels(&claim.path, &claim.channels, &solved.chain, &solved.geometry)?;
        let record = RegistrationRecord {
            parameters: solved.chain.parameters()?,
            corners: solved.geometry.clamped.corner_pairs(),
            geometry: solved.geometry,
            chain: solved.chain,
            landmark_revision: claim.landmarks.revision,
            max_residual_px: solved.max_residual,
        };
        Ok((record, patches))
    }

    fn commit(
        &self,
        state: &mut SetState,
        claim: Claim,
        attempt: Result<(RegistrationRecord, Vec<ChannelPatch>), RegistrationError>,
    ) -> RegistrationOutcome {
        let image_id = claim.image;
        let mut changed = false;
        let (status, diagnostic) = match state.image_mut(image_id) {
            None => (claim.prior_status, None),
            Some(image) => match attempt {
                Ok((record, patches)) => {
                    tracing::info!(
                        image = %image_id,
                        patches = patches.len(),
                        max_residual = record.max_residual_px,
                        "Image registered at {}",
                        record.geometry.clamped
                    );
                    self.artifacts.persist_registration(image_id, Some(&record));
                    self.artifacts.store_patches(image_id, patches);
                    image.status = ImageStatus::Registered;
                    image.registration = Some(record);
                    image.diagnostic = None;
                    image.last_failed_revision = None;
                    changed = true;
                    (ImageStatus::Registered, None)
                }
                Err(err) => {
                    let diagnostic = Diagnostic::from(&err);
                    match failure_status(&err) {
                        Some(status) => {
                            tracing::warn!(image = %image_id, %status, "Registration failed: {}", err);
                            if status == ImageStatus::RegistrationIssue {
                                image.last_failed_revision = Some(claim.landmarks.revision);
                            }
                            image.status = status;
                            image.registration = None;
                            self.artifacts.persist_registration(image_id, None);
                            self.artifacts.release_patches(image_id);
                            changed = true;
                        }
                        None => {
                            tracing::warn!(
                                image = %image_id,
                                restored = %claim.prior_status,
                                "Registration attempt discarded: {}",
                                err
                            );
                            image.status = claim.prior_status;
                        }
                    }
                    image.diagnostic = Some(diagnostic.clone());
                    (image.status, Some(diagnostic))
                }
            },
        };

        state.stale |= changed;
        let composite = self.settle(state);
        RegistrationOutcome {
            image: image_id,
            status,
            set_status: state.record.status,
            diagnostic,
            composite,
        }
    }

    /// Refreshes the set and composites on the transition into `REGISTERED`,
    /// unless nothing changed since the last composite.
    fn settle(&self, state: &mut SetState) -> Option<CompositeReport> {
        let previous = state.refresh();
        if state.record.status != SetStatus::Registered || previous == SetStatus::Registered {
            return None;
        }
        if !state.stale {
            tracing::debug!(set = %state.record.id, "Registered set unchanged, mosaics kept");
            return None;
        }
        match self.composite_locked(state) {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(set = %state.record.id, "Compositing failed: {}", err);
                None
            }
        }
    }

    fn warp_channels(
        &self,
        path: &Path,
        channels: &[String],
        chain: &TransformChain,
        geometry: &CanvasGeometry,
    ) -> Result<Vec<ChannelPatch>, RegistrationError> {
        let map = WarpMap::build(chain, geometry);
        let method = self.config.warp.method;
        let results: Vec<Result<Option<ChannelPatch>, RegistrationError>> = channels
            .par_iter()
            .map(|channel| {
                let warped = self
                    .load_channel(path, channel)
                    .and_then(|native| map.apply(channel, &native, method));
                match warped {
                    Ok(patch) => Ok(Some(patch)),
                    Err(err) if skippable(&err) => {
                        tracing::warn!(channel = %channel, "Skipping channel: {}", err);
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            })
            .collect();
        results.into_iter().filter_map(Result::transpose).collect()
    }

    /// Loads a channel, retrying transient source failures with backoff.
    fn load_channel(&self, path: &Path, channel: &str) -> Result<Buffer2<f32>, RegistrationError> {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            match self.channels.load_channel(path, channel) {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying channel load: {}",
                        err
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(RegistrationError::ChannelLoad {
                        channel: channel.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    // =========================================================================
    // Compositing
    // =========================================================================

    /// Composites the set. Fails while any image is not yet accounted for.
    pub fn composite(&self, set_id: Uuid) -> Result<CompositeReport, RegistrationError> {
        let set = self.set_entry(set_id)?;
        let mut state = set.lock();
        self.composite_locked(&mut state)
    }

    fn composite_locked(&self, state: &mut SetState) -> Result<CompositeReport, RegistrationError> {
        let pending = state
            .images
            .iter()
            .filter(|i| !i.status.is_terminal())
            .count();
        if pending > 0 {
            return Err(RegistrationError::CompositingPrecondition { pending });
        }

        let set_id = state.record.id;
        let registered: Vec<&ImageRecord> = state
            .images
            .iter()
            .filter(|i| i.status == ImageStatus::Registered && i.registration.is_some())
            .collect();

        let mut channel_names: Vec<String> = Vec::new();
        for image in &registered {
            for channel in &image.channels {
                if !channel_names.contains(channel) {
                    channel_names.push(channel.clone());
                }
            }
        }

        let gathered: Vec<(String, Result<Vec<ChannelPatch>, RegistrationError>)> = channel_names
            .par_iter()
            .map(|channel| (channel.clone(), self.channel_patches(&registered, channel)))
            .collect();

        let mut skipped = Vec::new();
        let mut inputs = Vec::with_capacity(gathered.len());
        for (channel, result) in gathered {
            match result {
                Ok(patches) if patches.is_empty() => {
                    tracing::warn!(channel = %channel, "No image contributed to channel");
                    skipped.push(SkippedChannel {
                        channel,
                        reason: "no non-empty patches".to_string(),
                    });
                }
                Ok(patches) => inputs.push((channel, patches)),
                Err(err) => {
                    tracing::warn!(channel = %channel, "Channel left out of compositing: {}", err);
                    skipped.push(SkippedChannel {
                        channel,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let outcome = composite_set(state.record.canvas, &inputs, &self.config.mosaic);
        let registered_ids: Vec<Uuid> = registered.iter().map(|i| i.id).collect();

        let mut channels = Vec::with_capacity(outcome.mosaics.len());
        for (name, raster) in outcome.mosaics {
            self.artifacts.publish_mosaic(set_id, &name, raster);
            channels.push(name);
        }
        skipped.extend(outcome.skipped);
        for id in registered_ids {
            self.artifacts.release_patches(id);
        }

        state.record.bbox = state.registered_bbox();
        state.record.composite_runs += 1;
        state.stale = false;
        tracing::info!(
            set = %set_id,
            run = state.record.composite_runs,
            mosaics = channels.len(),
            skipped = skipped.len(),
            "Image set composited"
        );

        Ok(CompositeReport {
            set: set_id,
            run: state.record.composite_runs,
            channels,
            skipped,
            bbox: state.record.bbox,
        })
    }

    /// Patches of `channel` in set order: the stored patch, or a fresh warp
    /// from the persisted chain when it was already released.
    fn channel_patches(
        &self,
        images: &[&ImageRecord],
        channel: &str,
    ) -> Result<Vec<ChannelPatch>, RegistrationError> {
        let mut patches = Vec::new();
        for image in images.iter().filter(|i| i.channels.iter().any(|c| c == channel)) {
            if let Some(patch) = self.artifacts.patch(image.id, channel) {
                patches.push(patch);
                continue;
            }
            let Some(registration) = &image.registration else {
                continue;
            };
            let map = WarpMap::build(&registration.chain, &registration.geometry);
            let warped = self
                .load_channel(&image.path, channel)
                .and_then(|native| map.apply(channel, &native, self.config.warp.method));
            match warped {
                Ok(patch) => patches.push(patch),
                Err(err) if skippable(&err) => {
                    tracing::warn!(image = %image.id, channel, "Skipping channel: {}", err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(patches)
    }
}
