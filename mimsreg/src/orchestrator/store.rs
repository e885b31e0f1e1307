//! Collaborator seams: channel decoding, landmark storage and artifact
//! persistence, each with an in-memory implementation.

use std::path::{Path, PathBuf};

use common::Buffer2;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::landmarks::LandmarkSet;
use crate::mosaic::Raster;
use crate::orchestrator::records::RegistrationRecord;
use crate::registration::error::ChannelSourceError;
use crate::registration::warp::ChannelPatch;

/// Decodes one named channel of a MIMS file into a native intensity array.
pub trait ChannelSource: Send + Sync {
    fn load_channel(&self, path: &Path, channel: &str) -> Result<Buffer2<f32>, ChannelSourceError>;
}

/// Landmark correspondences between a MIMS image and its canvas.
pub trait LandmarkStore: Send + Sync {
    /// `None` when nothing has been digitized for the image yet.
    fn landmarks(&self, image: Uuid) -> Option<LandmarkSet>;
}

/// Where registration results, transient patches and mosaics go.
pub trait ArtifactStore: Send + Sync {
    fn persist_registration(&self, image: Uuid, record: Option<&RegistrationRecord>);
    fn registration(&self, image: Uuid) -> Option<RegistrationRecord>;

    /// Replaces every stored patch of `image`.
    fn store_patches(&self, image: Uuid, patches: Vec<ChannelPatch>);
    fn patch(&self, image: Uuid, channel: &str) -> Option<ChannelPatch>;
    fn release_patches(&self, image: Uuid);

    fn publish_mosaic(&self, set: Uuid, channel: &str, raster: Raster);
    fn mosaic(&self, set: Uuid, channel: &str) -> Option<Raster>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryChannelSource {
    /// `Err` holds the decode failure reported for that channel.
    channels: RwLock<HashMap<(PathBuf, String), Result<Buffer2<f32>, String>>>,
}

impl InMemoryChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, channel: &str, data: Buffer2<f32>) {
        self.channels
            .write()
            .insert((path.into(), channel.to_string()), Ok(data));
    }

    /// Makes `channel` fail to decode with `message`.
    pub fn insert_unreadable(&self, path: impl Into<PathBuf>, channel: &str, message: &str) {
        self.channels
            .write()
            .insert((path.into(), channel.to_string()), Err(message.to_string()));
    }
}

impl ChannelSource for InMemoryChannelSource {
    fn load_channel(&self, path: &Path, channel: &str) -> Result<Buffer2<f32>, ChannelSourceError> {
        match self.channels.read().get(&(path.to_path_buf(), channel.to_string())) {
            Some(Ok(data)) => Ok(data.clone()),
            Some(Err(message)) => Err(ChannelSourceError::Unreadable {
                channel: channel.to_string(),
                message: message.clone(),
            }),
            None => Err(ChannelSourceError::MissingChannel(channel.to_string())),
        }
    }
}

/// Landmarks keyed by image. Every write bumps the image's revision.
#[derive(Debug, Default)]
pub struct InMemoryLandmarkStore {
    landmarks: RwLock<HashMap<Uuid, LandmarkSet>>,
}

impl InMemoryLandmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `landmarks` and returns the revision it was given.
    pub fn set_landmarks(&self, image: Uuid, landmarks: LandmarkSet) -> u64 {
        let mut map = self.landmarks.write();
        let revision = map.get(&image).map_or(1, |old| old.revision + 1);
        map.insert(image, landmarks.with_revision(revision));
        revision
    }
}

impl LandmarkStore for InMemoryLandmarkStore {
    fn landmarks(&self, image: Uuid) -> Option<LandmarkSet> {
        self.landmarks.read().get(&image).cloned()
    }
}

#[derive(Debug, Default)]
struct Artifacts {
    registrations: HashMap<Uuid, RegistrationRecord>,
    patches: HashMap<Uuid, Vec<ChannelPatch>>,
    mosaics: HashMap<(Uuid, String), Raster>,
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: Mutex<Artifacts>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images with patches currently held.
    pub fn images_with_patches(&self) -> usize {
        self.inner.lock().patches.len()
    }

    pub fn mosaic_names(&self, set: Uuid) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .mosaics
            .keys()
            .filter(|(s, _)| *s == set)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn persist_registration(&self, image: Uuid, record: Option<&RegistrationRecord>) {
        let mut inner = self.inner.lock();
        match record {
            Some(record) => {
                inner.registrations.insert(image, record.clone());
            }
            None => {
                inner.registrations.remove(&image);
            }
        }
    }

    fn registration(&self, image: Uuid) -> Option<RegistrationRecord> {
        self.inner.lock().registrations.get(&image).cloned()
    }

    fn store_patches(&self, image: Uuid, patches: Vec<ChannelPatch>) {
        self.inner.lock().patches.insert(image, patches);
    }

    fn patch(&self, image: Uuid, channel: &str) -> Option<ChannelPatch> {
        self.inner
            .lock()
            .patches
            .get(&image)?
            .iter()
            .find(|p| p.channel == channel)
            .cloned()
    }

    fn release_patches(&self, image: Uuid) {
        self.inner.lock().patches.remove(&image);
    }

    fn publish_mosaic(&self, set: Uuid, channel: &str, raster: Raster) {
        self.inner
            .lock()
            .mosaics
            .insert((set, channel.to_string()), raster);
    }

    fn mosaic(&self, set: Uuid, channel: &str) -> Option<Raster> {
        self.inner
            .lock()
            .mosaics
            .get(&(set, channel.to_string()))
            .cloned()
    }
}
