//! Per-image patch storage and the instruction-lifting override hook.
//!
//! A [`PatchStore`] is owned by whatever owns the image's analysis session
//! and is torn down with it ([`PatchStore::release`] on the host's
//! destruction notification); there is deliberately no process-wide ambient
//! store. Collections are created lazily, loading any persisted patch set on
//! first access, and each collection serializes its own readers and writers
//! so IR lifters on worker threads can look patches up while the fix passes
//! register new ones.

use std::sync::{Arc, Mutex};

use crate::containers::unordered::UnorderedMap;
use crate::il::IlBuilder;
use crate::log::*;
use crate::patch::Patch;
use crate::persist::{self, MetadataStore, PATCH_METADATA_KEY};
use crate::view::ImageId;

/// The `address -> patch` mapping for one image.
pub struct PatchCollection {
    patches: Mutex<UnorderedMap<u64, Patch>>,
}

impl PatchCollection {
    fn new() -> Self {
        Self {
            patches: Mutex::new(UnorderedMap::new()),
        }
    }

    /// Register `patch` at `address`, replacing any previous patch there.
    pub fn add_patch(&self, address: u64, patch: Patch) {
        self.patches.lock().unwrap().insert(address, patch);
    }

    /// The patch registered at `address`, if any.
    pub fn get_patch(&self, address: u64) -> Option<Patch> {
        self.patches.lock().unwrap().get(&address).cloned()
    }

    pub fn len(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.lock().unwrap().is_empty()
    }

    /// All entries, for serialization.
    pub fn snapshot(&self) -> Vec<(u64, Patch)> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .map(|(&address, patch)| (address, patch.clone()))
            .collect()
    }
}

/// The per-session map from image to [`PatchCollection`].
pub struct PatchStore {
    metadata: Arc<dyn MetadataStore>,
    collections: Mutex<UnorderedMap<ImageId, Arc<PatchCollection>>>,
}

impl PatchStore {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            metadata,
            collections: Mutex::new(UnorderedMap::new()),
        }
    }

    /// The collection for `image`, if one has been created.
    pub fn get(&self, image: ImageId) -> Option<Arc<PatchCollection>> {
        self.collections.lock().unwrap().get(&image).cloned()
    }

    /// The collection for `image`, creating it (and loading any persisted
    /// patch set) on first access.
    pub fn get_or_create(&self, image: ImageId) -> Arc<PatchCollection> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(existing) = collections.get(&image) {
            return existing.clone();
        }
        let collection = Arc::new(PatchCollection::new());
        self.load_into(image, &collection);
        collections.insert(image, collection.clone());
        collection
    }

    /// Register `patch` at `address` in `image`'s collection.
    pub fn add_patch(&self, image: ImageId, address: u64, patch: Patch) {
        debug!(
            "Registering patch";
            "image" => self.metadata.image_name(image),
            "address" => format!("{:#x}", address),
            "tokens" => patch.tokens.len(),
        );
        self.get_or_create(image).add_patch(address, patch);
    }

    /// The patch registered at `address` in `image`, if any.
    pub fn get_patch(&self, image: ImageId, address: u64) -> Option<Patch> {
        self.get_or_create(image).get_patch(address)
    }

    /// Serialize `image`'s collection through the metadata store.
    pub fn save(&self, image: ImageId) {
        let collection = self.get_or_create(image);
        match persist::encode_patch_set(&collection.snapshot()) {
            Ok(blob) => {
                self.metadata.store(image, PATCH_METADATA_KEY, &blob);
                info!(
                    "Saved patch data";
                    "image" => self.metadata.image_name(image),
                    "patches" => collection.len(),
                );
            }
            Err(err) => {
                error!(
                    "Failed to serialize patch data";
                    "image" => self.metadata.image_name(image),
                    "error" => %err,
                );
            }
        }
    }

    /// Drop `image`'s collection. Called from the host's destruction
    /// notification; without it the collection would live for the rest of
    /// the session.
    pub fn release(&self, image: ImageId) {
        self.collections.lock().unwrap().remove(&image);
    }

    fn load_into(&self, image: ImageId, collection: &PatchCollection) {
        let Some(blob) = self.metadata.query(image, PATCH_METADATA_KEY) else {
            return;
        };
        match persist::decode_patch_set(&blob) {
            Ok(entries) => {
                let count = entries.len();
                for (address, patch) in entries {
                    collection.add_patch(address, patch);
                }
                info!(
                    "Loaded patch data";
                    "image" => self.metadata.image_name(image),
                    "patches" => count,
                );
            }
            Err(err) => {
                error!(
                    "Discarding stored patch data";
                    "image" => self.metadata.image_name(image),
                    "error" => %err,
                );
            }
        }
    }
}

/// The instruction-lifting override capability.
///
/// The host asks every registered source in turn while lifting an address;
/// the first source that emits something reports the consumed byte length
/// and wins. Sources compose by delegation (see [`OverrideChain`]) instead of
/// architecture subclassing, so several independent plugins can hook the
/// same lifter.
pub trait LiftOverride: Send + Sync {
    /// Emit replacement IR for `address` into `il`, returning the consumed
    /// byte length, or `None` to let the host lift the address as decoded.
    fn try_lift_override(&self, il: &mut dyn IlBuilder, address: u64) -> Option<u64>;
}

impl LiftOverride for PatchStore {
    fn try_lift_override(&self, il: &mut dyn IlBuilder, address: u64) -> Option<u64> {
        // Every link that is missing simply means "no patch here": a lifting
        // context without an owning image, or an image without a patch at
        // this address.
        let image = il.owner_image()?;
        let patch = self.get_patch(image, address)?;
        match patch.evaluate(il) {
            Ok(()) => Some(patch.size),
            Err(err) => {
                error!(
                    "Patch evaluation failed, falling back to default lifting";
                    "image" => self.metadata.image_name(image),
                    "address" => format!("{:#x}", address),
                    "error" => %err,
                );
                None
            }
        }
    }
}

/// A sequence of override sources tried in registration order.
#[derive(Default)]
pub struct OverrideChain {
    sources: Vec<Arc<dyn LiftOverride>>,
}

impl OverrideChain {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, source: Arc<dyn LiftOverride>) {
        self.sources.push(source);
    }
}

impl LiftOverride for OverrideChain {
    fn try_lift_override(&self, il: &mut dyn IlBuilder, address: u64) -> Option<u64> {
        self.sources
            .iter()
            .find_map(|source| source.try_lift_override(il, address))
    }
}
