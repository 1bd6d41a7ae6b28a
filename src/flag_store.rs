//! A thread-safe in-memory storage for the currently known flag set of one identity.
//! [`FlagStore`] provides concurrent access for readers (flag evaluation call sites) and writers
//! (the synchronizer's delivery thread).
use std::collections::HashMap;
use std::sync::RwLock;

use crate::feature_flag::{flag_collection, DeleteMessage, FeatureFlag, FlagKey};
use crate::FlagValue;

/// Provenance of the currently held flag data. Exactly one source tag applies to the whole
/// store at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsSource {
    /// Live data from the backend.
    Server,
    /// Loaded from the persistent cache.
    Cache,
    /// No data available; caller-provided defaults are served.
    Fallback,
}

#[derive(Debug)]
struct StoreState {
    flags: HashMap<FlagKey, FeatureFlag>,
    source: FlagsSource,
}

/// Versioned, concurrently-accessed map from flag key to [`FeatureFlag`].
///
/// Patches and deletes are applied under a monotonic-version rule, which makes them commutative
/// with respect to arrival order: applying the same set of patches in any order converges to the
/// same final state. Rejected mutations (missing key/version, stale version) are defined no-ops,
/// not errors.
pub struct FlagStore {
    // Readers must never observe a half-applied update, so reads take the lock too.
    state: RwLock<StoreState>,
}

impl Default for FlagStore {
    fn default() -> FlagStore {
        FlagStore::new()
    }
}

impl FlagStore {
    /// Create an empty store tagged [`FlagsSource::Fallback`].
    pub fn new() -> FlagStore {
        FlagStore::with_flags(HashMap::new(), FlagsSource::Fallback)
    }

    /// Create a store pre-populated with `flags`, e.g. from the persistent cache.
    pub fn with_flags(flags: HashMap<FlagKey, FeatureFlag>, source: FlagsSource) -> FlagStore {
        FlagStore {
            state: RwLock::new(StoreState {
                flags: flag_collection(flags),
                source,
            }),
        }
    }

    /// Atomically swaps the entire flag map and source tag.
    pub fn replace(&self, new_flags: HashMap<FlagKey, FeatureFlag>, source: FlagsSource) {
        let mut state = self
            .state
            .write()
            .expect("thread holding flag store lock should not panic");
        state.flags = flag_collection(new_flags);
        state.source = source;
        log::debug!(target: "flagsync", "replaced flag store with {} flags", state.flags.len());
    }

    /// Applies a single-flag patch, creating the key if absent.
    ///
    /// The patch is accepted iff its version is strictly greater than the stored version, the
    /// stored record lacks a version, or the key does not yet exist. A patch missing its key or
    /// version is rejected outright.
    pub fn update(&self, patch: FeatureFlag, source: FlagsSource) {
        if patch.key.is_empty() || patch.version.is_none() {
            log::debug!(target: "flagsync", "update aborted: patch is missing key or version");
            return;
        }
        let mut state = self
            .state
            .write()
            .expect("thread holding flag store lock should not panic");
        if !is_valid_version(&state.flags, &patch.key, patch.version) {
            log::debug!(target: "flagsync", "update aborted: stale version for flag {:?}", patch.key);
            return;
        }
        log::debug!(target: "flagsync", "updated flag {:?} to version {:?}", patch.key, patch.version);
        state.source = source;
        state.flags.insert(patch.key.clone(), patch);
    }

    /// Removes a single flag under the same version rule as [`FlagStore::update`]. Version ties
    /// and version-less deletes are no-ops.
    pub fn delete(&self, delete: DeleteMessage) {
        if delete.key.is_empty() || delete.version.is_none() {
            log::debug!(target: "flagsync", "delete aborted: message is missing key or version");
            return;
        }
        let mut state = self
            .state
            .write()
            .expect("thread holding flag store lock should not panic");
        if !is_valid_version(&state.flags, &delete.key, delete.version) {
            log::debug!(target: "flagsync", "delete aborted: stale version for flag {:?}", delete.key);
            return;
        }
        log::debug!(target: "flagsync", "deleted flag {:?}", delete.key);
        state.flags.remove(&delete.key);
    }

    /// Get one flag record along with the store's source tag.
    pub fn get(&self, key: &str) -> Option<(FeatureFlag, FlagsSource)> {
        let state = self
            .state
            .read()
            .expect("thread holding flag store lock should not panic");
        state.flags.get(key).cloned().map(|flag| (flag, state.source))
    }

    /// Returns the flag's value, or `fallback` tagged [`FlagsSource::Fallback`] when the key is
    /// absent or its value is null.
    pub fn variation(&self, key: &str, fallback: FlagValue) -> (FlagValue, FlagsSource) {
        let state = self
            .state
            .read()
            .expect("thread holding flag store lock should not panic");
        match state.flags.get(key) {
            Some(flag) if !flag.value.is_null() => (flag.value.clone(), state.source),
            _ => (fallback, FlagsSource::Fallback),
        }
    }

    /// A consistent snapshot of all currently held flags.
    pub fn all_flags(&self) -> HashMap<FlagKey, FeatureFlag> {
        self.state
            .read()
            .expect("thread holding flag store lock should not panic")
            .flags
            .clone()
    }

    /// The store's current source tag.
    pub fn source(&self) -> FlagsSource {
        self.state
            .read()
            .expect("thread holding flag store lock should not panic")
            .source
    }
}

fn is_valid_version(
    flags: &HashMap<FlagKey, FeatureFlag>,
    key: &str,
    new_version: Option<u64>,
) -> bool {
    match (flags.get(key).and_then(|flag| flag.version), new_version) {
        (Some(stored), Some(incoming)) => incoming > stored,
        // The stored record lacks a version, or the key does not exist yet.
        _ => true,
    }
}
