use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::FlagValue;

/// Key identifying one feature flag.
pub type FlagKey = String;

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// One feature flag's current known state for an identity.
///
/// Records are never mutated in place: the synchronizer produces new records and the store
/// replaces them atomically per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    /// Flag key. May be omitted inside a full flag set, in which case [`flag_collection`] fills
    /// it from the enclosing map key.
    #[serde(default)]
    pub key: FlagKey,
    /// The served value. Defaults to [`FlagValue::Null`] when missing.
    #[serde(default)]
    pub value: FlagValue,
    /// Index of the variation that was served.
    #[serde(default)]
    pub variation: Option<i64>,
    /// Environment version, used for patch/delete version comparison. Absence means an update
    /// always applies.
    #[serde(default)]
    pub version: Option<u64>,
    /// Per-flag version, used for event reporting only.
    #[serde(default)]
    pub flag_version: Option<u64>,
    /// Whether evaluations of this flag generate feature events.
    #[serde(default)]
    pub track_events: bool,
    /// While set and in the future, evaluations additionally emit debug events.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub debug_events_until_date: Option<Timestamp>,
}

impl FeatureFlag {
    /// The version to attach to analytics events: the per-flag version when the server sent one,
    /// the environment version otherwise.
    pub fn version_for_events(&self) -> Option<u64> {
        self.flag_version.or(self.version)
    }

    /// Whether an evaluation of this flag should emit a debug event. The debug window must end
    /// strictly after the current time and, when known, after the server clock reference taken
    /// from the last event flush response.
    pub fn should_create_debug_events(&self, last_event_response: Option<Timestamp>) -> bool {
        match self.debug_events_until_date {
            Some(until) => {
                Utc::now() < until && last_event_response.map_or(true, |last| last < until)
            }
            None => false,
        }
    }
}

// Two records are the same flag state iff value, variation, and version all match. The event
// reporting fields do not participate.
impl PartialEq for FeatureFlag {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
            && self.variation == other.variation
            && self.version == other.version
    }
}

/// Normalizes a full flag set received off the wire: each record's `key` field may be omitted
/// and is filled in from the enclosing map key.
pub fn flag_collection(
    mut flags: HashMap<FlagKey, FeatureFlag>,
) -> HashMap<FlagKey, FeatureFlag> {
    for (key, flag) in flags.iter_mut() {
        if flag.key.is_empty() {
            flag.key = key.clone();
        }
    }
    flags
}

/// A single-flag removal instruction carried over the stream.
///
/// A delete without a version is a defined no-op at the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessage {
    /// Key of the flag to remove.
    pub key: FlagKey,
    /// Version of the removal; compared against the stored record's version.
    #[serde(default)]
    pub version: Option<u64>,
}
