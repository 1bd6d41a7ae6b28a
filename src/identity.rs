use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::FlagValue;

/// Snapshot of the identity flags are evaluated for.
///
/// The synchronizer keeps flags for exactly one identity at a time; events carry the snapshot
/// that was active when they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Key uniquely identifying this identity.
    pub key: String,
    /// Caller-supplied attributes reported alongside events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, FlagValue>,
}

impl Identity {
    /// Create an identity with the given key and no attributes.
    pub fn new(key: impl Into<String>) -> Identity {
        Identity {
            key: key.into(),
            attributes: HashMap::new(),
        }
    }
}
