//! Per-cycle aggregation of flag evaluations.
//!
//! Every evaluation lands here regardless of per-flag event tracking; the reporter turns the
//! accumulated counters into one summary event per flush cycle and resets the tracker.
use std::collections::HashMap;

use chrono::Utc;
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::feature_flag::{FeatureFlag, FlagKey, Timestamp};
use crate::FlagValue;

// One distinct (served value, flag record) pair and its hit count. Counters for unknown flags
// carry `unknown: true` instead of variation/version.
#[derive(Debug, Clone, PartialEq)]
struct FlagValueCounter {
    value: FlagValue,
    variation: Option<i64>,
    version: Option<u64>,
    known: bool,
    count: u64,
}

impl Serialize for FlagValueCounter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut counter = serializer.serialize_struct("FlagValueCounter", 4)?;
        counter.serialize_field("value", &self.value)?;
        if self.known {
            if let Some(variation) = self.variation {
                counter.serialize_field("variation", &variation)?;
            }
            if let Some(version) = self.version {
                counter.serialize_field("version", &version)?;
            }
        } else {
            counter.serialize_field("unknown", &true)?;
        }
        counter.serialize_field("count", &self.count)?;
        counter.end()
    }
}

// Counters for one flag key across a cycle, plus the last fallback the callers supplied.
#[derive(Debug, Clone, PartialEq, Default)]
struct FlagCounter {
    default_value: FlagValue,
    counters: Vec<FlagValueCounter>,
}

impl Serialize for FlagCounter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut counter = serializer.serialize_struct("FlagCounter", 2)?;
        counter.serialize_field("default", &self.default_value)?;
        counter.serialize_field("counters", &self.counters)?;
        counter.end()
    }
}

impl FlagCounter {
    // Counters match on (variation, reporting version) for known flags; all evaluations of an
    // unknown flag share one counter.
    fn track_request(&mut self, value: FlagValue, default_value: FlagValue, flag: Option<&FeatureFlag>) {
        self.default_value = default_value;
        let existing = self.counters.iter_mut().find(|counter| match flag {
            Some(flag) => {
                counter.known
                    && counter.variation == flag.variation
                    && counter.version == flag.version_for_events()
            }
            None => !counter.known,
        });
        match existing {
            Some(counter) => {
                counter.count += 1;
                if !counter.known {
                    counter.value = value;
                }
            }
            None => self.counters.push(FlagValueCounter {
                value,
                variation: flag.and_then(|flag| flag.variation),
                version: flag.and_then(|flag| flag.version_for_events()),
                known: flag.is_some(),
                count: 1,
            }),
        }
    }
}

/// Accumulates evaluation counters between flushes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRequestTracker {
    start_date: Timestamp,
    flag_counters: HashMap<FlagKey, FlagCounter>,
}

impl FlagRequestTracker {
    /// Start a fresh cycle.
    pub fn new() -> FlagRequestTracker {
        FlagRequestTracker {
            start_date: Utc::now(),
            flag_counters: HashMap::new(),
        }
    }

    /// Count one evaluation of `key`. `flag` is the stored record, or `None` when the key was
    /// unknown and the fallback was served.
    pub fn track_request(
        &mut self,
        key: &str,
        value: FlagValue,
        default_value: FlagValue,
        flag: Option<&FeatureFlag>,
    ) {
        self.flag_counters
            .entry(key.to_owned())
            .or_default()
            .track_request(value, default_value, flag);
    }

    /// Whether any evaluation was counted this cycle.
    pub fn has_logged_requests(&self) -> bool {
        !self.flag_counters.is_empty()
    }

    /// When this cycle started.
    pub fn start_date(&self) -> Timestamp {
        self.start_date
    }

    /// The counters as the summary event's `features` payload.
    pub fn features_payload(&self) -> serde_json::Value {
        serde_json::to_value(&self.flag_counters).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for FlagRequestTracker {
    fn default() -> FlagRequestTracker {
        FlagRequestTracker::new()
    }
}
