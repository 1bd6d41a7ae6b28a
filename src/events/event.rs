use chrono::Utc;
use serde::Serialize;

use crate::feature_flag::{FeatureFlag, Timestamp};
use crate::{FlagValue, Identity};

/// What an [`Event`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A tracked flag evaluation.
    Feature,
    /// A diagnostic copy of an evaluation, emitted while the flag's debug window is active.
    Debug,
    /// An identity became active.
    Identify,
    /// A caller-defined event.
    Custom,
    /// Aggregated evaluation counts for one reporting cycle.
    Summary,
}

/// One analytics record, serialized to the wire as a JSON object.
///
/// Not every field applies to every kind; absent fields are omitted from the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Flag key, custom event key, or identity key; empty for summary events.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// When the event was recorded.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_date: Timestamp,
    /// Identity snapshot active when the event was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// The value served by the evaluation.
    #[serde(skip_serializing_if = "FlagValue::is_null")]
    pub value: FlagValue,
    /// The caller-supplied fallback for the evaluation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<FlagValue>,
    /// Variation index of the served value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    /// Flag version for reporting, per [`FeatureFlag::version_for_events`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Caller-defined structured payload for custom events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Start of the summarized cycle.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub start_date: Option<Timestamp>,
    /// End of the summarized cycle.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub end_date: Option<Timestamp>,
    /// Per-flag counters of the summarized cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<serde_json::Value>,
}

impl Event {
    fn base(kind: EventKind, key: impl Into<String>) -> Event {
        Event {
            kind,
            key: key.into(),
            creation_date: Utc::now(),
            identity: None,
            value: FlagValue::Null,
            default_value: None,
            variation: None,
            version: None,
            data: None,
            start_date: None,
            end_date: None,
            features: None,
        }
    }

    /// A tracked evaluation of `flag_key`.
    pub fn feature(
        flag_key: impl Into<String>,
        value: FlagValue,
        default_value: FlagValue,
        flag: Option<&FeatureFlag>,
        identity: Identity,
    ) -> Event {
        Event {
            identity: Some(identity),
            value,
            default_value: Some(default_value),
            variation: flag.and_then(|f| f.variation),
            version: flag.and_then(|f| f.version_for_events()),
            ..Event::base(EventKind::Feature, flag_key)
        }
    }

    /// A diagnostic copy of an evaluation, emitted during the flag's debug window.
    pub fn debug(
        flag_key: impl Into<String>,
        value: FlagValue,
        default_value: FlagValue,
        flag: Option<&FeatureFlag>,
        identity: Identity,
    ) -> Event {
        Event {
            kind: EventKind::Debug,
            ..Event::feature(flag_key, value, default_value, flag, identity)
        }
    }

    /// Records that `identity` became active.
    pub fn identify(identity: Identity) -> Event {
        Event {
            identity: Some(identity.clone()),
            ..Event::base(EventKind::Identify, identity.key)
        }
    }

    /// A caller-defined event with an optional structured payload.
    pub fn custom(
        key: impl Into<String>,
        identity: Identity,
        data: Option<serde_json::Value>,
    ) -> Event {
        Event {
            identity: Some(identity),
            data,
            ..Event::base(EventKind::Custom, key)
        }
    }

    /// The per-cycle summary, built from the request tracker's counters.
    pub fn summary(
        start_date: Timestamp,
        end_date: Timestamp,
        features: serde_json::Value,
    ) -> Event {
        Event {
            start_date: Some(start_date),
            end_date: Some(end_date),
            features: Some(features),
            ..Event::base(EventKind::Summary, String::new())
        }
    }
}
