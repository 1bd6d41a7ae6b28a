//! `flagsync_core` is a set of building blocks for client-side feature flag SDKs. It keeps a
//! local set of remotely-managed flag values synchronized with a backend service and reports
//! usage analytics back to it. Public SDK facades are built on top of this crate.
//!
//! # Overview
//!
//! [`FlagStore`](flag_store::FlagStore) is a thread-safe, identity-scoped map from flag key to
//! [`FeatureFlag`]. Writers (the synchronizer's delivery thread) replace the whole set or apply
//! single-flag patches/deletes under a monotonic-version rule; readers get consistent snapshots.
//!
//! [`FlagSynchronizer`](synchronizer::FlagSynchronizer) owns a streaming or polling transport to
//! the flag service, parses incoming protocol messages, and reports
//! [`SyncUpdate`](synchronizer::SyncUpdate)s to a caller-supplied callback. It never retries on
//! its own (beyond the single REPORT→GET fallback); reconnect pacing is the caller's job,
//! typically via the [`Throttler`](throttler::Throttler).
//!
//! [`FlagChangeNotifier`](flag_change::FlagChangeNotifier) diffs an old flag snapshot against a
//! new one and dispatches typed change callbacks to weakly-held observers, off the caller's
//! thread.
//!
//! [`EventReporter`](events::EventReporter) accumulates analytics [`Event`](events::Event)s and
//! per-cycle flag-request summaries in a capacity-bounded queue, flushing on a timer or on
//! demand.
//!
//! Transports are abstracted behind the traits in [`service`], with default
//! `reqwest`-based implementations. The facade that wires one store, one synchronizer, one
//! notifier, and one reporter together per active identity lives outside this crate.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod config;
pub mod environment;
pub mod events;
pub mod flag_change;
pub mod flag_store;
pub mod service;
pub mod synchronizer;
pub mod throttler;

mod error;
mod feature_flag;
mod flag_value;
mod identity;

pub use error::{Error, Result};
pub use feature_flag::{flag_collection, DeleteMessage, FeatureFlag, FlagKey, Timestamp};
pub use flag_value::FlagValue;
pub use identity::Identity;
