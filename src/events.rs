//! Analytics pipeline.
//!
//! Flag evaluations and caller activity are turned into [`Event`]s, queued in a
//! capacity-bounded buffer, summarized per flush cycle by the [`FlagRequestTracker`], and
//! published by the [`EventReporter`] on a timer or on demand.
mod event;
mod event_reporter;
mod flag_request_tracker;

pub use event::{Event, EventKind};
pub use event_reporter::EventReporter;
pub use flag_request_tracker::FlagRequestTracker;
