use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::config::EventsConfig;
use crate::events::{Event, FlagRequestTracker};
use crate::feature_flag::{FeatureFlag, Timestamp};
use crate::service::EventService;
use crate::{Error, FlagValue, Identity, Result};

struct ReporterState {
    config: EventsConfig,
    online: bool,
    events: Vec<Event>,
    tracker: FlagRequestTracker,
    last_event_response_date: Option<Timestamp>,
    flush_stop: Option<SyncSender<()>>,
    // Bumped on every offline transition or reconfiguration; a flush result carrying a stale
    // generation is discarded without touching the queue.
    generation: u64,
    // True while a publish is on the wire. Guarantees at most one flush cycle at a time, so a
    // completed flush can drain exactly the batch it published.
    in_flight: bool,
}

struct ReporterInner {
    service: Arc<dyn EventService>,
    state: Mutex<ReporterState>,
}

/// Capacity-bounded, periodically-flushed analytics pipeline.
///
/// Recording always succeeds up to capacity, online or not; `online` only gates flushing. A
/// full queue drops new events rather than rotating old ones out, and a failed flush leaves the
/// queue untouched for the next attempt.
pub struct EventReporter {
    inner: Arc<ReporterInner>,
}

impl EventReporter {
    /// Create an offline reporter. Call [`EventReporter::set_online`] to start the flush timer.
    pub fn new(config: EventsConfig, service: Arc<dyn EventService>) -> EventReporter {
        EventReporter {
            inner: Arc::new(ReporterInner {
                service,
                state: Mutex::new(ReporterState {
                    config,
                    online: false,
                    events: Vec::new(),
                    tracker: FlagRequestTracker::new(),
                    last_event_response_date: None,
                    flush_stop: None,
                    generation: 0,
                    in_flight: false,
                }),
            }),
        }
    }

    /// Whether flushing is currently enabled.
    pub fn is_online(&self) -> bool {
        self.inner.lock_state().online
    }

    /// Enable or disable flushing. Going online starts the periodic flush timer; going offline
    /// stops it and invalidates any in-flight flush.
    pub fn set_online(&self, online: bool) {
        let mut state = self.inner.lock_state();
        if state.online == online {
            return;
        }
        if online {
            state.online = true;
            self.start_flush_timer(&mut state);
            log::debug!(target: "flagsync", "event reporter went online");
        } else {
            go_offline(&mut state);
            log::debug!(target: "flagsync", "event reporter went offline");
        }
    }

    /// Append one event, dropping it when the queue is at capacity.
    pub fn record(&self, event: Event) {
        let mut state = self.inner.lock_state();
        record_event(&mut state, event);
    }

    /// Count one flag evaluation and enqueue the feature/debug events it warrants.
    ///
    /// The request tracker is always updated. A `feature` event is enqueued when the record has
    /// event tracking on; a `debug` event is enqueued when the record's debug window is still
    /// open relative to both the local clock and the last flush's server date. Both can fire for
    /// the same evaluation.
    pub fn record_flag_evaluation_events(
        &self,
        flag_key: &str,
        value: FlagValue,
        default_value: FlagValue,
        flag: Option<&FeatureFlag>,
        identity: &Identity,
    ) {
        let mut state = self.inner.lock_state();
        state
            .tracker
            .track_request(flag_key, value.clone(), default_value.clone(), flag);

        let Some(flag) = flag else { return };
        if flag.track_events {
            record_event(
                &mut state,
                Event::feature(flag_key, value.clone(), default_value.clone(), Some(flag), identity.clone()),
            );
        }
        if flag.should_create_debug_events(state.last_event_response_date) {
            record_event(
                &mut state,
                Event::debug(flag_key, value, default_value, Some(flag), identity.clone()),
            );
        }
    }

    /// Fold the current cycle's tracked requests into one summary event and reset the tracker.
    /// A no-op when nothing was tracked.
    pub fn record_summary_event(&self) {
        let mut state = self.inner.lock_state();
        record_summary_event(&mut state);
    }

    /// Flush the queue now. Fails with [`Error::Offline`] when offline; succeeds without a
    /// network call when there is nothing to send.
    pub fn report_events(&self) -> Result<()> {
        self.inner.report_events()
    }

    /// Apply a new configuration. Forces the reporter offline first; the caller must go online
    /// again explicitly.
    pub fn reconfigure(&self, config: EventsConfig) {
        let mut state = self.inner.lock_state();
        go_offline(&mut state);
        state.config = config;
        log::debug!(target: "flagsync", "event reporter reconfigured while offline");
    }

    /// Number of events currently queued.
    pub fn queued_event_count(&self) -> usize {
        self.inner.lock_state().events.len()
    }

    /// Server clock reference from the last successful flush.
    pub fn last_event_response_date(&self) -> Option<Timestamp> {
        self.inner.lock_state().last_event_response_date
    }

    fn start_flush_timer(&self, state: &mut ReporterState) {
        state.generation += 1;
        let (stop_tx, stop_rx) = sync_channel::<()>(1);
        state.flush_stop = Some(stop_tx);
        let interval = state.config.flush_interval;

        // The timer holds the reporter weakly so dropping the reporter ends the thread.
        let inner = Arc::downgrade(&self.inner);
        std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(inner) = inner.upgrade() else { return };
                    if let Err(err) = inner.report_events() {
                        log::warn!(target: "flagsync", "periodic event flush failed: {err}");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        });
    }
}

impl Drop for EventReporter {
    fn drop(&mut self) {
        self.set_online(false);
    }
}

impl ReporterInner {
    fn report_events(&self) -> Result<()> {
        let (batch, generation) = {
            let mut state = self.lock_state();
            if !state.online {
                return Err(Error::Offline);
            }
            if state.in_flight {
                log::debug!(target: "flagsync", "flush already in flight");
                return Ok(());
            }
            record_summary_event(&mut state);
            if state.events.is_empty() {
                log::debug!(target: "flagsync", "nothing to flush");
                return Ok(());
            }
            state.in_flight = true;
            (state.events.clone(), state.generation)
        };

        let payload_id = format!("{:032x}", rand::random::<u128>());
        let result = self.service.publish_events(&batch, &payload_id);

        let mut state = self.lock_state();
        state.in_flight = false;
        if state.generation != generation {
            log::debug!(target: "flagsync", "discarding stale event flush result");
            return Err(Error::Offline);
        }
        match result {
            Ok(response) => {
                // Events recorded while the flush was in flight stay queued.
                state.events.drain(..batch.len());
                if response.server_date.is_some() {
                    state.last_event_response_date = response.server_date;
                }
                log::debug!(target: "flagsync", "flushed {} events", batch.len());
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "flagsync", "event flush failed, retaining queue: {err}");
                Err(err)
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ReporterState> {
        self.state
            .lock()
            .expect("thread holding event reporter lock should not panic")
    }
}

fn go_offline(state: &mut ReporterState) {
    state.online = false;
    state.flush_stop = None;
    state.generation += 1;
}

fn record_event(state: &mut ReporterState, event: Event) {
    if state.events.len() >= state.config.event_capacity {
        log::warn!(target: "flagsync", "event queue at capacity, dropping event");
        return;
    }
    state.events.push(event);
}

fn record_summary_event(state: &mut ReporterState) {
    if !state.tracker.has_logged_requests() {
        return;
    }
    let tracker = std::mem::take(&mut state.tracker);
    let event = Event::summary(tracker.start_date(), Utc::now(), tracker.features_payload());
    record_event(state, event);
}
