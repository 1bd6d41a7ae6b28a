//! Flag synchronization.
//!
//! [`FlagSynchronizer`] keeps flag data flowing from the backend: in streaming mode it holds a
//! push connection open and turns named protocol messages into results; in polling mode it
//! requests the full flag set on an interval. Results go to a caller-supplied callback; the
//! synchronizer never retries on its own beyond the single REPORT→GET fallback, so reconnect
//! pacing after failures is the caller's job (typically via the
//! [`Throttler`](crate::throttler::Throttler)).
use std::collections::HashMap;
use std::sync::mpsc::{channel, sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;

use crate::config::SyncConfig;
use crate::feature_flag::{flag_collection, DeleteMessage, FeatureFlag, FlagKey};
use crate::service::{FlagRequestService, StreamEvent, StreamHandle};
use crate::{Error, Result};

// REPORT is non-standard; servers rejecting the verb get one GET retry.
const REPORT_RETRY_STATUSES: [u16; 3] = [400, 405, 501];

/// How flag data is kept current while online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// Persistent server-push connection.
    Streaming,
    /// Repeated flag requests at the configured interval.
    Polling,
}

/// Which wire event produced a successful result. Polling responses carry no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdateType {
    /// The server asked the client to re-request the full flag set.
    Ping,
    /// Full flag set replacement.
    Put,
    /// Single-flag update.
    Patch,
    /// Single-flag removal.
    Delete,
}

/// The flag data carried by one successful synchronization result.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagUpdatePayload {
    /// Replace the whole flag set.
    Replace(HashMap<FlagKey, FeatureFlag>),
    /// Apply one flag patch under the store's version rule.
    Patch(FeatureFlag),
    /// Remove one flag under the store's version rule.
    Delete(DeleteMessage),
}

/// One successful synchronization result.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncUpdate {
    /// The flag data to apply.
    pub payload: FlagUpdatePayload,
    /// The wire event that produced it; `None` for plain polling responses.
    pub event: Option<FlagUpdateType>,
}

/// Receives every synchronization result, successful or not. Invoked from the synchronizer's
/// delivery threads.
pub type SyncCallback = Box<dyn Fn(Result<SyncUpdate>) + Send + Sync>;

struct SyncState {
    online: bool,
    mode: StreamingMode,
    // Bumped on every transport stop/start; results tagged with a stale generation are
    // discarded instead of reaching the callback.
    generation: u64,
    stream: Option<Box<dyn StreamHandle>>,
    poll_stop: Option<SyncSender<()>>,
}

struct SyncInner {
    config: SyncConfig,
    service: Arc<dyn FlagRequestService>,
    callback: SyncCallback,
    state: Mutex<SyncState>,
}

/// Streaming/polling state machine feeding flag data to a callback.
pub struct FlagSynchronizer {
    inner: Arc<SyncInner>,
}

impl FlagSynchronizer {
    /// Create an offline synchronizer. Call [`FlagSynchronizer::set_online`] to start.
    pub fn new(
        config: SyncConfig,
        mode: StreamingMode,
        service: Arc<dyn FlagRequestService>,
        callback: SyncCallback,
    ) -> FlagSynchronizer {
        FlagSynchronizer {
            inner: Arc::new(SyncInner {
                config,
                service,
                callback,
                state: Mutex::new(SyncState {
                    online: false,
                    mode,
                    generation: 0,
                    stream: None,
                    poll_stop: None,
                }),
            }),
        }
    }

    /// Whether a transport is currently active.
    pub fn is_online(&self) -> bool {
        self.inner.lock_state().online
    }

    /// The current transport mode.
    pub fn streaming_mode(&self) -> StreamingMode {
        self.inner.lock_state().mode
    }

    /// Start or stop the transport. Repeating the current state is a no-op and never
    /// duplicates connections or requests.
    pub fn set_online(&self, online: bool) {
        let mut state = self.inner.lock_state();
        if state.online == online {
            return;
        }
        state.online = online;
        if online {
            log::debug!(target: "flagsync", "synchronizer going online ({:?})", state.mode);
            start_transport(&self.inner, &mut state);
        } else {
            log::debug!(target: "flagsync", "synchronizer going offline");
            stop_transport(&mut state);
        }
    }

    /// Switch between streaming and polling. While online, the old transport stops and the new
    /// one starts as if transitioning from offline.
    pub fn set_streaming_mode(&self, mode: StreamingMode) {
        let mut state = self.inner.lock_state();
        if state.mode == mode {
            return;
        }
        state.mode = mode;
        if state.online {
            log::debug!(target: "flagsync", "synchronizer switching to {mode:?}");
            stop_transport(&mut state);
            start_transport(&self.inner, &mut state);
        }
    }
}

impl Drop for FlagSynchronizer {
    fn drop(&mut self) {
        self.set_online(false);
    }
}

fn stop_transport(state: &mut SyncState) {
    state.generation += 1;
    if let Some(stream) = state.stream.take() {
        stream.close();
    }
    state.poll_stop = None;
}

fn start_transport(inner: &Arc<SyncInner>, state: &mut SyncState) {
    state.generation += 1;
    let generation = state.generation;
    match state.mode {
        StreamingMode::Streaming => {
            // Connecting blocks on the network, so it happens on the worker thread; the caller
            // returns immediately and the handle lands in state under the generation guard.
            let (event_tx, event_rx) = channel::<StreamEvent>();
            let inner = Arc::clone(inner);
            std::thread::spawn(move || match inner.service.open_stream(event_tx) {
                Ok(handle) => {
                    {
                        let mut state = inner.lock_state();
                        if !state.online || state.generation != generation {
                            handle.close();
                            return;
                        }
                        state.stream = Some(handle);
                    }
                    for event in event_rx {
                        inner.handle_stream_event(generation, event);
                    }
                }
                Err(err) => {
                    log::warn!(target: "flagsync", "failed to open stream: {err}");
                    inner.deliver(generation, Err(err));
                }
            });
        }
        StreamingMode::Polling => {
            let (stop_tx, stop_rx) = sync_channel::<()>(1);
            state.poll_stop = Some(stop_tx);
            let interval = inner.config.polling_interval;
            let inner = Arc::clone(inner);
            // First request fires immediately, then on the interval.
            std::thread::spawn(move || loop {
                let result = inner.make_flag_request().map(|flags| SyncUpdate {
                    payload: FlagUpdatePayload::Replace(flags),
                    event: None,
                });
                inner.deliver(generation, result);
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            });
        }
    }
}

impl SyncInner {
    fn handle_stream_event(&self, generation: u64, event: StreamEvent) {
        if self.is_stale(generation) {
            log::debug!(target: "flagsync", "discarding stale stream event");
            return;
        }
        match event {
            StreamEvent::Opened => log::debug!(target: "flagsync", "stream opened"),
            StreamEvent::Closed => log::debug!(target: "flagsync", "stream closed"),
            StreamEvent::Error { status, message } => {
                self.deliver(generation, Err(Error::Event { message, status }));
            }
            StreamEvent::Message { kind, data } => match kind.as_str() {
                "ping" => {
                    let result = self.make_flag_request().map(|flags| SyncUpdate {
                        payload: FlagUpdatePayload::Replace(flags),
                        event: Some(FlagUpdateType::Ping),
                    });
                    self.deliver(generation, result);
                }
                "put" => {
                    let result = parse_body::<HashMap<FlagKey, FeatureFlag>>(&data).map(|flags| {
                        SyncUpdate {
                            payload: FlagUpdatePayload::Replace(flag_collection(flags)),
                            event: Some(FlagUpdateType::Put),
                        }
                    });
                    self.deliver(generation, result);
                }
                "patch" => {
                    let result = parse_body::<FeatureFlag>(&data).map(|flag| SyncUpdate {
                        payload: FlagUpdatePayload::Patch(flag),
                        event: Some(FlagUpdateType::Patch),
                    });
                    self.deliver(generation, result);
                }
                "delete" => {
                    let result = parse_body::<DeleteMessage>(&data).map(|delete| SyncUpdate {
                        payload: FlagUpdatePayload::Delete(delete),
                        event: Some(FlagUpdateType::Delete),
                    });
                    self.deliver(generation, result);
                }
                "error" => {
                    let status = serde_json::from_str::<StreamErrorBody>(&data)
                        .ok()
                        .and_then(|body| body.status);
                    self.deliver(generation, Err(Error::Event { message: data, status }));
                }
                // Data-only frames carry nothing in this protocol.
                "" => {}
                other => {
                    self.deliver(generation, Err(Error::UnknownEventType(other.to_owned())));
                }
            },
        }
    }

    // A REPORT rejected for its verb is retried once with GET; every other outcome stands.
    fn make_flag_request(&self) -> Result<HashMap<FlagKey, FeatureFlag>> {
        if self.config.use_report {
            match self.service.get_feature_flags(true) {
                Err(Error::Response { status }) if REPORT_RETRY_STATUSES.contains(&status) => {
                    log::debug!(
                        target: "flagsync",
                        "REPORT rejected with {status}, retrying with GET"
                    );
                    self.service.get_feature_flags(false).map(|r| r.flags)
                }
                other => other.map(|r| r.flags),
            }
        } else {
            self.service.get_feature_flags(false).map(|r| r.flags)
        }
    }

    fn deliver(&self, generation: u64, result: Result<SyncUpdate>) {
        if self.is_stale(generation) {
            log::debug!(target: "flagsync", "discarding stale sync result");
            return;
        }
        (self.callback)(result);
    }

    fn is_stale(&self, generation: u64) -> bool {
        let state = self.lock_state();
        !state.online || state.generation != generation
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state
            .lock()
            .expect("thread holding synchronizer lock should not panic")
    }
}

#[derive(Deserialize)]
struct StreamErrorBody {
    status: Option<u16>,
}

fn parse_body<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    if data.trim().is_empty() {
        return Err(Error::Data(None));
    }
    serde_json::from_str(data).map_err(|_| Error::Data(Some(data.as_bytes().to_vec())))
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::{FlagSynchronizer, FlagUpdatePayload, FlagUpdateType, StreamingMode, SyncUpdate};
    use crate::config::SyncConfig;
    use crate::feature_flag::FeatureFlag;
    use crate::flag_store::{FlagStore, FlagsSource};
    use crate::service::{
        FlagRequestService, ServiceResponse, StreamEvent, StreamHandle,
    };
    use crate::{Error, FlagValue, Result};

    struct MockHandle {
        closed: Arc<AtomicBool>,
    }

    impl StreamHandle for MockHandle {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockFlagService {
        // Queued responses for get_feature_flags; empty queue serves an empty flag set.
        responses: Mutex<VecDeque<Result<ServiceResponse>>>,
        requests: Mutex<Vec<bool>>,
        sink: Mutex<Option<Sender<StreamEvent>>>,
        open_delay: Mutex<Duration>,
        open_error: Mutex<Option<Error>>,
    }

    impl MockFlagService {
        fn push_response(&self, response: Result<ServiceResponse>) {
            self.responses.lock().unwrap().push_back(response);
        }

        // The stream opens on the synchronizer's worker thread, so wait for it.
        fn send(&self, event: StreamEvent) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                {
                    let sink = self.sink.lock().unwrap();
                    if let Some(sink) = sink.as_ref() {
                        // A dropped receiver means the transport was superseded;
                        // the event is discarded, which is what staleness tests expect.
                        let _ = sink.send(event);
                        return;
                    }
                }
                assert!(Instant::now() < deadline, "stream should be open");
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        fn message(&self, kind: &str, data: &str) {
            self.send(StreamEvent::Message {
                kind: kind.to_owned(),
                data: data.to_owned(),
            });
        }

        fn request_verbs(&self) -> Vec<bool> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl FlagRequestService for MockFlagService {
        fn get_feature_flags(&self, use_report: bool) -> Result<ServiceResponse> {
            self.requests.lock().unwrap().push(use_report);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ServiceResponse { flags: HashMap::new() }))
        }

        fn open_stream(&self, sink: Sender<StreamEvent>) -> Result<Box<dyn StreamHandle>> {
            let delay = *self.open_delay.lock().unwrap();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            if let Some(err) = self.open_error.lock().unwrap().clone() {
                return Err(err);
            }
            *self.sink.lock().unwrap() = Some(sink);
            Ok(Box::new(MockHandle {
                closed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    struct Harness {
        service: Arc<MockFlagService>,
        store: Arc<FlagStore>,
        errors: Arc<Mutex<Vec<Error>>>,
        updates: Arc<Mutex<Vec<SyncUpdate>>>,
        synchronizer: FlagSynchronizer,
    }

    fn harness(config: SyncConfig, mode: StreamingMode) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let service = Arc::new(MockFlagService::default());
        let store = Arc::new(FlagStore::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let updates = Arc::new(Mutex::new(Vec::new()));

        let callback = {
            let store = store.clone();
            let errors = errors.clone();
            let updates = updates.clone();
            Box::new(move |result: Result<SyncUpdate>| match result {
                Ok(update) => {
                    match update.payload.clone() {
                        FlagUpdatePayload::Replace(flags) => {
                            store.replace(flags, FlagsSource::Server)
                        }
                        FlagUpdatePayload::Patch(flag) => store.update(flag, FlagsSource::Server),
                        FlagUpdatePayload::Delete(delete) => store.delete(delete),
                    }
                    updates.lock().unwrap().push(update);
                }
                Err(err) => errors.lock().unwrap().push(err),
            })
        };

        let synchronizer = FlagSynchronizer::new(config, mode, service.clone(), callback);
        Harness {
            service,
            store,
            errors,
            updates,
            synchronizer,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within timeout");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn slow_poll_config() -> SyncConfig {
        SyncConfig::new().with_polling_interval(Duration::from_secs(3600))
    }

    #[test]
    fn streaming_applies_put_patch_stale_patch_and_delete_in_order() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);

        h.service
            .message("put", r#"{"a": {"value": 1, "version": 1}}"#);
        wait_until(|| h.store.variation("a", FlagValue::Null).0 == FlagValue::Int(1));

        h.service
            .message("patch", r#"{"key": "a", "value": 2, "version": 2}"#);
        wait_until(|| h.store.variation("a", FlagValue::Null).0 == FlagValue::Int(2));

        // Stale patch must not regress the value.
        h.service
            .message("patch", r#"{"key": "a", "value": 3, "version": 1}"#);
        h.service
            .message("delete", r#"{"key": "a", "version": 3}"#);
        wait_until(|| h.store.get("a").is_none());

        let (value, source) = h.store.variation("a", FlagValue::Int(42));
        assert_eq!(value, FlagValue::Int(42));
        assert_eq!(source, FlagsSource::Fallback);

        let events: Vec<_> = h.updates.lock().unwrap().iter().map(|u| u.event).collect();
        assert_eq!(
            events,
            [
                Some(FlagUpdateType::Put),
                Some(FlagUpdateType::Patch),
                Some(FlagUpdateType::Patch),
                Some(FlagUpdateType::Delete),
            ]
        );
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn ping_triggers_a_flag_request() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        let mut flags = HashMap::new();
        flags.insert(
            "a".to_owned(),
            FeatureFlag {
                key: "a".to_owned(),
                value: FlagValue::Bool(true),
                variation: None,
                version: Some(1),
                flag_version: None,
                track_events: false,
                debug_events_until_date: None,
            },
        );
        h.service.push_response(Ok(ServiceResponse { flags }));
        h.synchronizer.set_online(true);

        h.service.message("ping", "");
        wait_until(|| h.store.get("a").is_some());

        let updates = h.updates.lock().unwrap();
        assert_eq!(updates[0].event, Some(FlagUpdateType::Ping));
        assert_eq!(h.service.request_verbs(), [false]);
    }

    #[test]
    fn malformed_bodies_surface_data_errors() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);

        h.service.message("put", "not json");
        h.service.message("patch", "");
        wait_until(|| h.errors.lock().unwrap().len() == 2);

        let errors = h.errors.lock().unwrap();
        assert!(matches!(&errors[0], Error::Data(Some(raw)) if raw == b"not json"));
        assert!(matches!(&errors[1], Error::Data(None)));
        assert!(h.store.all_flags().is_empty());
    }

    #[test]
    fn stream_error_messages_carry_unauthorized_status() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);

        h.service.message("error", r#"{"status": 401}"#);
        wait_until(|| !h.errors.lock().unwrap().is_empty());

        let errors = h.errors.lock().unwrap();
        assert!(errors[0].is_unauthorized());
    }

    #[test]
    fn unknown_event_types_are_reported() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);

        h.service.message("reindex", "{}");
        wait_until(|| !h.errors.lock().unwrap().is_empty());

        let errors = h.errors.lock().unwrap();
        assert!(matches!(&errors[0], Error::UnknownEventType(kind) if kind == "reindex"));
    }

    #[test]
    fn heartbeat_frames_produce_no_callback() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);

        h.service.send(StreamEvent::Opened);
        h.service.message("", "heartbeat");
        h.service
            .message("put", r#"{"a": {"value": 1, "version": 1}}"#);
        wait_until(|| h.store.get("a").is_some());

        assert_eq!(h.updates.lock().unwrap().len(), 1);
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn going_online_does_not_block_on_the_stream_connection() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        *h.service.open_delay.lock().unwrap() = Duration::from_millis(300);

        let started = Instant::now();
        h.synchronizer.set_online(true);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(h.synchronizer.is_online());

        // The connection still comes up and delivers.
        h.service
            .message("put", r#"{"a": {"value": 1, "version": 1}}"#);
        wait_until(|| h.store.get("a").is_some());
    }

    #[test]
    fn stream_open_failures_reach_the_callback() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        *h.service.open_error.lock().unwrap() = Some(Error::Response { status: 503 });

        h.synchronizer.set_online(true);
        wait_until(|| !h.errors.lock().unwrap().is_empty());
        assert!(matches!(
            h.errors.lock().unwrap()[0],
            Error::Response { status: 503 }
        ));
    }

    #[test]
    fn events_after_going_offline_are_discarded() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);
        h.service
            .message("put", r#"{"a": {"value": 1, "version": 1}}"#);
        wait_until(|| h.store.get("a").is_some());

        h.synchronizer.set_online(false);
        h.service
            .message("patch", r#"{"key": "a", "value": 2, "version": 2}"#);
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(h.store.get("a").unwrap().0.value, FlagValue::Int(1));
        assert_eq!(h.updates.lock().unwrap().len(), 1);
    }

    #[test]
    fn polling_requests_immediately_and_repeat_transitions_are_no_ops() {
        let h = harness(slow_poll_config(), StreamingMode::Polling);
        h.synchronizer.set_online(true);
        h.synchronizer.set_online(true);
        wait_until(|| !h.updates.lock().unwrap().is_empty());

        assert_eq!(h.service.request_verbs().len(), 1);
        let updates = h.updates.lock().unwrap();
        assert_eq!(updates[0].event, None);
        assert!(matches!(updates[0].payload, FlagUpdatePayload::Replace(_)));
    }

    #[test]
    fn report_falls_back_to_get_on_method_rejection() {
        let h = harness(
            slow_poll_config().with_use_report(true),
            StreamingMode::Polling,
        );
        h.service
            .push_response(Err(Error::Response { status: 405 }));
        h.synchronizer.set_online(true);
        wait_until(|| !h.updates.lock().unwrap().is_empty());

        assert_eq!(h.service.request_verbs(), [true, false]);
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn report_errors_outside_the_retry_set_stand() {
        let h = harness(
            slow_poll_config().with_use_report(true),
            StreamingMode::Polling,
        );
        h.service
            .push_response(Err(Error::Response { status: 401 }));
        h.synchronizer.set_online(true);
        wait_until(|| !h.errors.lock().unwrap().is_empty());

        assert_eq!(h.service.request_verbs(), [true]);
        let errors = h.errors.lock().unwrap();
        assert!(errors[0].is_unauthorized());
    }

    #[test]
    fn mode_switch_while_online_restarts_the_transport() {
        let h = harness(slow_poll_config(), StreamingMode::Streaming);
        h.synchronizer.set_online(true);
        assert_eq!(h.synchronizer.streaming_mode(), StreamingMode::Streaming);
        assert!(h.service.request_verbs().is_empty());

        h.synchronizer.set_streaming_mode(StreamingMode::Polling);
        wait_until(|| !h.updates.lock().unwrap().is_empty());
        assert_eq!(h.synchronizer.streaming_mode(), StreamingMode::Polling);

        // Stream events from the superseded transport are stale now.
        h.service
            .message("put", r#"{"stale": {"value": 1, "version": 1}}"#);
        std::thread::sleep(Duration::from_millis(200));
        assert!(h.store.get("stale").is_none());
    }

    #[test]
    fn polling_failures_reach_the_callback_and_leave_flags_alone() {
        let h = harness(slow_poll_config(), StreamingMode::Polling);
        h.store.replace(
            HashMap::new(),
            FlagsSource::Cache,
        );
        h.service
            .push_response(Err(Error::Response { status: 503 }));
        h.synchronizer.set_online(true);
        wait_until(|| !h.errors.lock().unwrap().is_empty());

        assert!(matches!(h.errors.lock().unwrap()[0], Error::Response { status: 503 }));
        assert_eq!(h.store.source(), FlagsSource::Cache);
    }
}
