//! Transport to the backend.
//!
//! The synchronizer and event reporter talk to the network through the [`FlagRequestService`]
//! and [`EventService`] traits, so tests can substitute in-process fakes. The default
//! implementations use blocking `reqwest` driven from the components' own worker threads.
use std::collections::HashMap;
use std::io::BufRead;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::Method;
use url::Url;

use crate::config::ServiceConfig;
use crate::events::Event;
use crate::feature_flag::{flag_collection, FeatureFlag, FlagKey, Timestamp};
use crate::{Error, Identity, Result};

/// A successful flag request's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    /// The full flag set for the requested identity.
    pub flags: HashMap<FlagKey, FeatureFlag>,
}

/// A successful event publish's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResponse {
    /// Server clock reference from the response `Date` header, used to correct local clock skew
    /// for debug-event windowing.
    pub server_date: Option<Timestamp>,
}

/// One event delivered by the push stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A named protocol message with its body.
    Message {
        /// Message name (`put`, `patch`, `delete`, `ping`, `error`).
        kind: String,
        /// Raw message body.
        data: String,
    },
    /// A transport-level stream failure.
    Error {
        /// HTTP status, when the failure carried one.
        status: Option<u16>,
        /// Human-readable description.
        message: String,
    },
    /// The stream connected.
    Opened,
    /// The stream ended (server close, EOF, or after an error).
    Closed,
}

/// Handle to an open push stream.
pub trait StreamHandle: Send {
    /// Ask the reader to stop. Does not interrupt a read already blocked on the socket; late
    /// events are discarded by the consumer instead.
    fn close(&self);
}

/// Flag retrieval transport: one-shot requests and the push stream.
pub trait FlagRequestService: Send + Sync {
    /// Fetch the full flag set, using the REPORT verb when `use_report` is set and GET
    /// otherwise. Blocking; callers drive this from a worker thread.
    fn get_feature_flags(&self, use_report: bool) -> Result<ServiceResponse>;

    /// Open the push stream, delivering events into `sink` from a transport-owned thread.
    fn open_stream(&self, sink: Sender<StreamEvent>) -> Result<Box<dyn StreamHandle>>;
}

/// Analytics publish transport.
pub trait EventService: Send + Sync {
    /// POST `events` as one JSON array. `payload_id` identifies the batch across retries.
    fn publish_events(&self, events: &[Event], payload_id: &str) -> Result<PublishResponse>;
}

/// Default [`FlagRequestService`] over HTTP(S).
pub struct HttpFlagService {
    client: Client,
    identity: Identity,
    get_url: Url,
    report_url: Url,
    stream_url: Url,
    report_method: Method,
}

impl HttpFlagService {
    /// Create a service scoped to one identity's endpoints.
    pub fn new(config: &ServiceConfig, identity: Identity) -> Result<HttpFlagService> {
        let params = [
            ("apiKey", config.sdk_key.as_str()),
            ("sdkName", config.sdk_name.as_str()),
            ("sdkVersion", config.sdk_version.as_str()),
        ];
        let get_url = Url::parse_with_params(
            &format!("{}/flags/{}", config.base_url, identity.key),
            params,
        )
        .map_err(Error::InvalidBaseUrl)?;
        // REPORT carries the identity in the request body instead of the path.
        let report_url = Url::parse_with_params(&format!("{}/flags", config.base_url), params)
            .map_err(Error::InvalidBaseUrl)?;
        let stream_url = Url::parse_with_params(
            &format!("{}/stream/{}", config.stream_url, identity.key),
            params,
        )
        .map_err(Error::InvalidBaseUrl)?;
        let report_method =
            Method::from_bytes(b"REPORT").map_err(|err| Error::Request(Arc::new(err)))?;
        Ok(HttpFlagService {
            client: Client::new(),
            identity,
            get_url,
            report_url,
            stream_url,
            report_method,
        })
    }
}

impl FlagRequestService for HttpFlagService {
    fn get_feature_flags(&self, use_report: bool) -> Result<ServiceResponse> {
        let request = if use_report {
            self.client
                .request(self.report_method.clone(), self.report_url.clone())
                .json(&self.identity)
        } else {
            self.client.get(self.get_url.clone())
        };
        let response = request.send()?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagsync", "flag request failed: {status}");
            return Err(Error::Response {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes()?;
        let flags: HashMap<FlagKey, FeatureFlag> = serde_json::from_slice(&bytes).map_err(|err| {
            log::warn!(target: "flagsync", "failed to parse flag response: {err}");
            Error::Data(Some(bytes.to_vec()))
        })?;
        log::debug!(target: "flagsync", "fetched {} flags", flags.len());
        Ok(ServiceResponse {
            flags: flag_collection(flags),
        })
    }

    fn open_stream(&self, sink: Sender<StreamEvent>) -> Result<Box<dyn StreamHandle>> {
        let response = self
            .client
            .get(self.stream_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagsync", "stream connection rejected: {status}");
            return Err(Error::Response {
                status: status.as_u16(),
            });
        }

        log::debug!(target: "flagsync", "stream connected");
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = Arc::clone(&closed);
        std::thread::spawn(move || {
            let _ = sink.send(StreamEvent::Opened);
            read_stream(BufReader::new(response), &sink, &reader_closed);
        });
        Ok(Box::new(SseStreamHandle { closed }))
    }
}

struct SseStreamHandle {
    closed: Arc<AtomicBool>,
}

impl StreamHandle for SseStreamHandle {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// Minimal server-sent-events reader: `event:` names the message, `data:` lines accumulate the
// body, a blank line dispatches. Comment lines (leading ':') are heartbeats and produce nothing.
fn read_stream<R: BufRead>(mut reader: R, sink: &Sender<StreamEvent>, closed: &AtomicBool) {
    let mut kind = String::new();
    let mut data = String::new();
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => {
                let _ = sink.send(StreamEvent::Closed);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = sink.send(StreamEvent::Error {
                    status: None,
                    message: err.to_string(),
                });
                let _ = sink.send(StreamEvent::Closed);
                return;
            }
        }
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

        if line.is_empty() {
            if !kind.is_empty() || !data.is_empty() {
                let event = StreamEvent::Message {
                    kind: std::mem::take(&mut kind),
                    data: std::mem::take(&mut data),
                };
                if sink.send(event).is_err() {
                    return;
                }
            }
        } else if line.starts_with(':') {
            // heartbeat
        } else if let Some(rest) = line.strip_prefix("event:") {
            kind = rest.trim_start().to_owned();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // id: and retry: fields are not part of this protocol and fall through ignored.
    }
}

/// Default [`EventService`] over HTTP(S).
pub struct HttpEventService {
    client: Client,
    events_url: Url,
}

impl HttpEventService {
    /// Create a service for the configured events endpoint.
    pub fn new(config: &ServiceConfig) -> Result<HttpEventService> {
        let events_url = Url::parse_with_params(
            &format!("{}/events/bulk", config.events_url),
            [
                ("apiKey", config.sdk_key.as_str()),
                ("sdkName", config.sdk_name.as_str()),
                ("sdkVersion", config.sdk_version.as_str()),
            ],
        )
        .map_err(Error::InvalidBaseUrl)?;
        Ok(HttpEventService {
            client: Client::new(),
            events_url,
        })
    }
}

impl EventService for HttpEventService {
    fn publish_events(&self, events: &[Event], payload_id: &str) -> Result<PublishResponse> {
        let response = self
            .client
            .post(self.events_url.clone())
            .header("X-Payload-ID", payload_id)
            .json(events)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagsync", "event publish failed: {status}");
            return Err(Error::Response {
                status: status.as_u16(),
            });
        }

        let server_date = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
            .map(|date| date.with_timezone(&Utc));
        log::debug!(target: "flagsync", "published {} events", events.len());
        Ok(PublishResponse { server_date })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::channel;

    use super::{read_stream, StreamEvent};

    fn events_from(input: &str) -> Vec<StreamEvent> {
        let (tx, rx) = channel();
        read_stream(Cursor::new(input.to_owned()), &tx, &AtomicBool::new(false));
        drop(tx);
        rx.into_iter().collect()
    }

    #[test]
    fn parses_named_messages() {
        let events = events_from("event: put\ndata: {\"a\":{\"value\":1}}\n\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::Message {
                    kind: "put".to_owned(),
                    data: "{\"a\":{\"value\":1}}".to_owned(),
                },
                StreamEvent::Closed,
            ]
        );
    }

    #[test]
    fn joins_multiline_data() {
        let events = events_from("event: patch\ndata: line1\ndata: line2\n\n");
        assert_eq!(
            events[0],
            StreamEvent::Message {
                kind: "patch".to_owned(),
                data: "line1\nline2".to_owned(),
            }
        );
    }

    #[test]
    fn heartbeats_and_blank_lines_produce_nothing() {
        let events = events_from(":keepalive\n\n:another\n\n");
        assert_eq!(events, vec![StreamEvent::Closed]);
    }

    #[test]
    fn dispatches_data_only_messages_with_empty_kind() {
        let events = events_from("data: ignored-by-consumer\n\n");
        assert_eq!(
            events[0],
            StreamEvent::Message {
                kind: String::new(),
                data: "ignored-by-consumer".to_owned(),
            }
        );
    }

    #[test]
    fn eof_without_trailing_blank_line_drops_the_partial_message() {
        let events = events_from("event: put\ndata: {\"a\":1}");
        assert_eq!(events, vec![StreamEvent::Closed]);
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let events = events_from("event: ping\r\ndata:\r\n\r\n");
        assert_eq!(
            events[0],
            StreamEvent::Message {
                kind: "ping".to_owned(),
                data: String::new(),
            }
        );
    }
}
