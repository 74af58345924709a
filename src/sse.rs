//! Real-time flag change notifications over Server-Sent Events.
//!
//! [`SseClient`] keeps a long-lived connection to the realtime endpoint and reconnects with
//! exponential backoff. Change events, status transitions and errors are delivered on three
//! separate bounded channels. None of them ever blocks the connection loop: a full event buffer
//! drops the newest event, full status and error buffers drop the update.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use reqwest::{header, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

const REALTIME_ENDPOINT: &str = "/api/v1/realtime/sse";

/// Upper bound of the reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// The delay stops doubling after this many attempts.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Event types that signal a change to flag definitions.
const CHANGE_EVENT_TYPES: &[&str] = &[
    "flag.created",
    "flag.updated",
    "flag.deleted",
    "flag.toggled",
    "segment.created",
    "segment.updated",
    "segment.deleted",
    "variant.created",
    "variant.updated",
    "variant.deleted",
];

/// Sent by the server right after the stream opens.
const CONNECTION_EVENT_TYPE: &str = "connection";

/// Configuration for [`SseClient`].
#[derive(Debug, Clone)]
pub struct SseConfig {
    pub(crate) auto_reconnect: bool,
    pub(crate) reconnect_delay: Duration,
    pub(crate) max_reconnect_attempts: u32,
    pub(crate) event_buffer_size: usize,
    pub(crate) status_buffer_size: usize,
    pub(crate) error_buffer_size: usize,
    pub(crate) api_key: Option<String>,
}

impl SseConfig {
    /// Default base delay before reconnecting.
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
    /// Default maximum number of consecutive failed attempts. `0` means unlimited.
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 0;
    /// Default capacity of the event channel.
    pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;
    /// Default capacity of the status channel.
    pub const DEFAULT_STATUS_BUFFER_SIZE: usize = 10;
    /// Default capacity of the error channel.
    pub const DEFAULT_ERROR_BUFFER_SIZE: usize = 10;

    #[allow(missing_docs)]
    pub fn new() -> Self {
        SseConfig {
            auto_reconnect: true,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: Self::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            event_buffer_size: Self::DEFAULT_EVENT_BUFFER_SIZE,
            status_buffer_size: Self::DEFAULT_STATUS_BUFFER_SIZE,
            error_buffer_size: Self::DEFAULT_ERROR_BUFFER_SIZE,
            api_key: None,
        }
    }

    /// Reconnect after the stream ends or fails.
    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Base reconnect delay. The n-th consecutive attempt waits `delay * 2^min(n, 6)`, at most 60
    /// seconds.
    pub fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    /// Give up after this many consecutive failed attempts. `0` means unlimited.
    pub fn max_reconnect_attempts(mut self, max_reconnect_attempts: u32) -> Self {
        self.max_reconnect_attempts = max_reconnect_attempts;
        self
    }

    /// Capacity of the event channel.
    pub fn event_buffer_size(mut self, event_buffer_size: usize) -> Self {
        self.event_buffer_size = event_buffer_size;
        self
    }

    /// Capacity of the status channel.
    pub fn status_buffer_size(mut self, status_buffer_size: usize) -> Self {
        self.status_buffer_size = status_buffer_size;
        self
    }

    /// Capacity of the error channel.
    pub fn error_buffer_size(mut self, error_buffer_size: usize) -> Self {
        self.error_buffer_size = error_buffer_size;
        self
    }

    /// Send `api_key` as a bearer token.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// State of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Not connected and not trying to.
    Disconnected = 0,
    /// Opening the stream.
    Connecting = 1,
    /// The stream is open.
    Connected = 2,
    /// The last attempt failed. A reconnect may follow.
    Error = 3,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> ConnectionStatus {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Error,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// A change notification pushed by the server.
///
/// Notifications only say *that* something changed. Consumers are expected to re-fetch the full
/// snapshot rather than apply the notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagUpdateEvent {
    /// Event type, for example `flag.updated`. Taken from the SSE `event:` line when the payload
    /// does not carry one.
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Affected flag, if the server names one.
    #[serde(rename = "flagID", default)]
    pub flag_id: Option<i64>,
    /// Affected flag, if the server names one.
    #[serde(default)]
    pub flag_key: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub message: String,
    /// Extra event-specific fields.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Unix timestamp (milliseconds) of the change on the server.
    #[serde(default)]
    pub timestamp: i64,
}

/// Receiving ends of the channels fed by [`SseClient`].
///
/// All channels close once the connection loop exits.
#[derive(Debug)]
pub struct SseReceivers {
    /// Change notifications.
    pub events: mpsc::Receiver<FlagUpdateEvent>,
    /// Connection status transitions.
    pub status: mpsc::Receiver<ConnectionStatus>,
    /// Connection and parse errors.
    pub errors: mpsc::Receiver<Error>,
}

/// Backoff before the `attempt`-th consecutive reconnect.
pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << attempt.min(MAX_BACKOFF_EXPONENT))
        .min(MAX_BACKOFF)
}

/// State visible to both the client handle and the connection loop.
struct SharedState {
    status: AtomicU8,
    reconnect_attempt: AtomicU32,
}

impl SharedState {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}

struct RunningConnection {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A reconnecting client for the realtime endpoint.
pub struct SseClient {
    // Client holds a connection pool internally, so we're reusing the client between attempts.
    client: reqwest::Client,
    base_url: String,
    config: SseConfig,
    shared: Arc<SharedState>,
    connection: Mutex<Option<RunningConnection>>,
}

impl SseClient {
    /// Create a client for the server at `base_url`. The realtime endpoint path is appended to
    /// it.
    pub fn new(base_url: impl Into<String>, config: SseConfig) -> Result<SseClient> {
        // No overall timeout: the stream is expected to stay open indefinitely.
        let client = reqwest::Client::builder()
            .user_agent(concat!("flagent-rust/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(SseClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            config,
            shared: Arc::new(SharedState {
                status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
                reconnect_attempt: AtomicU32::new(0),
            }),
            connection: Mutex::new(None),
        })
    }

    /// Start the connection loop in the background, optionally restricted to the given flags.
    ///
    /// Must be called within a Tokio runtime. Fails with [`Error::RealtimeAlreadyEnabled`] if the
    /// loop is already running.
    pub fn connect(&self, flag_keys: &[String], flag_ids: &[i64]) -> Result<SseReceivers> {
        let mut connection = self
            .connection
            .lock()
            .expect("thread holding connection lock should not panic");
        if connection
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            return Err(Error::RealtimeAlreadyEnabled);
        }

        let url = Url::parse_with_params(
            &format!("{}{}", self.base_url, REALTIME_ENDPOINT),
            flag_keys
                .iter()
                .map(|key| ("flagKey", key.clone()))
                .chain(flag_ids.iter().map(|id| ("flagID", id.to_string()))),
        )
        .map_err(Error::InvalidBaseUrl)?;

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;

        let (events_tx, events) = mpsc::channel(self.config.event_buffer_size.max(1));
        let (status_tx, status) = mpsc::channel(self.config.status_buffer_size.max(1));
        let (errors_tx, errors) = mpsc::channel(self.config.error_buffer_size.max(1));

        let cancel = CancellationToken::new();
        self.shared.reconnect_attempt.store(0, Ordering::SeqCst);

        let connection_loop = ConnectionLoop {
            client: self.client.clone(),
            url,
            config: self.config.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
            events: events_tx,
            status: status_tx,
            errors: errors_tx,
        };
        let task = runtime.spawn(connection_loop.run());

        *connection = Some(RunningConnection { cancel, task });

        Ok(SseReceivers {
            events,
            status,
            errors,
        })
    }

    /// Stop the connection loop. The channels close shortly after. Safe to call more than once.
    pub fn disconnect(&self) {
        let running = self
            .connection
            .lock()
            .expect("thread holding connection lock should not panic")
            .take();
        if let Some(running) = running {
            log::debug!(target: "flagent", "disconnecting realtime stream");
            running.cancel.cancel();
        }
        self.shared
            .status
            .store(ConnectionStatus::Disconnected as u8, Ordering::SeqCst);
    }

    /// Return `true` if the connection loop is running (connected or reconnecting).
    pub fn is_running(&self) -> bool {
        self.connection
            .lock()
            .expect("thread holding connection lock should not panic")
            .as_ref()
            .is_some_and(|running| !running.task.is_finished() && !running.cancel.is_cancelled())
    }

    /// Return `true` if the stream is currently open.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Number of consecutive failed attempts since the last successful connect.
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.reconnect_attempt.load(Ordering::SeqCst)
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        if let Ok(mut connection) = self.connection.lock() {
            if let Some(running) = connection.take() {
                running.cancel.cancel();
            }
        }
    }
}

/// Everything the background connection loop owns. Dropping it closes the channels.
struct ConnectionLoop {
    client: reqwest::Client,
    url: Url,
    config: SseConfig,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
    events: mpsc::Sender<FlagUpdateEvent>,
    status: mpsc::Sender<ConnectionStatus>,
    errors: mpsc::Sender<Error>,
}

impl ConnectionLoop {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                self.send_status(ConnectionStatus::Disconnected);
                return;
            }

            let attempt = self.shared.reconnect_attempt.load(Ordering::SeqCst);
            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                log::warn!(target: "flagent", attempt = attempt; "max reconnect attempts reached, giving up");
                self.send_error(Error::MaxReconnectAttempts);
                self.send_status(ConnectionStatus::Disconnected);
                return;
            }

            self.send_status(ConnectionStatus::Connecting);
            log::debug!(target: "flagent",
                        url:display = self.url,
                        attempt = attempt + 1;
                        "connecting to realtime stream");

            let result = tokio::select! {
                result = self.connect_and_listen() => result,
                _ = self.cancel.cancelled() => {
                    self.send_status(ConnectionStatus::Disconnected);
                    return;
                }
            };

            match result {
                Ok(()) => {
                    log::debug!(target: "flagent", "realtime stream ended");
                    self.send_status(ConnectionStatus::Disconnected);
                }
                Err(err) => {
                    log::warn!(target: "flagent", "realtime stream error: {:?}", err);
                    self.send_error(err);
                    self.send_status(ConnectionStatus::Error);
                }
            }

            if !self.config.auto_reconnect {
                return;
            }

            let attempt = self.shared.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = backoff(self.config.reconnect_delay, attempt);
            log::debug!(target: "flagent",
                        delay_ms = delay.as_millis() as u64;
                        "reconnecting to realtime stream");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.send_status(ConnectionStatus::Disconnected);
                    return;
                }
            }
        }
    }

    async fn connect_and_listen(&self) -> Result<()> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus(response.status().as_u16()));
        }

        self.send_status(ConnectionStatus::Connected);
        self.shared.reconnect_attempt.store(0, Ordering::SeqCst);
        log::debug!(target: "flagent", "realtime stream connected");

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_event(event),
                Err(err) => return Err(Error::Stream(err.to_string())),
            }
        }

        Ok(())
    }

    fn handle_event(&self, event: Event) {
        if event.data.is_empty() {
            return;
        }

        if event.event == CONNECTION_EVENT_TYPE {
            log::debug!(target: "flagent", data = event.data.as_str(); "realtime stream acknowledged");
            return;
        }

        if !CHANGE_EVENT_TYPES.contains(&event.event.as_str()) {
            log::debug!(target: "flagent",
                        event_type = event.event.as_str();
                        "ignoring unknown realtime event");
            return;
        }

        let mut update = match serde_json::from_str::<FlagUpdateEvent>(&event.data) {
            Ok(update) => update,
            Err(err) => {
                self.send_error(Error::Stream(format!("failed to parse event: {err}")));
                return;
            }
        };
        if update.event_type.is_empty() {
            update.event_type = event.event;
        }

        match self.events.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                log::debug!(target: "flagent",
                            event_type = dropped.event_type.as_str();
                            "event buffer full, dropping newest event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn send_status(&self, status: ConnectionStatus) {
        self.shared.status.store(status as u8, Ordering::SeqCst);
        // Full or closed: a slow consumer must not stall the loop.
        let _ = self.status.try_send(status);
    }

    fn send_error(&self, error: Error) {
        let _ = self.errors.try_send(error);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::timeout};
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::Error;

    use super::{backoff, ConnectionStatus, SseClient, SseConfig};

    const WAIT: Duration = Duration::from_secs(5);

    fn sse_response(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    fn one_shot() -> SseConfig {
        SseConfig::new().auto_reconnect(false)
    }

    async fn collect<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(Some(item)) = timeout(WAIT, rx.recv()).await {
            items.push(item);
        }
        items
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff(base, 0), Duration::from_secs(1));
        assert_eq!(backoff(base, 1), Duration::from_secs(2));
        assert_eq!(backoff(base, 2), Duration::from_secs(4));
        assert_eq!(backoff(base, 5), Duration::from_secs(32));
        assert_eq!(backoff(base, 6), Duration::from_secs(60));
        assert_eq!(backoff(base, 100), Duration::from_secs(60));
        assert_eq!(
            backoff(Duration::from_millis(100), 3),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn config_defaults() {
        let config = SseConfig::default();
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.event_buffer_size, 100);
        assert_eq!(config.status_buffer_size, 10);
        assert_eq!(config.error_buffer_size, 10);
    }

    #[test]
    fn initial_state() {
        let client = SseClient::new("http://localhost:18000", SseConfig::new()).unwrap();
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.is_running());
        assert_eq!(client.reconnect_attempt(), 0);
    }

    #[test]
    fn connect_requires_runtime() {
        let client = SseClient::new("http://localhost:18000", SseConfig::new()).unwrap();
        assert!(matches!(
            client.connect(&[], &[]),
            Err(Error::RuntimeUnavailable)
        ));
    }

    #[tokio::test]
    async fn delivers_change_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/realtime/sse"))
            .and(header("accept", "text/event-stream"))
            .respond_with(sse_response(concat!(
                "event: connection\n",
                "data: {\"message\":\"connected\"}\n",
                "\n",
                "event: flag.updated\n",
                "id: 1\n",
                "data: {\"type\":\"flag.updated\",\"flagID\":1,\"flagKey\":\"f\",\"message\":\"updated\",\"timestamp\":1700000000000}\n",
                "\n",
                "event: flag.archived\n",
                "data: {\"flagID\":2}\n",
                "\n",
                "event: segment.updated\n",
                "data: {\"flagID\":3,\"data\":{\"segmentID\":\"9\"}}\n",
                "\n",
            )))
            .mount(&server)
            .await;

        let client = SseClient::new(server.uri(), one_shot()).unwrap();
        let mut receivers = client.connect(&[], &[]).unwrap();

        let events = collect(&mut receivers.events).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "flag.updated");
        assert_eq!(events[0].flag_id, Some(1));
        assert_eq!(events[0].flag_key.as_deref(), Some("f"));
        assert_eq!(events[0].timestamp, 1700000000000);
        // Type taken from the event line.
        assert_eq!(events[1].event_type, "segment.updated");
        assert_eq!(events[1].data["segmentID"], "9");

        let statuses = collect(&mut receivers.status).await;
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn sends_flag_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/realtime/sse"))
            .and(query_param("flagKey", "checkout"))
            .and(query_param("flagID", "7"))
            .respond_with(sse_response(""))
            .expect(1)
            .mount(&server)
            .await;

        let client = SseClient::new(format!("{}/", server.uri()), one_shot()).unwrap();
        let mut receivers = client.connect(&["checkout".to_owned()], &[7]).unwrap();

        let statuses = collect(&mut receivers.status).await;
        assert_eq!(statuses.last(), Some(&ConnectionStatus::Disconnected));
    }

    #[tokio::test]
    async fn full_buffer_drops_newest_event() {
        let body = (1..=3)
            .map(|id| format!("event: flag.updated\ndata: {{\"flagID\":{id}}}\n\n"))
            .collect::<String>();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(sse_response(&body))
            .mount(&server)
            .await;

        let client = SseClient::new(server.uri(), one_shot().event_buffer_size(1)).unwrap();
        let mut receivers = client.connect(&[], &[]).unwrap();

        // Wait for the loop to exit before draining events.
        collect(&mut receivers.status).await;
        let events = collect(&mut receivers.events).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flag_id, Some(1));
    }

    #[tokio::test]
    async fn malformed_event_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(sse_response("event: flag.created\ndata: {oops\n\n"))
            .mount(&server)
            .await;

        let client = SseClient::new(server.uri(), one_shot()).unwrap();
        let mut receivers = client.connect(&[], &[]).unwrap();

        let errors = collect(&mut receivers.errors).await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Stream(_)));
        assert!(collect(&mut receivers.events).await.is_empty());
    }

    #[tokio::test]
    async fn gives_up_after_max_reconnect_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let config = SseConfig::new()
            .reconnect_delay(Duration::from_millis(5))
            .max_reconnect_attempts(3);
        let client = SseClient::new(server.uri(), config).unwrap();
        let mut receivers = client.connect(&[], &[]).unwrap();

        let errors = collect(&mut receivers.errors).await;
        assert!(matches!(errors[0], Error::UnexpectedStatus(503)));
        assert!(matches!(errors.last(), Some(Error::MaxReconnectAttempts)));
        assert_eq!(errors.len(), 4);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert_eq!(client.reconnect_attempt(), 3);
    }

    #[tokio::test]
    async fn successful_connect_resets_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(sse_response("event: flag.toggled\ndata: {\"flagID\":1}\n\n"))
            .mount(&server)
            .await;

        let config = SseConfig::new()
            .reconnect_delay(Duration::from_millis(5))
            .max_reconnect_attempts(3);
        let client = SseClient::new(server.uri(), config).unwrap();
        let mut receivers = client.connect(&[], &[]).unwrap();

        // Two failures, then the stream keeps reconnecting successfully without giving up.
        let event = timeout(WAIT, receivers.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type, "flag.toggled");
        assert!(client.is_running());

        client.disconnect();
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn disconnect_closes_channels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(sse_response("").set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client = SseClient::new(server.uri(), SseConfig::new()).unwrap();
        let mut receivers = client.connect(&[], &[]).unwrap();
        assert!(client.is_running());
        assert!(matches!(
            client.connect(&[], &[]),
            Err(Error::RealtimeAlreadyEnabled)
        ));

        client.disconnect();
        client.disconnect();

        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        let statuses = collect(&mut receivers.status).await;
        assert_eq!(statuses.last(), Some(&ConnectionStatus::Disconnected));
        assert!(timeout(WAIT, receivers.events.recv()).await.unwrap().is_none());
    }
}
