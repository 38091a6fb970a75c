use std::sync::Arc;

use chrono::Utc;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::Client;
use shared::protocol::{ChatMessage, ClientFrame, HistoryResponse, WireFrame};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub mod error;
mod ledger;
mod normalizer;
pub mod reconnect;

pub use error::SessionError;
pub use reconnect::ReconnectPolicy;
pub use shared::domain::UserId;

use ledger::{DedupKey, DedupLedger};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Token and identity established by the login flow. The session only uses
/// them to open the connection, authenticate the history fetch, and fill
/// normalization fallbacks; it never acquires or refreshes them itself.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server base url (`http://` or `https://`); the websocket scheme is
    /// derived from it.
    pub server_url: String,
    pub credentials: Option<Credentials>,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            credentials: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Connection lifecycle phase. Closure or error always returns to
/// `Disconnected`; a reconnect tears down before dialing again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { error: Option<String> },
    MessageAppended(ChatMessage),
    TimelineReloaded { count: usize },
    TimelineCleared,
    OnlineCount(u32),
}

/// Client-side chat session: owns one websocket connection at a time, the
/// deduplicated timeline, and the reconnect schedule. Presentation code
/// consumes the accessors and the event stream and feeds back outgoing text.
pub struct ChatSession {
    http: Client,
    config: SessionConfig,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

struct SessionState {
    phase: ConnectionPhase,
    /// Generation counter. Every connect and disconnect bumps it; tasks
    /// spawned for an older generation see a mismatch and leave state alone.
    epoch: u64,
    attempts: u32,
    last_error: Option<String>,
    online_count: u32,
    ledger: DedupLedger,
    outbound: Option<WsSink>,
    reader_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            http: Client::new(),
            config,
            inner: Mutex::new(SessionState {
                phase: ConnectionPhase::Disconnected,
                epoch: 0,
                attempts: 0,
                last_error: None,
                online_count: 0,
                ledger: DedupLedger::new(),
                outbound: None,
                reader_task: None,
                retry_timer: None,
            }),
            events,
        })
    }

    /// Opens the chat connection. A no-op while a connection is already open
    /// or being opened; fails fast when no credentials are configured.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        self.connect_inner(None).await
    }

    async fn connect_inner(self: &Arc<Self>, retry_epoch: Option<u64>) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        if let Some(expected) = retry_epoch {
            if guard.epoch != expected {
                return Ok(()); // timer superseded by an explicit connect or disconnect
            }
            guard.retry_timer = None;
        }
        if guard.phase != ConnectionPhase::Disconnected {
            return Ok(());
        }

        let ws_url = match self.websocket_url() {
            Ok(url) => url,
            Err(err) => {
                guard.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        if let Some(timer) = guard.retry_timer.take() {
            timer.abort();
        }
        guard.phase = ConnectionPhase::Connecting;
        guard.epoch += 1;
        let epoch = guard.epoch;

        let session = Arc::clone(self);
        guard.reader_task = Some(tokio::spawn(async move {
            session.run_connection(epoch, ws_url).await;
        }));
        Ok(())
    }

    /// Caller-initiated teardown. Cancels any pending retry timer, closes the
    /// live connection, and leaves the session quiescent; no automatic
    /// reconnect follows.
    pub async fn disconnect(&self) {
        let (reader, sink, was_connected) = {
            let mut guard = self.inner.lock().await;
            guard.epoch += 1;
            if let Some(timer) = guard.retry_timer.take() {
                timer.abort();
            }
            let was_connected = guard.phase == ConnectionPhase::Connected;
            guard.phase = ConnectionPhase::Disconnected;
            guard.attempts = 0;
            (guard.reader_task.take(), guard.outbound.take(), was_connected)
        };

        if let Some(task) = reader {
            task.abort();
        }
        if let Some(mut sink) = sink {
            if let Err(err) = sink.close().await {
                debug!(%err, "websocket close handshake failed");
            }
        }
        if was_connected {
            let _ = self.events.send(SessionEvent::Disconnected { error: None });
        }
    }

    /// Sends a chat message. Whitespace-only content is a no-op. While the
    /// connection is down the message is dropped and a reconnect is triggered
    /// instead; there is no send queue. The message is not appended locally:
    /// the timeline grows once the server's echo passes the ledger, so the
    /// rendered order always matches server-confirmed order.
    pub async fn send(self: &Arc<Self>, content: &str) -> Result<(), SessionError> {
        if content.trim().is_empty() {
            return Ok(());
        }

        let mut guard = self.inner.lock().await;
        if guard.phase != ConnectionPhase::Connected {
            drop(guard);
            if let Err(err) = self.connect().await {
                warn!(%err, "recovery connect after offline send failed");
            }
            return Err(SessionError::NotConnected);
        }

        let credentials = self
            .config
            .credentials
            .as_ref()
            .ok_or(SessionError::MissingCredentials)?;
        let frame = ClientFrame::ChatMessage {
            content: content.to_string(),
        };
        let text =
            serde_json::to_string(&frame).map_err(|err| SessionError::Transport(err.to_string()))?;

        // Pending-echo entry goes in before the frame leaves the process.
        let key = DedupKey::new(credentials.user_id, content, Utc::now());
        guard.ledger.mark_pending_echo(key.clone());

        let Some(sink) = guard.outbound.as_mut() else {
            guard.ledger.unmark_pending_echo(&key);
            return Err(SessionError::NotConnected);
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            guard.ledger.unmark_pending_echo(&key);
            guard.last_error = Some(err.to_string());
            return Err(SessionError::Transport(err.to_string()));
        }
        Ok(())
    }

    /// Empties the timeline and both ledger sets. Local view operation only;
    /// nothing is sent to the server.
    pub async fn clear(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.ledger.reset();
        }
        let _ = self.events.send(SessionEvent::TimelineCleared);
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.ledger.timeline().to_vec()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.phase == ConnectionPhase::Connected
    }

    pub async fn online_count(&self) -> u32 {
        self.inner.lock().await.online_count
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn websocket_url(&self) -> Result<Url, SessionError> {
        let credentials = self
            .config
            .credentials
            .as_ref()
            .ok_or(SessionError::MissingCredentials)?;
        let mut url = Url::parse(&self.config.server_url)
            .map_err(|err| SessionError::InvalidServerUrl(err.to_string()))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(SessionError::InvalidServerUrl(format!(
                    "unsupported scheme {other}"
                )))
            }
        };
        if url.set_scheme(scheme).is_err() {
            return Err(SessionError::InvalidServerUrl(format!(
                "cannot derive websocket scheme from {}",
                self.config.server_url
            )));
        }
        url.set_path("/api/chat/ws");
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &credentials.token);
        Ok(url)
    }

    async fn run_connection(self: Arc<Self>, epoch: u64, ws_url: Url) {
        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                warn!(%err, "websocket connect failed");
                self.handle_connection_loss(epoch, Some(err.to_string()))
                    .await;
                return;
            }
        };

        let (sink, mut reader) = stream.split();
        {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return; // superseded while dialing; the fresh stream just drops
            }
            guard.phase = ConnectionPhase::Connected;
            guard.attempts = 0;
            guard.last_error = None;
            guard.outbound = Some(sink);
        }
        info!("chat connection established");
        let _ = self.events.send(SessionEvent::Connected);

        // Seed the timeline before the first live frame is dispatched.
        self.reload_history(epoch).await;

        let close_error = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(epoch, &text).await,
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {} // ping/pong/binary: transport-level, nothing to dispatch
                Some(Err(err)) => break Some(err.to_string()),
            }
        };

        self.handle_connection_loss(epoch, close_error).await;
    }

    async fn handle_connection_loss(self: &Arc<Self>, epoch: u64, error: Option<String>) {
        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            return; // a newer connect or disconnect already owns the state
        }
        guard.phase = ConnectionPhase::Disconnected;
        guard.outbound = None;
        if let Some(err) = &error {
            guard.last_error = Some(err.clone());
        }
        let _ = self.events.send(SessionEvent::Disconnected { error });
        self.schedule_reconnect(&mut guard);
    }

    /// Schedules the next automatic retry, or a cooldown reset once the
    /// attempt bound is exceeded. At most one timer is pending at a time.
    fn schedule_reconnect(self: &Arc<Self>, state: &mut SessionState) {
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }

        let attempt = state.attempts;
        state.attempts += 1;
        let policy = self.config.reconnect.clone();
        let epoch = state.epoch;
        let session = Arc::clone(self);

        if policy.is_exhausted(state.attempts) {
            warn!(
                attempts = state.attempts,
                "reconnect attempts exhausted; cooling down"
            );
            state.retry_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(policy.cooldown).await;
                let mut guard = session.inner.lock().await;
                if guard.epoch == epoch {
                    guard.attempts = 0;
                    guard.retry_timer = None;
                }
            }));
            return;
        }

        let delay = policy.delay_for(attempt);
        info!(?delay, attempt = state.attempts, "scheduling reconnect");
        state.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = session.connect_inner(Some(epoch)).await {
                warn!(%err, "scheduled reconnect failed");
            }
        }));
    }

    async fn handle_frame(&self, epoch: u64, raw: &str) {
        let frame: WireFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "ignoring inbound frame that is not valid json");
                return;
            }
        };

        if frame.kind == "online_count" {
            let Some(count) = frame.payload.as_u64() else {
                warn!("ignoring online_count frame without a numeric payload");
                return;
            };
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return;
            }
            guard.online_count = count as u32;
            let _ = self.events.send(SessionEvent::OnlineCount(count as u32));
            return;
        }

        let Some(credentials) = self.config.credentials.as_ref() else {
            return;
        };
        let Some(message) = normalizer::normalize_frame(&frame, credentials) else {
            return;
        };

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            return;
        }
        if guard.ledger.admit(message.clone()) {
            let _ = self.events.send(SessionEvent::MessageAppended(message));
        }
    }

    async fn fetch_history(&self, token: &str) -> anyhow::Result<HistoryResponse> {
        let url = format!(
            "{}/api/chat/messages",
            self.config.server_url.trim_end_matches('/')
        );
        let body = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    /// One-shot history snapshot. Replaces the timeline only on success, and
    /// only while the owning connection is still current; a transient fetch
    /// failure must not blank the visible conversation.
    async fn reload_history(&self, epoch: u64) {
        let Some(credentials) = self.config.credentials.as_ref() else {
            return;
        };
        let body = match self.fetch_history(&credentials.token).await {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "history fetch failed; keeping the current timeline");
                return;
            }
        };

        let count = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return;
            }
            guard.ledger.reset();
            for record in body.data {
                guard.ledger.admit(normalizer::from_history(record));
            }
            guard.ledger.timeline().len()
        };
        info!(count, "timeline reloaded from history snapshot");
        let _ = self.events.send(SessionEvent::TimelineReloaded { count });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
