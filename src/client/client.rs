//! High-level Lumen client API.
//!
//! Provides [`LumenClient`], a handle to a background task that drives a
//! [`ClientSession`] over real websockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{
    CONNECT_TIMEOUT, CommandError, ConnectionError, DEFAULT_LINGER, MIN_PROTOCOL_VERSION,
    PERSIST_DEBOUNCE, RECOMMENDED_PROTOCOL_VERSION, REPLY_TIMEOUT, STALL_THRESHOLD,
    duration_ms,
};
use crate::delta::StateTree;
use crate::sync::{Command, CommandKind, ReplySender};
use crate::transport::{
    Backoff, ConnectMode, ConnectionStatus, Credentials, Endpoint, EndpointDomains, LumenSocket,
    SocketEvent, SocketEventKind, SocketId,
};

use super::persist::StatePersistence;
use super::session::{ClientSession, Prediction, SessionAction};

/// Errors that can occur in the Lumen client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not start connecting.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The background task has stopped.
    #[error("client task has stopped")]
    Stopped,
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where to connect.
    pub endpoint: Option<Endpoint>,

    /// Identity presented in the connection URL.
    pub credentials: Credentials,

    /// Domains a controller identifier expands under.
    pub domains: EndpointDomains,

    /// Reconnect persistently or try once.
    pub mode: ConnectMode,

    /// Connect `endpoint` as soon as the client starts.
    pub auto_connect: bool,

    /// Time allowed for a socket to open and for `init` to follow.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Time allowed for each reply.
    #[serde(with = "duration_ms")]
    pub reply_timeout: Duration,

    /// Outstanding work older than this raises the stalling flag.
    #[serde(with = "duration_ms")]
    pub stall_threshold: Duration,

    /// How long a prediction stays after a successful reply.
    #[serde(with = "duration_ms")]
    pub default_linger: Duration,

    /// Minimum spacing of persisted-state writes.
    #[serde(with = "duration_ms")]
    pub persist_debounce: Duration,

    /// Reconnect backoff.
    pub backoff: Backoff,

    /// Oldest server protocol accepted.
    pub min_protocol_version: u32,

    /// Older servers are accepted with a warning.
    pub recommended_protocol_version: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            credentials: Credentials::default(),
            domains: EndpointDomains::default(),
            mode: ConnectMode::Persistent,
            auto_connect: true,
            connect_timeout: CONNECT_TIMEOUT,
            reply_timeout: REPLY_TIMEOUT,
            stall_threshold: STALL_THRESHOLD,
            default_linger: DEFAULT_LINGER,
            persist_debounce: PERSIST_DEBOUNCE,
            backoff: Backoff::default(),
            min_protocol_version: MIN_PROTOCOL_VERSION,
            recommended_protocol_version: RECOMMENDED_PROTOCOL_VERSION,
        }
    }
}

/// Builder for creating a [`ClientConfig`].
#[derive(Debug, Default)]
pub struct LumenClientBuilder {
    config: ClientConfig,
}

impl LumenClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = Some(endpoint);
        self
    }

    /// Set the credentials.
    pub fn credentials(mut self, user: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.credentials = Credentials::new(user, secret);
        self
    }

    /// Set the controller expansion domains.
    pub fn domains(mut self, domains: EndpointDomains) -> Self {
        self.config.domains = domains;
        self
    }

    /// Set the reconnect mode.
    pub fn mode(mut self, mode: ConnectMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Whether to connect on start.
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the reply timeout.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    /// Set the default prediction linger.
    pub fn default_linger(mut self, linger: Duration) -> Self {
        self.config.default_linger = linger;
        self
    }

    /// Set the reconnect backoff.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

enum Request {
    Send {
        command: Command,
        prediction: Option<Prediction>,
        reply: ReplySender,
    },
    Connect {
        target: Option<(Endpoint, Credentials)>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disable,
    Shutdown,
}

/// A Lumen client.
///
/// # Example
///
/// ```ignore
/// use lumen_sync::client::{LumenClient, LumenClientBuilder, Prediction};
/// use lumen_sync::sync::Toggle;
/// use lumen_sync::transport::Endpoint;
///
/// let config = LumenClientBuilder::new()
///     .endpoint(Endpoint::parse("hub42"))
///     .credentials("alice", "secret")
///     .build();
/// let client = LumenClient::start(config, None)?;
///
/// let prediction = Prediction::new("l1", |state| { /* flip l1 */ });
/// client.send(Toggle { target: "l1".into() }, Some(prediction)).await?;
/// ```
pub struct LumenClient {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<ConnectionStatus>,
    view: watch::Receiver<Arc<StateTree>>,
    warnings: Arc<Mutex<Vec<String>>>,
    task: Option<JoinHandle<()>>,
}

impl LumenClient {
    /// Spawn the client task. Must be called within a tokio runtime.
    ///
    /// Canonical state is restored from `persistence` when it holds any. A
    /// persisted file that cannot be read is logged and ignored.
    pub fn start(
        config: ClientConfig,
        persistence: Option<Box<dyn StatePersistence>>,
    ) -> Result<Self, ClientError> {
        let restored = match persistence.as_ref().map(|p| p.load()) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                warn!(error = %e, "ignoring unreadable persisted state");
                None
            }
            None => None,
        };

        let auto_connect = config.auto_connect && config.endpoint.is_some();
        let mut session = ClientSession::new(config, restored);
        if auto_connect {
            session.connect(Instant::now())?;
        }

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(session.status());
        let (view_tx, view) = watch::channel(Arc::new(session.store().view().clone()));
        let warnings = Arc::new(Mutex::new(Vec::new()));

        let driver = Driver {
            view_revision: session.store().revision(),
            session,
            sockets: HashMap::new(),
            events_tx,
            persistence,
            status_tx,
            view_tx,
            warnings: Arc::clone(&warnings),
        };
        let task = tokio::spawn(driver.run(requests_rx, events_rx));

        Ok(Self {
            requests,
            status,
            view,
            warnings,
            task: Some(task),
        })
    }

    /// Send a typed command, applying `prediction` before any I/O.
    pub async fn send<C: CommandKind>(
        &self,
        command: C,
        prediction: Option<Prediction>,
    ) -> Result<C::Output, CommandError> {
        let value = self.send_command(command.into(), prediction).await?;
        C::decode_output(value)
    }

    /// Send an untyped command and return the raw reply payload.
    pub async fn send_command(
        &self,
        command: Command,
        prediction: Option<Prediction>,
    ) -> Result<serde_json::Value, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Send {
                command,
                prediction,
                reply,
            })
            .map_err(|_| CommandError::ConnectionLost)?;
        rx.await.map_err(|_| CommandError::ConnectionLost)?
    }

    /// Connect to the configured endpoint.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request_connect(None).await
    }

    /// Connect somewhere else, for example after a login form.
    pub async fn connect_to(&self, endpoint: Endpoint, credentials: Credentials) -> Result<(), ClientError> {
        self.request_connect(Some((endpoint, credentials))).await
    }

    async fn request_connect(&self, target: Option<(Endpoint, Credentials)>) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        self.requests
            .send(Request::Connect { target, done })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)??;
        Ok(())
    }

    /// Stop connecting; outstanding commands fail with
    /// [`CommandError::Disabled`].
    pub fn disable(&self) -> Result<(), ClientError> {
        self.requests
            .send(Request::Disable)
            .map_err(|_| ClientError::Stopped)
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Watch connection status changes.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Current view: canonical state with live predictions.
    pub fn view(&self) -> Arc<StateTree> {
        Arc::clone(&self.view.borrow())
    }

    /// Watch view changes.
    pub fn changes(&self) -> watch::Receiver<Arc<StateTree>> {
        self.view.clone()
    }

    /// Non-blocking warnings (such as an outdated controller) since the
    /// last call.
    pub fn take_warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default()
    }

    /// Stop the client task, rejecting outstanding commands.
    pub async fn shutdown(mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct Driver {
    session: ClientSession,
    sockets: HashMap<SocketId, LumenSocket>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    persistence: Option<Box<dyn StatePersistence>>,
    status_tx: watch::Sender<ConnectionStatus>,
    view_tx: watch::Sender<Arc<StateTree>>,
    view_revision: u64,
    warnings: Arc<Mutex<Vec<String>>>,
}

impl Driver {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        self.drain();

        loop {
            let deadline = self.session.poll_timeout();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(event) = events.recv() => self.handle_event(event),
                () = timer => self.session.handle_timeout(Instant::now()),
            }

            self.drain();
        }

        info!("client shutting down");
        self.session.disable(Instant::now());
        self.drain();
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(&self.session.persisted_state()) {
                warn!(error = %e, "failed to persist state on shutdown");
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        let now = Instant::now();
        match request {
            Request::Send {
                command,
                prediction,
                reply,
            } => self.session.send(command, prediction, reply, now),
            Request::Connect { target, done } => {
                if let Some((endpoint, credentials)) = target {
                    self.session.set_endpoint(endpoint, credentials);
                }
                let _ = done.send(self.session.connect(now));
            }
            Request::Disable => self.session.disable(now),
            Request::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SocketEvent) {
        let now = Instant::now();
        match event.kind {
            SocketEventKind::Opened => self.session.on_open(event.socket, now),
            SocketEventKind::Message(text) => self.session.on_message(event.socket, &text, now),
            SocketEventKind::Closed(reason) => {
                self.sockets.remove(&event.socket);
                self.session.on_closed(event.socket, &reason, now);
            }
        }
    }

    /// Carry out session actions and publish what changed.
    fn drain(&mut self) {
        while let Some(action) = self.session.poll_action() {
            match action {
                SessionAction::Open { socket, url } => {
                    debug!(socket, "opening socket");
                    let handle = LumenSocket::open(socket, url, self.events_tx.clone());
                    self.sockets.insert(socket, handle);
                }
                SessionAction::Close { socket } => {
                    if let Some(handle) = self.sockets.remove(&socket) {
                        handle.close();
                    }
                }
                SessionAction::Send { socket, text } => {
                    let delivered = self.sockets.get(&socket).is_some_and(|s| s.send(text));
                    if !delivered {
                        warn!(socket, "frame for a closed socket dropped");
                    }
                }
                SessionAction::Persist(state) => {
                    if let Some(persistence) = &self.persistence {
                        if let Err(e) = persistence.save(&state) {
                            warn!(error = %e, "failed to persist state");
                        }
                    }
                }
            }
        }

        if let Some(status) = self.session.take_status_change() {
            self.status_tx.send_replace(status);
        }

        let revision = self.session.store().revision();
        if revision != self.view_revision {
            self.view_revision = revision;
            self.view_tx
                .send_replace(Arc::new(self.session.store().view().clone()));
        }

        let warnings = self.session.take_warnings();
        if !warnings.is_empty() {
            if let Ok(mut pending) = self.warnings.lock() {
                pending.extend(warnings);
            }
        }
    }
}
