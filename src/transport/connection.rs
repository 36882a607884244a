//! Connection state machine.
//!
//! Sans-IO: the machine never touches a socket or a clock. Inputs carry the
//! current time and outputs tell the driver which sockets to open or close
//! and what happened to the connection.
//!
//! ```text
//!            connect                open (first wins)        init ok
//!   Idle ───────────────► Connecting ───────────────► Initializing ─────► Connected
//!    ▲                        │         failure                │               │
//!    │ disable /              ▼                                ▼               ▼
//!    │ try-once gave up  Reconnecting ◄────────────────────────┴───────────────┘
//!    └────────────────────────┘   ▲  retry timer fires ──► Connecting
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{
    CONNECT_TIMEOUT, ConnectionError, MIN_PROTOCOL_VERSION, RECOMMENDED_PROTOCOL_VERSION,
};

use super::timing::Backoff;

/// Driver-assigned socket identifier.
pub type SocketId = u64;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Idle,
    /// Candidate sockets are racing to open.
    Connecting,
    /// A socket opened; waiting for `init`.
    Initializing,
    /// `init` accepted; commands flow.
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Snapshot for a UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful `init`.
    pub attempts: u32,
    /// Most recent failure, human readable.
    pub last_error: Option<String>,
    /// Outstanding commands have waited longer than the stall threshold.
    pub stalling: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            last_error: None,
            stalling: false,
        }
    }
}

/// How persistently to reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Retry forever with backoff.
    #[default]
    Persistent,
    /// Give up after one failed retry, for example to validate credentials
    /// entered in a login form.
    TryOnce,
}

/// What the machine asks of its driver, or reports to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Open a websocket to `url` and report events tagged with `socket`.
    Open {
        /// Identifier for the new socket.
        socket: SocketId,
        /// URL to connect to.
        url: String,
    },
    /// Close and forget a socket.
    Close {
        /// Socket to close.
        socket: SocketId,
    },
    /// `init` was accepted on the active socket.
    Connected {
        /// Protocol version the server announced.
        version: u32,
        /// One-time warning when the server is older than recommended.
        warning: Option<String>,
    },
    /// A live or pending connection failed; a retry may follow.
    Lost {
        /// Why.
        error: ConnectionError,
    },
    /// Try-once mode exhausted its retry; the machine is idle.
    GaveUp {
        /// Last failure.
        error: ConnectionError,
    },
}

/// An input that is not valid in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    /// State the machine was in.
    pub state: ConnectionState,
    /// Input that was refused.
    pub input: &'static str,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ignored while {}", self.input, self.state)
    }
}

impl std::error::Error for Rejected {}

/// Connection manager state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    mode: ConnectMode,
    attempts: u32,
    last_error: Option<ConnectionError>,

    urls: Vec<String>,
    racing: Vec<SocketId>,
    active: Option<SocketId>,
    next_socket: SocketId,

    /// Connect or handshake deadline for the current attempt.
    attempt_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,

    backoff: Backoff,
    connect_timeout: Duration,
    min_version: u32,
    recommended_version: u32,
    warned_old_version: bool,

    outputs: VecDeque<Output>,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(Backoff::default(), CONNECT_TIMEOUT)
    }
}

impl ConnectionMachine {
    /// Create an idle machine.
    pub fn new(backoff: Backoff, connect_timeout: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            mode: ConnectMode::Persistent,
            attempts: 0,
            last_error: None,
            urls: Vec::new(),
            racing: Vec::new(),
            active: None,
            next_socket: 0,
            attempt_deadline: None,
            retry_deadline: None,
            backoff,
            connect_timeout,
            min_version: MIN_PROTOCOL_VERSION,
            recommended_version: RECOMMENDED_PROTOCOL_VERSION,
            warned_old_version: false,
            outputs: VecDeque::new(),
        }
    }

    /// Override the minimum and recommended protocol versions.
    pub fn with_versions(mut self, minimum: u32, recommended: u32) -> Self {
        self.min_version = minimum;
        self.recommended_version = recommended;
        self
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Most recent failure.
    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// The socket that won the race, once one has.
    pub fn active_socket(&self) -> Option<SocketId> {
        self.active
    }

    /// Whether messages from `socket` should be processed.
    pub fn is_active(&self, socket: SocketId) -> bool {
        self.active == Some(socket)
            && matches!(
                self.state,
                ConnectionState::Initializing | ConnectionState::Connected
            )
    }

    /// Status snapshot; `stalling` is tracked by the command layer.
    pub fn status(&self, stalling: bool) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempts: self.attempts,
            last_error: self.last_error.as_ref().map(ToString::to_string),
            stalling,
        }
    }

    /// Next output for the driver.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// Earliest deadline the driver must call [`handle_timeout`] at.
    ///
    /// [`handle_timeout`]: Self::handle_timeout
    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.attempt_deadline, self.retry_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Start connecting to `urls`, racing them.
    ///
    /// Any existing connection or attempt is torn down first.
    pub fn connect(
        &mut self,
        urls: Vec<String>,
        mode: ConnectMode,
        now: Instant,
    ) -> Result<(), ConnectionError> {
        if urls.is_empty() {
            return Err(ConnectionError::InvalidEndpoint(
                "no candidate urls".to_string(),
            ));
        }
        self.teardown();
        self.urls = urls;
        self.mode = mode;
        self.attempts = 0;
        self.last_error = None;
        self.start_attempt(now);
        Ok(())
    }

    /// A socket finished its websocket handshake.
    pub fn on_open(&mut self, socket: SocketId, now: Instant) -> Result<(), Rejected> {
        if self.state != ConnectionState::Connecting || !self.racing.contains(&socket) {
            // A loser that opened late: make sure it goes away.
            self.outputs.push_back(Output::Close { socket });
            return Err(self.reject("open"));
        }

        for other in self.racing.drain(..).filter(|s| *s != socket) {
            debug!(socket = other, "closing slower candidate");
            self.outputs.push_back(Output::Close { socket: other });
        }
        self.active = Some(socket);
        self.state = ConnectionState::Initializing;
        self.attempt_deadline = Some(now + self.connect_timeout);
        info!(socket, "socket opened, awaiting init");
        Ok(())
    }

    /// `init` arrived on `socket` announcing `version`.
    ///
    /// A version below the minimum fails the connection and obeys backoff.
    pub fn on_init(&mut self, socket: SocketId, version: u32, now: Instant) -> Result<(), Rejected> {
        if self.state != ConnectionState::Initializing || self.active != Some(socket) {
            return Err(self.reject("init"));
        }

        if version < self.min_version {
            warn!(version, minimum = self.min_version, "controller protocol too old");
            self.fail(
                ConnectionError::UnsupportedVersion {
                    announced: version,
                    minimum: self.min_version,
                },
                now,
            );
            return Ok(());
        }

        let warning = if version < self.recommended_version && !self.warned_old_version {
            self.warned_old_version = true;
            let text = format!(
                "the controller runs protocol version {version}; version {} or newer is recommended",
                self.recommended_version
            );
            warn!(version, recommended = self.recommended_version, "controller protocol outdated");
            Some(text)
        } else {
            None
        };

        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.last_error = None;
        self.attempt_deadline = None;
        info!(socket, version, "connected");
        self.outputs.push_back(Output::Connected { version, warning });
        Ok(())
    }

    /// A socket closed or errored.
    pub fn on_socket_closed(&mut self, socket: SocketId, reason: &str, now: Instant) {
        if self.active == Some(socket) {
            self.active = None;
            self.fail(ConnectionError::SocketClosed(reason.to_string()), now);
            return;
        }

        let before = self.racing.len();
        self.racing.retain(|s| *s != socket);
        if self.racing.len() == before {
            debug!(socket, "close for forgotten socket");
            return;
        }
        debug!(socket, reason, "candidate failed");
        if self.racing.is_empty() && self.state == ConnectionState::Connecting {
            self.fail(ConnectionError::SocketClosed(reason.to_string()), now);
        }
    }

    /// Fail the current connection or attempt.
    ///
    /// Closes every socket, records `error` and schedules a retry, unless
    /// try-once mode has already retried.
    pub fn fail(&mut self, error: ConnectionError, now: Instant) {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Reconnecting) {
            debug!(%error, state = %self.state, "failure ignored");
            return;
        }

        self.teardown();
        self.last_error = Some(error.clone());

        if self.mode == ConnectMode::TryOnce && self.attempts >= 1 {
            info!(%error, "giving up");
            self.state = ConnectionState::Idle;
            self.outputs.push_back(Output::GaveUp { error });
            return;
        }

        let delay = self.backoff.delay(self.attempts);
        info!(%error, attempts = self.attempts, ?delay, "connection lost, retrying");
        self.state = ConnectionState::Reconnecting;
        self.retry_deadline = Some(now + delay);
        self.outputs.push_back(Output::Lost { error });
    }

    /// Fire any expired timer.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.attempt_deadline.is_some_and(|d| d <= now) {
            self.attempt_deadline = None;
            self.fail(ConnectionError::ConnectTimeout, now);
        }
        if self.retry_deadline.is_some_and(|d| d <= now) {
            self.retry_deadline = None;
            self.attempts += 1;
            debug!(attempts = self.attempts, "retrying connection");
            self.start_attempt(now);
        }
    }

    /// Stop connecting and close every socket.
    pub fn disable(&mut self) {
        self.teardown();
        self.state = ConnectionState::Idle;
        self.attempts = 0;
        self.last_error = None;
        info!("connection disabled");
    }

    fn start_attempt(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.attempt_deadline = Some(now + self.connect_timeout);
        for url in &self.urls {
            self.next_socket += 1;
            let socket = self.next_socket;
            self.racing.push(socket);
            self.outputs.push_back(Output::Open {
                socket,
                url: url.clone(),
            });
        }
        debug!(candidates = self.racing.len(), "connection attempt started");
    }

    /// Close every socket and clear every timer.
    fn teardown(&mut self) {
        for socket in self.racing.drain(..).chain(self.active.take()) {
            self.outputs.push_back(Output::Close { socket });
        }
        self.attempt_deadline = None;
        self.retry_deadline = None;
    }

    fn reject(&self, input: &'static str) -> Rejected {
        Rejected {
            state: self.state,
            input,
        }
    }
}
