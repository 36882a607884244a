//! Sans-IO client session.
//!
//! [`ClientSession`] ties the connection machine, the command queue and the
//! client store together. It performs no I/O: the driver feeds it socket
//! events and the current time, then drains [`SessionAction`]s telling it
//! which sockets to open, close or write to and when to persist.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::{CommandError, ConnectionError};
use crate::delta::{StateTree, clone_public};
use crate::sync::{ClientStore, Command, CommandQueue, ReplySender, ServerMessage, StoreChange, SubscriptionId, Target};
use crate::transport::{
    ConnectionMachine, ConnectionState, ConnectionStatus, Credentials, Endpoint, Output, SocketId,
};

use super::client::ClientConfig;
use super::persist::{Debouncer, KnownServer, PersistedState};

type Mutation = Box<dyn FnOnce(&mut StateTree) + Send>;

/// An optimistic change to apply before a command is sent.
pub struct Prediction {
    target: Target,
    linger: Option<Duration>,
    mutate: Mutation,
}

impl Prediction {
    /// Predict that `mutate` is what the command will do to `target`.
    pub fn new<F>(target: impl Into<Target>, mutate: F) -> Self
    where
        F: FnOnce(&mut StateTree) + Send + 'static,
    {
        Self {
            target: target.into(),
            linger: None,
            mutate: Box::new(mutate),
        }
    }

    /// Keep the prediction for `linger` after a successful reply instead of
    /// the configured default.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    /// Target this prediction writes.
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl fmt::Debug for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prediction")
            .field("target", &self.target)
            .field("linger", &self.linger)
            .finish_non_exhaustive()
    }
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Open a websocket.
    Open {
        /// Socket id to tag events with.
        socket: SocketId,
        /// URL, credentials included.
        url: String,
    },
    /// Close a websocket.
    Close {
        /// Socket to close.
        socket: SocketId,
    },
    /// Write a text frame.
    Send {
        /// Destination socket.
        socket: SocketId,
        /// Encoded frame.
        text: String,
    },
    /// Write local state.
    Persist(PersistedState),
}

/// Client context: one per connection target, no globals.
pub struct ClientSession {
    config: ClientConfig,
    machine: ConnectionMachine,
    queue: CommandQueue,
    store: ClientStore,

    stalling: bool,
    stall_deadline: Option<Instant>,

    persisted: PersistedState,
    debouncer: Debouncer,

    actions: VecDeque<SessionAction>,
    warnings: Vec<String>,
    last_status: ConnectionStatus,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("status", &self.status())
            .field("pending", &self.queue.pending_len())
            .field("in_flight", &self.queue.in_flight_len())
            .field("predictions", &self.store.ledger().len())
            .finish()
    }
}

impl ClientSession {
    /// Create a session, seeding canonical state from `restored` if given.
    pub fn new(config: ClientConfig, restored: Option<PersistedState>) -> Self {
        let machine = ConnectionMachine::new(config.backoff, config.connect_timeout)
            .with_versions(config.min_protocol_version, config.recommended_protocol_version);
        let persisted = restored.unwrap_or_default();
        let store = ClientStore::with_state(persisted.state.clone());

        Self {
            queue: CommandQueue::new(config.reply_timeout),
            debouncer: Debouncer::new(config.persist_debounce),
            config,
            machine,
            store,
            stalling: false,
            stall_deadline: None,
            persisted,
            actions: VecDeque::new(),
            warnings: Vec::new(),
            last_status: ConnectionStatus::default(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Change where and as whom to connect. Takes effect on the next
    /// [`connect`](Self::connect).
    pub fn set_endpoint(&mut self, endpoint: Endpoint, credentials: Credentials) {
        self.config.endpoint = Some(endpoint);
        self.config.credentials = credentials;
    }

    /// Start connecting to the configured endpoint.
    pub fn connect(&mut self, now: Instant) -> Result<(), ConnectionError> {
        let endpoint = self
            .config
            .endpoint
            .as_ref()
            .ok_or_else(|| ConnectionError::InvalidEndpoint("no endpoint configured".to_string()))?;
        let urls = endpoint.candidate_urls(&self.config.credentials, &self.config.domains)?;
        info!(%endpoint, candidates = urls.len(), "connecting");
        self.machine.connect(urls, self.config.mode, now)?;
        // The old socket is gone without a `Lost` output.
        self.requeue();
        self.pump(now);
        Ok(())
    }

    /// Stop connecting. Every queued command is rejected and every live
    /// prediction rolls back.
    pub fn disable(&mut self, now: Instant) {
        self.machine.disable();
        let abandoned = self.queue.abandon(CommandError::Disabled);
        let rolled_back = self.store.rollback_all();
        debug!(predicted = abandoned.len(), rolled_back, "queue abandoned");
        self.refresh_stall();
        self.pump(now);
    }

    /// Queue a command, applying its prediction first.
    ///
    /// The prediction does not expire while the command waits to be sent.
    /// Once sent it lasts `reply_timeout + linger` unless a reply settles it
    /// sooner. The outcome is delivered on `reply`.
    pub fn send(&mut self, command: Command, prediction: Option<Prediction>, reply: ReplySender, now: Instant) {
        let linger = prediction
            .as_ref()
            .and_then(|p| p.linger)
            .unwrap_or(self.config.default_linger);

        let handle = prediction.map(|p| self.store.predict(p.target, None, p.mutate));

        debug!(command = command.name(), predicted = handle.is_some(), "queue command");
        if self.queue.enqueue(command.encode(), reply, handle, linger) {
            self.stall_deadline = Some(now + self.config.stall_threshold);
        }

        if self.machine.state() == ConnectionState::Connected {
            self.flush(now);
        }
    }

    /// A socket opened.
    pub fn on_open(&mut self, socket: SocketId, now: Instant) {
        if let Err(rejected) = self.machine.on_open(socket, now) {
            debug!(socket, %rejected, "late open");
        }
        self.pump(now);
    }

    /// A socket closed or errored.
    pub fn on_closed(&mut self, socket: SocketId, reason: &str, now: Instant) {
        self.machine.on_socket_closed(socket, reason, now);
        self.pump(now);
    }

    /// A text frame arrived on `socket`.
    pub fn on_message(&mut self, socket: SocketId, text: &str, now: Instant) {
        if !self.machine.is_active(socket) {
            debug!(socket, "message from inactive socket dropped");
            return;
        }

        match ServerMessage::decode(text) {
            Ok(message) => self.route(socket, message, now),
            Err(e) => {
                warn!(socket, error = %e, "undecodable server message");
                self.machine.fail(ConnectionError::Protocol(e.to_string()), now);
            }
        }
        if self.store.take_canonical_dirty() {
            self.debouncer.touch(now);
        }
        self.pump(now);
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.machine.handle_timeout(now);

        if self.queue.reply_timed_out(now) {
            warn!(in_flight = self.queue.in_flight_len(), "reply timed out");
            self.machine.fail(ConnectionError::ReplyTimeout, now);
        }

        if self.stall_deadline.is_some_and(|d| d <= now) {
            self.stall_deadline = None;
            self.stalling = self.queue.has_outstanding();
            if self.stalling {
                debug!("commands stalling");
            }
        }

        self.store.expire(now);

        if self.debouncer.fire(now) {
            self.actions.push_back(SessionAction::Persist(self.persisted_state()));
        }

        self.pump(now);
    }

    /// Earliest instant [`handle_timeout`](Self::handle_timeout) must run.
    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.machine.poll_timeout(),
            self.queue.next_reply_deadline(),
            self.stall_deadline,
            self.store.next_deadline(),
            self.debouncer.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Next action for the driver.
    pub fn poll_action(&mut self) -> Option<SessionAction> {
        self.actions.pop_front()
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.machine.status(self.stalling)
    }

    /// The status, if it changed since the last call.
    pub fn take_status_change(&mut self) -> Option<ConnectionStatus> {
        let status = self.status();
        if status == self.last_status {
            return None;
        }
        debug!(state = %status.state, attempts = status.attempts, stalling = status.stalling, "status changed");
        self.last_status = status.clone();
        Some(status)
    }

    /// Non-blocking warnings collected since the last call.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Canonical and predicted state.
    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    /// Observe visible state changes.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&StoreChange) + Send + 'static,
    {
        self.store.subscribe(listener)
    }

    /// Stop observing.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// What would be written to local storage now.
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            state: clone_public(self.store.canonical()),
            known_servers: self.persisted.known_servers.clone(),
        }
    }

    fn route(&mut self, socket: SocketId, message: ServerMessage, now: Instant) {
        let connected = self.machine.state() == ConnectionState::Connected;
        match message {
            ServerMessage::Init { version, snapshot } => {
                if let Err(rejected) = self.machine.on_init(socket, version, now) {
                    warn!(%rejected, "unexpected init");
                    return;
                }
                if self.machine.state() == ConnectionState::Connected {
                    self.store.reset_canonical(&snapshot);
                    self.remember_server(version);
                }
            }
            ServerMessage::StoreDelta(delta) if connected => self.store.apply_canonical(&delta),
            ServerMessage::StoreDelta(_) => warn!("store-delta before init ignored"),
            ServerMessage::Reply { id, result, error } if connected => {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result),
                };
                self.resolve(id, outcome, now);
            }
            ServerMessage::Reply { id, .. } => warn!(id, "reply before init ignored"),
            ServerMessage::Error(message) => {
                warn!(%message, "server error");
                self.machine.fail(ConnectionError::ServerError(message), now);
            }
        }
    }

    fn resolve(&mut self, id: u64, outcome: Result<serde_json::Value, String>, now: Instant) {
        if let Some(settled) = self.queue.resolve(id, outcome) {
            if let Some(handle) = settled.prediction {
                if settled.failed || settled.linger.is_zero() {
                    self.store.rollback(&handle);
                } else {
                    self.store.settle(&handle, Some(now + settled.linger));
                }
            }
        }
        self.refresh_stall();
    }

    fn remember_server(&mut self, version: u32) {
        if let Some(endpoint) = &self.config.endpoint {
            self.persisted.remember(KnownServer {
                endpoint: endpoint.clone(),
                user: self.config.credentials.user.clone(),
                protocol_version: version,
            });
        }
    }

    fn flush(&mut self, now: Instant) {
        let Some(socket) = self.machine.active_socket() else {
            return;
        };
        for sent in self.queue.flush(now) {
            if let Some(handle) = &sent.prediction {
                let deadline = now + self.config.reply_timeout + sent.linger;
                self.store.settle(handle, Some(deadline));
            }
            self.actions.push_back(SessionAction::Send { socket, text: sent.text });
        }
    }

    /// Put in-flight commands back in line and hold their predictions until
    /// they are sent again.
    fn requeue(&mut self) -> usize {
        let moved = self.queue.requeue_in_flight();
        for handle in self.queue.pending_predictions() {
            self.store.settle(handle, None);
        }
        moved
    }

    fn refresh_stall(&mut self) {
        if !self.queue.has_outstanding() {
            self.stalling = false;
            self.stall_deadline = None;
        }
    }

    /// Turn machine outputs into actions and queue/store effects.
    fn pump(&mut self, now: Instant) {
        while let Some(output) = self.machine.poll_output() {
            match output {
                Output::Open { socket, url } => self.actions.push_back(SessionAction::Open { socket, url }),
                Output::Close { socket } => self.actions.push_back(SessionAction::Close { socket }),
                Output::Connected { warning, .. } => {
                    if let Some(warning) = warning {
                        self.warnings.push(warning);
                    }
                    self.flush(now);
                }
                Output::Lost { error } => {
                    let moved = self.requeue();
                    debug!(%error, requeued = moved, "connection lost");
                }
                Output::GaveUp { error } => {
                    info!(%error, "connection abandoned");
                    for handle in self.queue.abandon(CommandError::ConnectionLost) {
                        self.store.rollback(&handle);
                    }
                    self.refresh_stall();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{apply, get_path};
    use crate::sync::{Rename, Toggle};
    use crate::transport::ConnectMode;
    use serde_json::{Value, json};
    use tokio::sync::oneshot;

    type ReplyRx = oneshot::Receiver<Result<Value, CommandError>>;

    fn config() -> ClientConfig {
        ClientConfig {
            endpoint: Some(Endpoint::Literal("hub.test:8480".into())),
            credentials: Credentials::new("alice", "pw"),
            ..ClientConfig::default()
        }
    }

    fn actions(session: &mut ClientSession) -> Vec<SessionAction> {
        std::iter::from_fn(|| session.poll_action()).collect()
    }

    fn sent(session: &mut ClientSession) -> Vec<String> {
        actions(session)
            .into_iter()
            .filter_map(|a| match a {
                SessionAction::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn init(lights: Value) -> String {
        json!(["init", 3, {"lights": lights}]).to_string()
    }

    /// Connect on socket 1 with `lights` as initial state.
    fn connected(lights: Value, now: Instant) -> ClientSession {
        let mut session = ClientSession::new(config(), None);
        session.connect(now).unwrap();
        session.on_open(1, now);
        session.on_message(1, &init(lights), now);
        actions(&mut session);
        session
    }

    fn on(session: &ClientSession, id: &str) -> Option<bool> {
        get_path(session.store().view(), &["lights", id, "on"]).and_then(Value::as_bool)
    }

    fn toggle_prediction(id: &'static str) -> Prediction {
        Prediction::new(id, move |s: &mut StateTree| {
            let current = get_path(s, &["lights", id, "on"]).and_then(Value::as_bool).unwrap_or(false);
            if let Value::Object(patch) = json!({"lights": {id: {"on": !current}}}) {
                apply(s, &patch);
            }
        })
    }

    fn send_toggle(session: &mut ClientSession, id: &'static str, now: Instant) -> ReplyRx {
        let (tx, rx) = oneshot::channel();
        session.send(Toggle { target: id.into() }.into(), Some(toggle_prediction(id)), tx, now);
        rx
    }

    fn send_plain(session: &mut ClientSession, name: &str, now: Instant) -> ReplyRx {
        let (tx, rx) = oneshot::channel();
        let command = Rename {
            target: "l1".into(),
            name: name.into(),
        };
        session.send(command.into(), None, tx, now);
        rx
    }

    #[test]
    fn test_connect_and_init() {
        let now = Instant::now();
        let mut session = ClientSession::new(config(), None);
        session.connect(now).unwrap();

        assert_eq!(
            actions(&mut session),
            vec![SessionAction::Open {
                socket: 1,
                url: "ws://hub.test:8480/sync?user=alice&secret=pw".into()
            }]
        );
        assert_eq!(session.status().state, ConnectionState::Connecting);

        session.on_open(1, now);
        assert_eq!(session.status().state, ConnectionState::Initializing);
        session.on_message(1, &init(json!({"l1": {"on": true}})), now);

        assert_eq!(session.status().state, ConnectionState::Connected);
        assert_eq!(on(&session, "l1"), Some(true));
        assert_eq!(session.persisted_state().known_servers.len(), 1);
    }

    #[test]
    fn test_connect_without_endpoint() {
        let mut session = ClientSession::new(ClientConfig::default(), None);
        assert!(matches!(
            session.connect(Instant::now()),
            Err(ConnectionError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_send_when_connected_flushes() {
        let now = Instant::now();
        let mut session = connected(json!({"l1": {"on": false}}), now);

        let _rx = send_toggle(&mut session, "l1", now);
        assert_eq!(sent(&mut session), vec![r#"[1,"toggle","l1"]"#.to_string()]);
        assert_eq!(on(&session, "l1"), Some(true));
    }

    #[test]
    fn test_toggle_twice_before_replies() {
        let now = Instant::now();
        let mut session = connected(json!({"l1": {"on": false}}), now);

        let mut first = send_toggle(&mut session, "l1", now);
        let mut second = send_toggle(&mut session, "l1", now);
        assert_eq!(on(&session, "l1"), Some(true));
        assert_eq!(sent(&mut session).len(), 2);

        session.on_message(1, r#"["reply",1,null]"#, now);
        session.on_message(1, r#"["store-delta",{"lights":{"l1":{"on":true}}}]"#, now);
        session.on_message(1, r#"["reply",2,null]"#, now);
        assert_eq!(on(&session, "l1"), Some(true));

        // After linger the prediction is gone and canonical shows through.
        session.handle_timeout(now + Duration::from_secs(3));
        assert!(session.store().ledger().is_empty());
        assert_eq!(on(&session, "l1"), Some(true));
        assert_eq!(first.try_recv().unwrap(), Ok(Value::Null));
        assert_eq!(second.try_recv().unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_canonical_under_live_prediction() {
        let now = Instant::now();
        let mut session = connected(json!({"l1": {"on": true}}), now);

        let _rx = send_toggle(&mut session, "l1", now);
        assert_eq!(on(&session, "l1"), Some(false));

        session.on_message(1, r#"["store-delta",{"lights":{"l1":{"on":true,"bri":4}}}]"#, now);
        assert_eq!(
            get_path(session.store().canonical(), &["lights", "l1", "on"]),
            Some(&json!(true))
        );
        assert_eq!(on(&session, "l1"), Some(false));
        assert_eq!(
            get_path(session.store().view(), &["lights", "l1", "bri"]),
            Some(&json!(4))
        );
    }

    #[test]
    fn test_rejected_reply_rolls_back() {
        let now = Instant::now();
        let mut session = connected(json!({"l1": {"on": false}}), now);

        let mut rx = send_toggle(&mut session, "l1", now);
        session.on_message(1, r#"["reply",1,null,"not allowed"]"#, now);

        assert_eq!(on(&session, "l1"), Some(false));
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::Rejected("not allowed".into())));
    }

    #[test]
    fn test_endpoint_race() {
        let now = Instant::now();
        let mut config = config();
        config.endpoint = Some(Endpoint::Controller("hub42".into()));
        let mut session = ClientSession::new(config, None);
        session.connect(now).unwrap();
        assert_eq!(actions(&mut session).len(), 2);

        session.on_open(1, now);
        assert_eq!(actions(&mut session), vec![SessionAction::Close { socket: 2 }]);

        session.on_open(2, now + Duration::from_millis(50));
        session.on_message(2, &init(json!({})), now);
        assert_eq!(session.status().state, ConnectionState::Initializing);

        session.on_message(1, &init(json!({})), now);
        assert_eq!(session.status().state, ConnectionState::Connected);
    }

    #[test]
    fn test_queue_replay_after_reconnect() {
        let t0 = Instant::now();
        let mut session = connected(json!({}), t0);

        let _c1 = send_plain(&mut session, "c1", t0);
        let _c2 = send_plain(&mut session, "c2", t0);
        assert_eq!(sent(&mut session).len(), 2);

        session.on_closed(1, "reset", t0);
        assert_eq!(session.status().state, ConnectionState::Reconnecting);
        let _c3 = send_plain(&mut session, "c3", t0);
        assert!(sent(&mut session).is_empty());

        let t1 = t0 + Duration::from_millis(500);
        session.handle_timeout(t1);
        assert!(matches!(actions(&mut session).as_slice(), [SessionAction::Open { socket: 2, .. }]));
        session.on_open(2, t1);
        session.on_message(2, &init(json!({})), t1);

        assert_eq!(
            sent(&mut session),
            vec![
                r#"[3,"rename","l1","c1"]"#.to_string(),
                r#"[4,"rename","l1","c2"]"#.to_string(),
                r#"[5,"rename","l1","c3"]"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_reconnect_while_connected_resends_in_flight() {
        let t0 = Instant::now();
        let mut session = connected(json!({}), t0);
        let mut rx = send_plain(&mut session, "c1", t0);
        assert_eq!(sent(&mut session), vec![r#"[1,"rename","l1","c1"]"#.to_string()]);

        let t1 = t0 + Duration::from_secs(1);
        session.connect(t1).unwrap();
        let opened = actions(&mut session);
        assert!(opened.contains(&SessionAction::Close { socket: 1 }));
        assert!(matches!(opened.last(), Some(SessionAction::Open { socket: 2, .. })));

        session.on_open(2, t1);
        session.on_message(2, &init(json!({})), t1);
        assert_eq!(sent(&mut session), vec![r#"[2,"rename","l1","c1"]"#.to_string()]);

        session.handle_timeout(t0 + Duration::from_secs(7));
        assert_eq!(session.status().state, ConnectionState::Connected);

        session.on_message(2, r#"["reply",2,null]"#, t1);
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_prediction_outlives_backoff() {
        let t0 = Instant::now();
        let mut session = connected(json!({"l1": {"on": false}}), t0);
        session.on_closed(1, "reset", t0);
        let _rx = send_toggle(&mut session, "l1", t0);
        actions(&mut session);

        let t1 = t0 + Duration::from_secs(20);
        session.handle_timeout(t1);
        assert_eq!(on(&session, "l1"), Some(true));
        let socket = actions(&mut session)
            .into_iter()
            .find_map(|a| match a {
                SessionAction::Open { socket, .. } => Some(socket),
                _ => None,
            })
            .unwrap();

        session.on_open(socket, t1);
        session.on_message(socket, &init(json!({"l1": {"on": false}})), t1);
        assert_eq!(sent(&mut session), vec![r#"[1,"toggle","l1"]"#.to_string()]);
        assert_eq!(on(&session, "l1"), Some(true));

        let config = session.config();
        let deadline = t1 + config.reply_timeout + config.default_linger;
        assert_eq!(session.store().next_deadline(), Some(deadline));
    }

    #[test]
    fn test_old_controller_is_refused() {
        let now = Instant::now();
        let mut session = ClientSession::new(config(), None);
        session.connect(now).unwrap();
        session.on_open(1, now);
        session.on_message(1, r#"["init",1,{"lights":{"l1":{}}}]"#, now);

        let status = session.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert!(status.last_error.unwrap().contains("please update the controller"));
        assert!(session.store().canonical().is_empty());
    }

    #[test]
    fn test_outdated_controller_warns() {
        let now = Instant::now();
        let mut session = ClientSession::new(config(), None);
        session.connect(now).unwrap();
        session.on_open(1, now);
        session.on_message(1, r#"["init",2,{}]"#, now);

        assert_eq!(session.status().state, ConnectionState::Connected);
        assert_eq!(session.take_warnings().len(), 1);
        assert!(session.take_warnings().is_empty());
    }

    #[test]
    fn test_stalling_flag() {
        let now = Instant::now();
        let mut session = ClientSession::new(config(), None);
        let _rx = send_plain(&mut session, "x", now);

        assert!(!session.status().stalling);
        session.handle_timeout(now + Duration::from_millis(499));
        assert!(!session.status().stalling);
        session.handle_timeout(now + Duration::from_millis(500));
        assert!(session.status().stalling);

        session.connect(now).unwrap();
        session.on_open(1, now);
        session.on_message(1, &init(json!({})), now);
        assert!(session.status().stalling);

        session.on_message(1, r#"["reply",1,null]"#, now);
        assert!(!session.status().stalling);
    }

    #[test]
    fn test_disable_rejects_everything() {
        let now = Instant::now();
        let mut session = connected(json!({"l1": {"on": false}}), now);

        let mut sent_rx = send_toggle(&mut session, "l1", now);
        session.on_closed(1, "gone", now);
        let mut waiting_rx = send_plain(&mut session, "later", now);
        actions(&mut session);

        session.disable(now);
        assert_eq!(session.status().state, ConnectionState::Idle);
        assert_eq!(on(&session, "l1"), Some(false));
        assert_eq!(sent_rx.try_recv().unwrap(), Err(CommandError::Disabled));
        assert_eq!(waiting_rx.try_recv().unwrap(), Err(CommandError::Disabled));
        assert!(!session.status().stalling);
    }

    #[test]
    fn test_reply_timeout_fails_connection() {
        let now = Instant::now();
        let mut session = connected(json!({}), now);
        let _rx = send_plain(&mut session, "slow", now);
        actions(&mut session);

        session.handle_timeout(now + Duration::from_secs(7));
        let status = session.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.last_error, Some(ConnectionError::ReplyTimeout.to_string()));
        assert!(actions(&mut session).contains(&SessionAction::Close { socket: 1 }));
    }

    #[test]
    fn test_server_error_fails_connection() {
        let now = Instant::now();
        let mut session = connected(json!({}), now);
        session.on_message(1, r#"["error","maintenance"]"#, now);

        let status = session.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.last_error, Some("controller error: maintenance".into()));
    }

    #[test]
    fn test_out_of_order_messages_ignored() {
        let now = Instant::now();
        let mut session = ClientSession::new(config(), None);
        session.connect(now).unwrap();
        session.on_open(1, now);

        session.on_message(1, r#"["store-delta",{"lights":{"l1":{"on":true}}}]"#, now);
        assert!(session.store().canonical().is_empty());

        session.on_message(1, &init(json!({"l1": {"on": false}})), now);
        session.on_message(1, &init(json!({"l1": {"on": true}})), now);
        assert_eq!(on(&session, "l1"), Some(false));
        assert_eq!(session.status().state, ConnectionState::Connected);
    }

    #[test]
    fn test_try_once_gives_up_and_rejects() {
        let t0 = Instant::now();
        let mut config = config();
        config.mode = ConnectMode::TryOnce;
        let mut session = ClientSession::new(config, None);
        let mut rx = send_plain(&mut session, "x", t0);

        session.connect(t0).unwrap();
        session.on_closed(1, "refused", t0);
        session.handle_timeout(t0 + Duration::from_millis(500));
        session.on_closed(2, "refused", t0 + Duration::from_millis(500));

        assert_eq!(session.status().state, ConnectionState::Idle);
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::ConnectionLost));
    }

    #[test]
    fn test_persist_after_debounce() {
        let now = Instant::now();
        let mut session = connected(json!({"l1": {"on": true}}), now);

        session.handle_timeout(now + Duration::from_secs(1));
        let persisted: Vec<PersistedState> = actions(&mut session)
            .into_iter()
            .filter_map(|a| match a {
                SessionAction::Persist(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].state.contains_key("lights"));
    }

    #[test]
    fn test_restored_state_is_visible_before_connect() {
        let mut restored = PersistedState::default();
        restored.state.insert("lights".into(), json!({"l1": {"on": true}}));
        let session = ClientSession::new(config(), Some(restored));
        assert_eq!(on(&session, "l1"), Some(true));
    }

    #[test]
    fn test_status_change_reported_once() {
        let now = Instant::now();
        let mut session = ClientSession::new(config(), None);
        assert!(session.take_status_change().is_none());
        session.connect(now).unwrap();
        assert_eq!(
            session.take_status_change().map(|s| s.state),
            Some(ConnectionState::Connecting)
        );
        assert!(session.take_status_change().is_none());
    }
}
