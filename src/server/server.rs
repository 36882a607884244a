//! High-level Lumen server API.
//!
//! [`LumenServer`] accepts websocket connections, authenticates them from
//! the URL query string and routes commands to a [`CommandHandler`]. One
//! actor task owns the [`Broadcaster`] and the handler, so every handler
//! call and every state mutation runs on a single logical thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, trace, warn};

use super::auth::{Authenticator, credentials};
use super::broadcaster::{Broadcaster, RedactionRules};
use super::session::{Identity, ServerSession, ServerSessionId};
use crate::core::{DEFAULT_BIND_ADDR, DEFAULT_SYNC_PATH, PROTOCOL_VERSION};
use crate::delta::StateTree;
use crate::sync::{ClientFrame, Command, Pong, ServerMessage};

/// Errors that can occur in the Lumen server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server is shut down.
    #[error("server shut down")]
    Shutdown,

    /// The websocket upgrade failed.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Protocol version announced in `init`.
    pub protocol_version: u32,

    /// Websocket path clients connect to.
    pub sync_path: String,

    /// Per-identity visibility of the state tree.
    pub redaction: RedactionRules,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR
                .parse()
                .expect("default bind address is valid"),
            max_sessions: 64,
            protocol_version: PROTOCOL_VERSION,
            sync_path: DEFAULT_SYNC_PATH.to_string(),
            redaction: RedactionRules::default(),
        }
    }
}

/// Builder for creating a [`ServerConfig`].
#[derive(Debug, Default)]
pub struct LumenServerBuilder {
    config: ServerConfig,
}

impl LumenServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the websocket path.
    pub fn sync_path(mut self, path: impl Into<String>) -> Self {
        self.config.sync_path = path.into();
        self
    }

    /// Hide a top-level key from non-privileged sessions.
    pub fn privileged_key(mut self, key: impl Into<String>) -> Self {
        self.config.redaction.privileged_keys.push(key.into());
        self
    }

    /// Give every session its own entry of `source` under `key`.
    pub fn identity(mut self, source: impl Into<String>, key: impl Into<String>) -> Self {
        self.config.redaction.identity_source = Some(source.into());
        self.config.redaction.identity_key = key.into();
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Domain logic behind the commands.
///
/// Called on the server actor with exclusive access to the authoritative
/// tree. Changes made to `state` are broadcast before the reply is sent;
/// an `Err` becomes the reply's error message.
pub trait CommandHandler: Send + 'static {
    /// Execute `command` on behalf of `identity`.
    fn handle(
        &mut self,
        identity: &Identity,
        command: Command,
        state: &mut StateTree,
    ) -> Result<Value, String>;
}

/// Event from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A client authenticated and received `init`.
    ClientConnected {
        /// Session ID.
        session_id: ServerSessionId,
        /// Authenticated user.
        user: String,
    },

    /// A command was executed.
    CommandHandled {
        /// Session ID.
        session_id: ServerSessionId,
        /// Command name.
        command: &'static str,
        /// Error sent back, if the command failed.
        error: Option<String>,
    },

    /// A client has disconnected.
    ClientDisconnected {
        /// Session ID.
        session_id: ServerSessionId,
    },
}

type Mutation = Box<dyn FnOnce(&mut StateTree) + Send>;

enum ActorEvent {
    Connected {
        id: ServerSessionId,
        identity: Identity,
        outgoing: mpsc::UnboundedSender<String>,
    },
    Frame {
        id: ServerSessionId,
        text: String,
    },
    Disconnected {
        id: ServerSessionId,
    },
    Mutate(Mutation),
    Snapshot(oneshot::Sender<StateTree>),
    SessionCount(oneshot::Sender<usize>),
    Shutdown,
}

/// A Lumen protocol server.
///
/// # Example
///
/// ```ignore
/// use lumen_sync::server::{LumenServer, LumenServerBuilder, StaticCredentials};
///
/// let config = LumenServerBuilder::new()
///     .bind_addr("0.0.0.0:8480".parse()?)
///     .privileged_key("users")
///     .identity("users", "me")
///     .build();
/// let users = StaticCredentials::new().admin("alice", "secret");
///
/// let (server, mut events) = LumenServer::bind(config, users, MyHandler, initial).await?;
/// server.mutate(|state| { state.insert("online".into(), true.into()); })?;
/// ```
pub struct LumenServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    actor: mpsc::UnboundedSender<ActorEvent>,
    actor_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl LumenServer {
    /// Bind to an address and start the server.
    pub async fn bind<A, H>(
        config: ServerConfig,
        authenticator: A,
        handler: H,
        initial_state: StateTree,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), ServerError>
    where
        A: Authenticator,
        H: CommandHandler,
    {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let (actor_tx, actor_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let actor = Actor {
            broadcaster: Broadcaster::new(initial_state, config.redaction.clone())
                .with_version(config.protocol_version),
            handler,
            sessions: HashMap::new(),
            max_sessions: config.max_sessions,
            events: event_tx,
        };
        let actor_task = tokio::spawn(actor.run(actor_rx));

        let ctx = Arc::new(ConnectionContext {
            authenticator: Box::new(authenticator),
            actor: actor_tx.clone(),
            sync_path: config.sync_path.clone(),
        });
        tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        info!(addr = %local_addr, "server listening");
        let server = Self {
            config,
            local_addr,
            actor: actor_tx,
            actor_task: Some(actor_task),
            shutdown_tx: Some(shutdown_tx),
        };

        Ok((server, event_rx))
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Change the authoritative state from outside a command, e.g. when a
    /// device reports a new reading. Broadcast at the end of the tick.
    pub fn mutate(
        &self,
        f: impl FnOnce(&mut StateTree) + Send + 'static,
    ) -> Result<(), ServerError> {
        self.actor
            .send(ActorEvent::Mutate(Box::new(f)))
            .map_err(|_| ServerError::Shutdown)
    }

    /// Copy of the authoritative state.
    pub async fn snapshot(&self) -> Result<StateTree, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .send(ActorEvent::Snapshot(tx))
            .map_err(|_| ServerError::Shutdown)?;
        rx.await.map_err(|_| ServerError::Shutdown)
    }

    /// Get the number of active sessions.
    pub async fn session_count(&self) -> Result<usize, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .send(ActorEvent::SessionCount(tx))
            .map_err(|_| ServerError::Shutdown)?;
        rx.await.map_err(|_| ServerError::Shutdown)
    }

    /// Stop accepting, close every session and wait for the actor to exit.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.actor.send(ActorEvent::Shutdown);
        if let Some(task) = self.actor_task.take() {
            task.await.map_err(|_| ServerError::Shutdown)?;
        }
        Ok(())
    }
}

impl Drop for LumenServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            let _ = self.actor.send(ActorEvent::Shutdown);
        }
    }
}

struct Connection {
    session: ServerSession,
    outgoing: mpsc::UnboundedSender<String>,
}

struct Actor<H> {
    broadcaster: Broadcaster,
    handler: H,
    sessions: HashMap<ServerSessionId, Connection>,
    max_sessions: usize,
    events: mpsc::Sender<ServerEvent>,
}

impl<H: CommandHandler> Actor<H> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorEvent>) {
        while let Some(event) = rx.recv().await {
            // Drain whatever is ready, then broadcast once for the tick.
            let mut running = self.handle(event);
            while running {
                match rx.try_recv() {
                    Ok(event) => running = self.handle(event),
                    Err(_) => break,
                }
            }
            self.broadcast();
            if !running {
                break;
            }
        }

        // Dropping the senders closes every connection task.
        self.sessions.clear();
        info!("server actor stopped");
    }

    fn handle(&mut self, event: ActorEvent) -> bool {
        match event {
            ActorEvent::Connected {
                id,
                identity,
                outgoing,
            } => self.on_connected(id, identity, outgoing),
            ActorEvent::Frame { id, text } => self.on_frame(id, &text),
            ActorEvent::Disconnected { id } => self.on_disconnected(id),
            ActorEvent::Mutate(f) => self.broadcaster.mutate(f),
            ActorEvent::Snapshot(reply) => {
                let _ = reply.send(self.broadcaster.canonical().clone());
            }
            ActorEvent::SessionCount(reply) => {
                let _ = reply.send(self.sessions.len());
            }
            ActorEvent::Shutdown => return false,
        }
        true
    }

    fn on_connected(
        &mut self,
        id: ServerSessionId,
        identity: Identity,
        outgoing: mpsc::UnboundedSender<String>,
    ) {
        if self.sessions.len() >= self.max_sessions {
            warn!(session = %id, user = %identity.user, "session limit reached");
            let _ = outgoing.send(ServerMessage::Error("too many sessions".into()).encode());
            return;
        }

        let init = self.broadcaster.add_session(id, identity.clone());
        let _ = outgoing.send(init.encode());
        info!(session = %id, user = %identity.user, privileged = identity.privileged, "client connected");

        self.emit(ServerEvent::ClientConnected {
            session_id: id,
            user: identity.user.clone(),
        });
        self.sessions.insert(
            id,
            Connection {
                session: ServerSession::new(id, identity, Instant::now()),
                outgoing,
            },
        );
    }

    fn on_frame(&mut self, id: ServerSessionId, text: &str) {
        let Some(identity) = self.sessions.get(&id).map(|c| c.session.identity().clone()) else {
            return;
        };

        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                match ClientFrame::peek_id(text) {
                    Some(tx) => self.send_to(id, &ServerMessage::failed(tx, e.to_string())),
                    None => warn!(session = %id, error = %e, "dropping malformed frame"),
                }
                return;
            }
        };

        let (name, result) = match frame.command() {
            Ok(command) => (command.name(), self.dispatch(&identity, command)),
            Err(e) => ("unknown", Err(e.to_string())),
        };
        debug!(session = %id, tx = frame.id, command = name, ok = result.is_ok(), "handled");

        // The change goes out before the reply that confirms it.
        self.broadcast();

        let error = result.as_ref().err().cloned();
        let reply = match result {
            Ok(value) => ServerMessage::ok(frame.id, value),
            Err(message) => ServerMessage::failed(frame.id, message),
        };
        self.send_to(id, &reply);
        self.emit(ServerEvent::CommandHandled {
            session_id: id,
            command: name,
            error,
        });
    }

    fn dispatch(&mut self, identity: &Identity, command: Command) -> Result<Value, String> {
        if let Command::Ping(_) = command {
            let server_time_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            return serde_json::to_value(Pong { server_time_ms }).map_err(|e| e.to_string());
        }

        let handler = &mut self.handler;
        self.broadcaster
            .mutate(|state| handler.handle(identity, command, state))
    }

    fn on_disconnected(&mut self, id: ServerSessionId) {
        let Some(mut conn) = self.sessions.remove(&id) else {
            return;
        };
        conn.session.close();
        self.broadcaster.remove_session(id);
        info!(
            session = %id,
            user = %conn.session.identity().user,
            secs = conn.session.connected_at().elapsed().as_secs(),
            "client disconnected"
        );
        self.emit(ServerEvent::ClientDisconnected { session_id: id });
    }

    fn broadcast(&mut self) {
        for (id, message) in self.broadcaster.flush() {
            self.send_to(id, &message);
        }
    }

    fn send_to(&self, id: ServerSessionId, message: &ServerMessage) {
        if let Some(conn) = self.sessions.get(&id) {
            // A closed channel means `Disconnected` is already on its way.
            let _ = conn.outgoing.send(message.encode());
        }
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.try_send(event).is_err() {
            trace!("server event dropped");
        }
    }
}

struct ConnectionContext {
    authenticator: Box<dyn Authenticator>,
    actor: mpsc::UnboundedSender<ActorEvent>,
    sync_path: String,
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, ctx).await {
                            debug!(%peer, error = %e, "connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    debug!("accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
) -> Result<(), ServerError> {
    let mut query = None;
    let sync_path = ctx.sync_path.as_str();
    let callback = |request: &Request, response: Response| {
        if request.uri().path() != sync_path {
            let mut refused = ErrorResponse::new(Some("unknown path".to_string()));
            *refused.status_mut() = StatusCode::NOT_FOUND;
            return Err(refused);
        }
        query = request.uri().query().map(str::to_owned);
        Ok(response)
    };
    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| ServerError::InvalidHandshake(e.to_string()))?;
    let (mut sink, mut source) = ws.split();

    let (user, secret) = credentials(query.as_deref().unwrap_or_default());
    let Some(identity) = ctx.authenticator.authenticate(&user, &secret) else {
        warn!(%peer, user = %user, "authentication failed");
        let refusal = ServerMessage::Error("authentication failed".to_string()).encode();
        let _ = sink.send(Message::Text(refusal)).await;
        let _ = sink.close().await;
        return Ok(());
    };

    let id = ServerSessionId::generate();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
    ctx.actor
        .send(ActorEvent::Connected {
            id,
            identity,
            outgoing,
        })
        .map_err(|_| ServerError::Shutdown)?;

    loop {
        tokio::select! {
            item = outgoing_rx.recv() => match item {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(session = %id, error = %e, "send failed");
                        break;
                    }
                }
                None => {
                    // The actor dropped the session.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if ctx.actor.send(ActorEvent::Frame { id, text }).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "read failed");
                    break;
                }
            },
        }
    }

    let _ = ctx.actor.send(ActorEvent::Disconnected { id });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Lights;

    impl CommandHandler for Lights {
        fn handle(
            &mut self,
            _identity: &Identity,
            command: Command,
            state: &mut StateTree,
        ) -> Result<Value, String> {
            match command {
                Command::Toggle(toggle) => {
                    let light = state
                        .get_mut("lights")
                        .and_then(|l| l.get_mut(toggle.target.as_str()))
                        .ok_or_else(|| format!("no such light: {}", toggle.target))?;
                    let on = light["on"].as_bool().unwrap_or(false);
                    light["on"] = json!(!on);
                    Ok(Value::Null)
                }
                other => Err(format!("unsupported: {}", other.name())),
            }
        }
    }

    fn actor() -> (Actor<Lights>, mpsc::Receiver<ServerEvent>) {
        let (events, rx) = mpsc::channel(16);
        let initial = match json!({"lights": {"l1": {"on": false}}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let actor = Actor {
            broadcaster: Broadcaster::new(initial, RedactionRules::default()),
            handler: Lights,
            sessions: HashMap::new(),
            max_sessions: 2,
            events,
        };
        (actor, rx)
    }

    fn connect(actor: &mut Actor<Lights>, n: u8) -> (ServerSessionId, mpsc::UnboundedReceiver<String>) {
        let id = ServerSessionId::new([n, 0, 0, 0, 0, 0]);
        let (tx, rx) = mpsc::unbounded_channel();
        actor.handle(ActorEvent::Connected {
            id,
            identity: Identity::user(format!("user{n}")),
            outgoing: tx,
        });
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(ServerMessage::decode(&text).unwrap());
        }
        out
    }

    #[test]
    fn test_builder() {
        let config = LumenServerBuilder::new()
            .max_sessions(3)
            .privileged_key("users")
            .identity("users", "self")
            .build();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.sync_path, "/sync");
        assert_eq!(config.redaction.privileged_keys, vec!["users".to_string()]);
        assert_eq!(config.redaction.identity_source.as_deref(), Some("users"));
        assert_eq!(config.redaction.identity_key, "self");
    }

    #[test]
    fn test_config_from_json() {
        let config: ServerConfig = serde_json::from_value(json!({
            "bind_addr": "127.0.0.1:9000",
            "redaction": {"privileged_keys": ["users"]}
        }))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.redaction.identity_key, "me");
    }

    #[test]
    fn test_connect_sends_init() {
        let (mut actor, mut events) = actor();
        let (id, mut rx) = connect(&mut actor, 1);

        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[..],
            [ServerMessage::Init { version: PROTOCOL_VERSION, .. }]
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            ServerEvent::ClientConnected {
                session_id: id,
                user: "user1".into()
            }
        );
    }

    #[test]
    fn test_session_limit() {
        let (mut actor, _events) = actor();
        connect(&mut actor, 1);
        connect(&mut actor, 2);
        let (_, mut rx) = connect(&mut actor, 3);

        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error("too many sessions".into())]
        );
        assert_eq!(actor.sessions.len(), 2);
    }

    #[test]
    fn test_command_broadcasts_before_reply() {
        let (mut actor, _events) = actor();
        let (id, mut rx1) = connect(&mut actor, 1);
        let (_, mut rx2) = connect(&mut actor, 2);
        drain(&mut rx1);
        drain(&mut rx2);

        actor.handle(ActorEvent::Frame {
            id,
            text: r#"[7, "toggle", "l1"]"#.into(),
        });

        let delta = match json!({"lights": {"l1": {"on": true}}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(
            drain(&mut rx1),
            vec![
                ServerMessage::StoreDelta(delta.clone()),
                ServerMessage::ok(7, Value::Null)
            ]
        );
        assert_eq!(drain(&mut rx2), vec![ServerMessage::StoreDelta(delta)]);
    }

    #[test]
    fn test_handler_error_becomes_reply_error() {
        let (mut actor, mut events) = actor();
        let (id, mut rx) = connect(&mut actor, 1);
        drain(&mut rx);
        let _ = events.try_recv();

        actor.handle(ActorEvent::Frame {
            id,
            text: r#"[1, "toggle", "nope"]"#.into(),
        });
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::failed(1, "no such light: nope")]
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::CommandHandled { command: "toggle", error: Some(_), .. }
        ));
    }

    #[test]
    fn test_ping_answered_without_handler() {
        let (mut actor, _events) = actor();
        let (id, mut rx) = connect(&mut actor, 1);
        drain(&mut rx);

        actor.handle(ActorEvent::Frame {
            id,
            text: r#"[2, "ping"]"#.into(),
        });
        match drain(&mut rx).as_slice() {
            [ServerMessage::Reply { id: 2, result, error: None }] => {
                assert!(result["server_time_ms"].as_u64().unwrap() > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        let (mut actor, _events) = actor();
        let (id, mut rx) = connect(&mut actor, 1);
        drain(&mut rx);

        // An id is recoverable: the client gets an error reply.
        actor.handle(ActorEvent::Frame {
            id,
            text: r#"[5, "explode"]"#.into(),
        });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Reply { id: 5, error: Some(_), .. }]
        ));

        // Nothing to answer.
        actor.handle(ActorEvent::Frame {
            id,
            text: "garbage".into(),
        });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_external_mutation_batches_per_tick() {
        let (mut actor, _events) = actor();
        let (_, mut rx) = connect(&mut actor, 1);
        drain(&mut rx);

        actor.handle(ActorEvent::Mutate(Box::new(|s: &mut StateTree| s["lights"]["l1"]["on"] = json!(true))));
        actor.handle(ActorEvent::Mutate(Box::new(|s: &mut StateTree| s["lights"]["l2"] = json!({"on": false}))));
        assert!(drain(&mut rx).is_empty());

        actor.broadcast();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_disconnect_forgets_session() {
        let (mut actor, mut events) = actor();
        let (id, _rx) = connect(&mut actor, 1);
        let _ = events.try_recv();

        actor.handle(ActorEvent::Disconnected { id });
        assert!(actor.sessions.is_empty());
        assert_eq!(actor.broadcaster.session_count(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            ServerEvent::ClientDisconnected { session_id: id }
        );
        assert!(!actor.handle(ActorEvent::Shutdown));
    }
}
