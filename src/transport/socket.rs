//! Websocket wrapper for Lumen transport.
//!
//! Each [`LumenSocket`] runs one tokio task that connects, forwards text
//! frames in both directions and reports everything that happens as a
//! [`SocketEvent`] tagged with the socket's id. Many sockets share one event
//! channel so a driver can race candidates and tell them apart.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use super::connection::SocketId;

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    /// The websocket handshake completed.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The socket closed, failed to connect or errored.
    Closed(String),
}

/// A [`SocketEventKind`] tagged with its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Socket the event belongs to.
    pub socket: SocketId,
    /// What happened.
    pub kind: SocketEventKind,
}

enum Outgoing {
    Text(String),
    Close,
}

/// Handle to a websocket connection task.
#[derive(Debug)]
pub struct LumenSocket {
    id: SocketId,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl LumenSocket {
    /// Start connecting to `url`. Events go to `events`.
    pub fn open(id: SocketId, url: String, events: mpsc::UnboundedSender<SocketEvent>) -> Self {
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(id, url, rx, events));
        Self { id, outgoing }
    }

    /// Socket id.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queue a text frame. Returns `false` if the task has exited.
    pub fn send(&self, text: String) -> bool {
        self.outgoing.send(Outgoing::Text(text)).is_ok()
    }

    /// Close gracefully. No further events are reported.
    pub fn close(self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

async fn run_socket(
    id: SocketId,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let emit = |kind: SocketEventKind| {
        let _ = events.send(SocketEvent { socket: id, kind });
    };

    // Nothing is sent before `Opened`, so any outgoing item here is a close.
    let stream = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok((stream, _)) => stream,
            Err(e) => {
                debug!(socket = id, error = %e, "connect failed");
                emit(SocketEventKind::Closed(e.to_string()));
                return;
            }
        },
        _ = outgoing.recv() => {
            trace!(socket = id, "closed while connecting");
            return;
        }
    };

    debug!(socket = id, "websocket open");
    emit(SocketEventKind::Opened);
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            item = outgoing.recv() => match item {
                Some(Outgoing::Text(text)) => {
                    trace!(socket = id, len = text.len(), "send");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        emit(SocketEventKind::Closed(e.to_string()));
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => emit(SocketEventKind::Message(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => emit(SocketEventKind::Message(text)),
                    Err(_) => debug!(socket = id, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by peer".to_string());
                    emit(SocketEventKind::Closed(reason));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(SocketEventKind::Closed(e.to_string()));
                    return;
                }
                None => {
                    emit(SocketEventKind::Closed("connection ended".to_string()));
                    return;
                }
            },
        }
    }
}
