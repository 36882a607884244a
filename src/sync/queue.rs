//! Command queue and reply correlation
//!
//! Commands wait in `pending` until the connection is ready, then move to
//! `in_flight` keyed by the transaction id they were sent with. A reply
//! resolves exactly one in-flight entry. On disconnect, in-flight entries
//! go back to the front of `pending` in their original order and receive
//! fresh ids when resent.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::{CommandError, REPLY_TIMEOUT};

use super::ledger::PredictionHandle;
use super::message::ClientFrame;

/// Channel a command's outcome is delivered on.
pub type ReplySender = oneshot::Sender<Result<Value, CommandError>>;

/// One queued command.
#[derive(Debug)]
pub struct PendingCommand {
    /// Transaction id of the current send, `None` while pending.
    pub id: Option<u64>,
    /// `[command, ...args]`.
    pub payload: Vec<Value>,
    /// Where the outcome goes.
    pub reply: ReplySender,
    /// Prediction made for this command.
    pub prediction: Option<PredictionHandle>,
    /// How long the prediction stays after a successful reply.
    pub linger: Duration,
    /// When the current send happened.
    pub sent_at: Option<Instant>,
}

/// What a resolved reply means for the prediction it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    /// Prediction to settle, if one was made.
    pub prediction: Option<PredictionHandle>,
    /// Whether the server rejected the command.
    pub failed: bool,
    /// Linger configured for the command.
    pub linger: Duration,
}

/// A command that just went in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    /// Transaction id it was sent with.
    pub id: u64,
    /// Encoded frame.
    pub text: String,
    /// Prediction made for the command.
    pub prediction: Option<PredictionHandle>,
    /// Linger configured for the command.
    pub linger: Duration,
}

/// Ordered pending commands and in-flight transactions.
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<PendingCommand>,
    in_flight: BTreeMap<u64, PendingCommand>,
    next_id: u64,
    reply_timeout: Duration,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(REPLY_TIMEOUT)
    }
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_id: 0,
            reply_timeout,
        }
    }

    /// Append a command. Returns `true` when the queue had no outstanding
    /// work before this call.
    pub fn enqueue(
        &mut self,
        payload: Vec<Value>,
        reply: ReplySender,
        prediction: Option<PredictionHandle>,
        linger: Duration,
    ) -> bool {
        let first = !self.has_outstanding();
        self.pending.push_back(PendingCommand {
            id: None,
            payload,
            reply,
            prediction,
            linger,
            sent_at: None,
        });
        first
    }

    /// Assign ids to every pending command, move them in flight and return
    /// them in order.
    pub fn flush(&mut self, now: Instant) -> Vec<Flushed> {
        let mut frames = Vec::with_capacity(self.pending.len());
        while let Some(mut cmd) = self.pending.pop_front() {
            self.next_id += 1;
            let id = self.next_id;
            frames.push(Flushed {
                id,
                text: ClientFrame::new(id, cmd.payload.clone()).encode(),
                prediction: cmd.prediction.clone(),
                linger: cmd.linger,
            });
            cmd.id = Some(id);
            cmd.sent_at = Some(now);
            self.in_flight.insert(id, cmd);
        }
        if !frames.is_empty() {
            debug!(count = frames.len(), in_flight = self.in_flight.len(), "flushed commands");
        }
        frames
    }

    /// Deliver a reply. `Err` carries the server's error message.
    ///
    /// Returns `None` for an unknown id.
    pub fn resolve(&mut self, id: u64, result: Result<Value, String>) -> Option<Settled> {
        let Some(cmd) = self.in_flight.remove(&id) else {
            warn!(id, "reply for unknown transaction");
            return None;
        };

        let failed = result.is_err();
        let outcome = result.map_err(CommandError::Rejected);
        if cmd.reply.send(outcome).is_err() {
            debug!(id, "caller no longer waiting for reply");
        }

        Some(Settled {
            prediction: cmd.prediction,
            failed,
            linger: cmd.linger,
        })
    }

    /// Move every in-flight command back to the front of the pending list,
    /// in original send order. Returns how many moved.
    pub fn requeue_in_flight(&mut self) -> usize {
        let moved = std::mem::take(&mut self.in_flight);
        let count = moved.len();
        for (_, mut cmd) in moved.into_iter().rev() {
            cmd.id = None;
            cmd.sent_at = None;
            self.pending.push_front(cmd);
        }
        if count > 0 {
            debug!(count, "requeued in-flight commands");
        }
        count
    }

    /// Predictions of commands still waiting to be sent.
    pub fn pending_predictions(&self) -> impl Iterator<Item = &PredictionHandle> {
        self.pending.iter().filter_map(|cmd| cmd.prediction.as_ref())
    }

    /// Reject every pending and in-flight command with `error`. Returns the
    /// predictions that must be rolled back.
    pub fn abandon(&mut self, error: CommandError) -> Vec<PredictionHandle> {
        let in_flight = std::mem::take(&mut self.in_flight).into_values();
        let pending = std::mem::take(&mut self.pending);

        in_flight
            .chain(pending)
            .filter_map(|cmd| {
                let _ = cmd.reply.send(Err(error.clone()));
                cmd.prediction
            })
            .collect()
    }

    /// When the oldest in-flight command times out.
    pub fn next_reply_deadline(&self) -> Option<Instant> {
        self.in_flight
            .values()
            .filter_map(|cmd| cmd.sent_at)
            .min()
            .map(|sent| sent + self.reply_timeout)
    }

    /// Whether some in-flight command has waited longer than the reply timeout.
    pub fn reply_timed_out(&self, now: Instant) -> bool {
        self.next_reply_deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Whether anything is pending or in flight.
    pub fn has_outstanding(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// Number of commands waiting to be sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of commands awaiting a reply.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Reply timeout applied to each send.
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}
