//! Ordering of inbound gateway messages by lock key.
//!
//! Messages wait in arrival order. When a message is first examined it is
//! appended to the FIFO of each of its lock keys; it is released only once
//! it heads every one of those FIFOs, and it leaves them when its
//! processing ends. Two messages sharing a key are therefore processed in
//! arrival order, while messages with disjoint keys overlap freely.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::lock_key::LockKey;
use crate::message::GatewayMessage;

/// A message released for processing. Hand it back to
/// [`GatewayMessageManager::end`] when done.
#[derive(Debug, Clone)]
pub struct ReleasedMessage {
    ticket: u64,
    keys: Vec<LockKey>,
    message: Arc<GatewayMessage>,
}

impl ReleasedMessage {
    /// The message.
    pub fn message(&self) -> &GatewayMessage {
        &self.message
    }

    /// Arrival sequence number within this manager.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Keys the message holds.
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

#[derive(Debug)]
struct Pending {
    ticket: u64,
    message: Arc<GatewayMessage>,
    keys: Vec<LockKey>,
    checked: bool,
}

#[derive(Debug, Default)]
struct ManagerState {
    next_ticket: u64,
    pending: VecDeque<Pending>,
    fifos: HashMap<LockKey, VecDeque<u64>>,
    in_flight: usize,
}

impl ManagerState {
    fn heads_all(&self, ticket: u64, keys: &[LockKey]) -> bool {
        keys.iter()
            .all(|k| self.fifos.get(k).and_then(|q| q.front()) == Some(&ticket))
    }
}

/// Queue of inbound messages with per-key ordering.
#[derive(Debug, Default)]
pub struct GatewayMessageManager {
    state: Mutex<ManagerState>,
}

impl GatewayMessageManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message. Returns its ticket.
    pub fn put(&self, message: GatewayMessage) -> u64 {
        let keys = LockKey::for_message(&message);
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        trace!(ticket, id = message.id, op = message.op.name(), "message queued");
        state.pending.push_back(Pending {
            ticket,
            message: Arc::new(message),
            keys,
            checked: false,
        });
        ticket
    }

    /// Releases the first queued message that heads the FIFO of each of its
    /// keys, or `None` if every queued message is blocked.
    pub fn poll(&self) -> Option<ReleasedMessage> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut released = None;
        for (pos, pending) in state.pending.iter_mut().enumerate() {
            if !pending.checked {
                for key in &pending.keys {
                    state
                        .fifos
                        .entry(key.clone())
                        .or_default()
                        .push_back(pending.ticket);
                }
                pending.checked = true;
            }
            let ready = pending.keys.iter().all(|k| {
                state.fifos.get(k).and_then(|q| q.front()) == Some(&pending.ticket)
            });
            if ready {
                released = Some(pos);
                break;
            }
        }
        let pending = state.pending.remove(released?)?;
        state.in_flight += 1;
        debug_assert!(state.heads_all(pending.ticket, &pending.keys));
        trace!(ticket = pending.ticket, "message released");
        Some(ReleasedMessage {
            ticket: pending.ticket,
            keys: pending.keys,
            message: pending.message,
        })
    }

    /// Ends processing of a released message, unblocking messages queued
    /// behind it.
    pub fn end(&self, released: &ReleasedMessage) {
        let mut state = self.state.lock();
        for key in &released.keys {
            if let Some(queue) = state.fifos.get_mut(key) {
                queue.retain(|t| *t != released.ticket);
                if queue.is_empty() {
                    state.fifos.remove(key);
                }
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        trace!(ticket = released.ticket, "message ended");
    }

    /// Number of messages not yet released.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of released messages not yet ended.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// True when nothing is queued or being processed.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight == 0
    }
}
