//! Per-destination outbound message queues.
//!
//! Decouples "data became available" from "destination became writable":
//! readers push onto the queue of the destination, the loop pops from it only
//! when the poller reports that destination writable.

use std::collections::{HashMap, VecDeque};

use super::Role;
use super::listener::ConnectionId;

/// Where a queued message is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// The local output stream of a role (`<stdout>` or `<stderr>`).
    Local(Role),
    /// An accepted peer connection (only STDIN-role connections receive data).
    Connection(ConnectionId),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Local(role) => write!(f, "local {}", role.endpoint_name()),
            Destination::Connection(id) => write!(f, "connection {id}"),
        }
    }
}

/// Result of a non-blocking dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued {
    Message(Vec<u8>),
    /// The queue exists but holds nothing.
    Empty,
    /// No queue is registered for the destination.
    Missing,
}

#[derive(Debug, Default)]
pub struct OutboundQueues {
    queues: HashMap<Destination, VecDeque<Vec<u8>>>,
}

impl OutboundQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure an (empty) queue exists for `dest`.
    pub fn open(&mut self, dest: Destination) {
        self.queues.entry(dest).or_default();
    }

    /// Append a message; the queue is created on first use.
    pub fn enqueue(&mut self, dest: Destination, msg: Vec<u8>) {
        if msg.is_empty() {
            return;
        }
        self.queues.entry(dest).or_default().push_back(msg);
    }

    pub fn dequeue_nowait(&mut self, dest: Destination) -> Dequeued {
        match self.queues.get_mut(&dest) {
            Some(q) => match q.pop_front() {
                Some(msg) => Dequeued::Message(msg),
                None => Dequeued::Empty,
            },
            None => Dequeued::Missing,
        }
    }

    /// Put the unwritten tail of a partially delivered message back at the
    /// head of its queue.
    pub fn requeue_front(&mut self, dest: Destination, rest: Vec<u8>) {
        if rest.is_empty() {
            return;
        }
        self.queues.entry(dest).or_default().push_front(rest);
    }

    /// Drop the queue for `dest`, returning how many messages were discarded.
    pub fn discard(&mut self, dest: Destination) -> Option<usize> {
        self.queues.remove(&dest).map(|q| q.len())
    }

    pub fn contains(&self, dest: Destination) -> bool {
        self.queues.contains_key(&dest)
    }

    pub fn pending(&self, dest: Destination) -> usize {
        self.queues.get(&dest).map_or(0, VecDeque::len)
    }

    pub fn has_pending(&self, dest: Destination) -> bool {
        self.pending(dest) > 0
    }
}
