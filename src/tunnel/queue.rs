//! Bounded, priority-partitioned buffer of agent-originated requests.
//!
//! Entries drain highest tier first and FIFO within a tier. When the queue is
//! full, the lowest tier gives way: an incoming entry that outranks the
//! lowest queued tier displaces that tier's newest entry, anything else is
//! turned away.

use std::collections::VecDeque;

use super::protocol::{Priority, RequestEnvelope};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// What happened to a pushed entry.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued, at the expense of the returned lower-priority entry.
    Displaced(RequestEnvelope),
    /// Not queued: the queue is full of entries at least as important.
    Rejected(RequestEnvelope),
}

#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    /// Indexed by `tier()`: high, normal, low.
    tiers: [VecDeque<RequestEnvelope>; 3],
}

fn tier(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        self.tiers[tier(priority)].len()
    }

    pub fn push(&mut self, request: RequestEnvelope) -> Enqueued {
        let incoming = tier(request.priority);
        if self.len() < self.capacity {
            self.tiers[incoming].push_back(request);
            return Enqueued::Queued;
        }
        // Lowest non-empty tier is the largest index.
        let lowest = (0..3).rev().find(|&t| !self.tiers[t].is_empty());
        match lowest {
            Some(lowest) if lowest > incoming => {
                let dropped = self.tiers[lowest].pop_back();
                self.tiers[incoming].push_back(request);
                match dropped {
                    Some(dropped) => Enqueued::Displaced(dropped),
                    None => Enqueued::Queued,
                }
            }
            _ => Enqueued::Rejected(request),
        }
    }

    /// Next entry to send.
    pub fn pop(&mut self) -> Option<RequestEnvelope> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Return an entry that could not be sent to the head of its tier.
    /// May exceed capacity by the entries in flight at the time.
    pub fn push_front(&mut self, request: RequestEnvelope) {
        self.tiers[tier(request.priority)].push_front(request);
    }

    /// Remove everything, returning the entries in send order.
    pub fn drain(&mut self) -> Vec<RequestEnvelope> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(r) = self.pop() {
            out.push(r);
        }
        out
    }
}
