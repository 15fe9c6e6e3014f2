//! Channels and parked waiters.
//!
//! A channel is a typed rendezvous point with no buffer: a transfer
//! happens only at the instant a sender and a receiver are both
//! present, directly from the sender's source location to the
//! receiver's destination. The channel itself only stores the threads
//! currently parked on it, in FIFO order per direction.
//!
//! Alternation (`alt`/`nbalt`) parks one waiter per candidate channel;
//! each such waiter carries the alt-table index and the destination the
//! chosen index is written to, so a racing partner can commit the alt
//! entry directly. The readiness test and the commit are a single
//! mutation of VM state, which is what makes them atomic with respect
//! to other threads: no third party runs in between.

use std::collections::VecDeque;

use crate::value::{Loc, Tid, Value, ValueKind};

/// Where a parked sender's value comes from: a resolved location, or a
/// literal operand materialized at park time.
#[derive(Debug, Clone)]
pub enum Payload {
    Loc(Loc),
    Val(Value),
}

/// Context for a waiter parked by `alt`/`nbalt`.
#[derive(Debug, Clone)]
pub struct AltCtx {
    /// Index of this entry in the alt table.
    pub index: usize,
    /// Where the chosen index is written on commit.
    pub dst: Loc,
}

/// One parked thread on one channel.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub tid: Tid,
    /// Source (for parked senders) or destination (for parked
    /// receivers) of the pending transfer.
    pub payload: Payload,
    /// Program counter the thread resumes at once the rendezvous
    /// commits (the instruction after the blocking one).
    pub resume_pc: usize,
    /// Set when the waiter was parked by an alternation.
    pub alt: Option<AltCtx>,
}

/// A typed rendezvous channel.
#[derive(Debug)]
pub struct Channel {
    pub kind: ValueKind,
    senders: VecDeque<Waiter>,
    receivers: VecDeque<Waiter>,
}

impl Channel {
    pub fn new(kind: ValueKind) -> Self {
        Channel { kind, senders: VecDeque::new(), receivers: VecDeque::new() }
    }

    /// True if a thread other than `me` is parked to send.
    pub fn sender_ready(&self, me: Tid) -> bool {
        self.senders.iter().any(|w| w.tid != me)
    }

    /// True if a thread other than `me` is parked to receive.
    pub fn receiver_ready(&self, me: Tid) -> bool {
        self.receivers.iter().any(|w| w.tid != me)
    }

    /// Take the first parked sender not belonging to `me`.
    pub fn take_sender(&mut self, me: Tid) -> Option<Waiter> {
        let pos = self.senders.iter().position(|w| w.tid != me)?;
        self.senders.remove(pos)
    }

    /// Take the first parked receiver not belonging to `me`.
    pub fn take_receiver(&mut self, me: Tid) -> Option<Waiter> {
        let pos = self.receivers.iter().position(|w| w.tid != me)?;
        self.receivers.remove(pos)
    }

    /// Park a sender.
    pub fn park_sender(&mut self, w: Waiter) {
        self.senders.push_back(w);
    }

    /// Park a receiver.
    pub fn park_receiver(&mut self, w: Waiter) {
        self.receivers.push_back(w);
    }

    /// Remove every waiter belonging to `tid` (used when an alt commits
    /// one entry and the thread's other registrations must go away).
    pub fn forget(&mut self, tid: Tid) {
        self.senders.retain(|w| w.tid != tid);
        self.receivers.retain(|w| w.tid != tid);
    }

    /// Number of parked waiters in both directions (diagnostics).
    pub fn parked(&self) -> usize {
        self.senders.len() + self.receivers.len()
    }
}
