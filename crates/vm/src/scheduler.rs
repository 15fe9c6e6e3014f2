//! Cooperative round-robin scheduler.
//!
//! The scheduler manages:
//! - Thread registry (Tid -> Thread mapping)
//! - Run queue (runnable thread ids)
//! - Block/wake/terminate transitions driven by the dispatch loop
//!
//! Scheduling is cooperative at the granularity of one instruction:
//! the dispatch loop asks for the next runnable thread, executes one
//! instruction, and requeues it unless it blocked or terminated. Every
//! runnable thread is eventually dispatched; there is no further
//! fairness guarantee.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::frame::Frame;
use crate::thread::{Thread, ThreadState};
use crate::value::{ModId, Tid};

/// The thread scheduler.
pub struct Scheduler {
    threads: HashMap<Tid, Thread>,
    run_queue: VecDeque<Tid>,
    next_tid: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { threads: HashMap::new(), run_queue: VecDeque::new(), next_tid: 1 }
    }

    /// Register a new thread and make it runnable. The creating thread
    /// is unaffected.
    pub fn spawn(&mut self, module: ModId, pc: usize, initial: Frame) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        self.threads.insert(tid, Thread::new(tid, module, pc, initial));
        self.run_queue.push_back(tid);
        trace!(%tid, pc, "thread spawned");
        tid
    }

    /// Pick the next runnable thread (round-robin). The caller is
    /// expected to requeue it afterwards if it is still runnable.
    pub fn schedule_next(&mut self) -> Option<Tid> {
        while let Some(tid) = self.run_queue.pop_front() {
            if self.threads.get(&tid).is_some_and(Thread::is_runnable) {
                return Some(tid);
            }
        }
        None
    }

    /// Put a still-runnable thread back at the end of the queue.
    pub fn requeue(&mut self, tid: Tid) {
        if self.threads.get(&tid).is_some_and(Thread::is_runnable) {
            self.run_queue.push_back(tid);
        }
    }

    /// Transition a thread to Blocked.
    pub fn block(&mut self, tid: Tid) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.state = ThreadState::Blocked;
        }
    }

    /// Wake a blocked thread at the given program counter.
    pub fn wake(&mut self, tid: Tid, pc: usize) {
        if let Some(t) = self.threads.get_mut(&tid) {
            debug_assert_ne!(t.state, ThreadState::Terminated);
            t.state = ThreadState::Runnable;
            t.pc = pc;
            self.run_queue.push_back(tid);
        }
    }

    /// Mark a thread terminated and remove it from the registry,
    /// returning it so the caller can release its frame chain.
    pub fn terminate(&mut self, tid: Tid) -> Option<Thread> {
        self.run_queue.retain(|t| *t != tid);
        let mut t = self.threads.remove(&tid)?;
        t.state = ThreadState::Terminated;
        trace!(%tid, "thread terminated");
        Some(t)
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    /// Number of live (not terminated) threads.
    pub fn live_count(&self) -> usize {
        self.threads.len()
    }

    /// Number of blocked threads.
    pub fn blocked_count(&self) -> usize {
        self.threads.values().filter(|t| t.state == ThreadState::Blocked).count()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frame() -> Frame {
        Frame::new(ModId(0), 0)
    }

    #[test]
    fn test_spawn() {
        let mut sched = Scheduler::new();
        let t1 = sched.spawn(ModId(0), 0, frame());
        let t2 = sched.spawn(ModId(0), 0, frame());

        assert_ne!(t1, t2);
        assert_eq!(sched.live_count(), 2);
    }

    #[test]
    fn test_round_robin() {
        let mut sched = Scheduler::new();
        let t1 = sched.spawn(ModId(0), 0, frame());
        let t2 = sched.spawn(ModId(0), 0, frame());

        let next = sched.schedule_next().unwrap();
        assert_eq!(next, t1);
        sched.requeue(next);

        let next = sched.schedule_next().unwrap();
        assert_eq!(next, t2);
        sched.requeue(next);

        assert_eq!(sched.schedule_next(), Some(t1));
    }

    #[test]
    fn test_blocked_threads_are_skipped() {
        let mut sched = Scheduler::new();
        let t1 = sched.spawn(ModId(0), 0, frame());
        let t2 = sched.spawn(ModId(0), 0, frame());

        sched.block(t1);
        assert_eq!(sched.schedule_next(), Some(t2));
        sched.requeue(t2);
        assert_eq!(sched.blocked_count(), 1);

        sched.wake(t1, 5);
        assert_eq!(sched.thread(t1).unwrap().pc, 5);
        assert!(sched.thread(t1).unwrap().is_runnable());
    }

    #[test]
    fn test_terminate_removes_thread() {
        let mut sched = Scheduler::new();
        let t1 = sched.spawn(ModId(0), 0, frame());

        let t = sched.terminate(t1).unwrap();
        assert!(t.is_terminated());
        assert_eq!(sched.live_count(), 0);
        assert_eq!(sched.schedule_next(), None);
    }
}
