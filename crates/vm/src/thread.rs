//! Execution contexts.
//!
//! A thread owns a program counter, a module register for relative
//! addressing, and a stack of frames. Threads never share frames: the
//! only handoff is the initial frame passed by `spawn`/`mspawn`, which
//! moves into the new thread before it becomes runnable.

use crate::frame::Frame;
use crate::value::{Fault, HandleId, ModId, Tid};

/// Scheduling state of a thread.
///
/// A thread never re-enters `Runnable` from `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Ready to be dispatched.
    Runnable,
    /// Parked on a channel (send, receive or alternation).
    Blocked,
    /// Exited, faulted, or returned from its initial frame.
    Terminated,
}

/// One execution context.
#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    /// Program counter, an index into the current module's code.
    pub pc: usize,
    /// Module register: the module whose code and data the thread is
    /// currently addressing.
    pub module: ModId,
    /// Activation stack; the last element is the current frame.
    pub stack: Vec<Frame>,
    pub state: ThreadState,
    /// Channels holding this thread's alt waiters while it is blocked
    /// in an alternation; cleared when one entry commits.
    pub alt_channels: Vec<HandleId>,
}

impl Thread {
    pub fn new(tid: Tid, module: ModId, pc: usize, initial: Frame) -> Self {
        Thread {
            tid,
            pc,
            module,
            stack: vec![initial],
            state: ThreadState::Runnable,
            alt_channels: Vec::new(),
        }
    }

    /// Current frame.
    pub fn frame(&self) -> Result<&Frame, Fault> {
        self.stack.last().ok_or(Fault::NilDeref)
    }

    /// Current frame, mutable.
    pub fn frame_mut(&mut self) -> Result<&mut Frame, Fault> {
        self.stack.last_mut().ok_or(Fault::NilDeref)
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Runnable
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ThreadState::Terminated
    }
}
