//! Call frames and the pending-frame arena.
//!
//! `frame`/`mframe` allocate a frame and hand its id to bytecode as a
//! [`Value::Frame`]; `call`/`mcall`/`spawn`/`mspawn` consume it exactly
//! once, moving it onto a thread's activation stack. Consuming a frame
//! twice is a fault, not undefined behavior.

use std::collections::HashMap;

use crate::value::{Fault, FrameId, ModId, Value};

/// One activation record.
///
/// `ret_pc`/`ret_module` are the saved link: `None` marks a thread's
/// initial frame, and returning from it terminates the thread.
#[derive(Debug)]
pub struct Frame {
    /// Saved return program counter.
    pub ret_pc: Option<usize>,
    /// Saved caller module (restored with `ret_pc` on return).
    pub ret_module: Option<ModId>,
    /// Module whose code the activation executes. Set at allocation
    /// time: the allocating thread's module for `frame`, the linkage
    /// entry's module for `mframe`.
    pub module: ModId,
    /// Local storage, zero-initialized.
    pub slots: Vec<Value>,
}

impl Frame {
    pub fn new(module: ModId, slots: usize) -> Self {
        Frame {
            ret_pc: None,
            ret_module: None,
            module,
            slots: vec![Value::Nil; slots],
        }
    }
}

/// Arena of frames built but not yet consumed by a call or spawn.
#[derive(Debug, Default)]
pub struct FrameTable {
    pending: HashMap<u64, Frame>,
    next: u64,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable { pending: HashMap::new(), next: 1 }
    }

    /// Register a freshly allocated frame, returning its handle.
    pub fn insert(&mut self, frame: Frame) -> FrameId {
        let id = FrameId(self.next);
        self.next += 1;
        self.pending.insert(id.0, frame);
        id
    }

    /// Consume a pending frame. Fails if it was already consumed.
    pub fn take(&mut self, id: FrameId) -> Result<Frame, Fault> {
        self.pending.remove(&id.0).ok_or(Fault::FrameConsumed)
    }

    /// Drop a pending frame without consuming it (its handle was
    /// overwritten or its owner released it), returning the frame so
    /// the caller can release its slot references.
    pub fn discard(&mut self, id: FrameId) -> Option<Frame> {
        self.pending.remove(&id.0)
    }

    /// Number of unconsumed frames (diagnostics).
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
