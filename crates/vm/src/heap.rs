//! Reference-counted heap arena.
//!
//! The allocator collaborator of the execution core: typed blocks are
//! allocated zero-initialized (every slot starts as `Nil`) and carry an
//! explicit ownership count. Every pointer-bearing slot in a frame,
//! data segment or block owns exactly one reference; instruction
//! execution funnels all count updates through [`Heap::retain_value`]
//! and [`Heap::release_value`] so no opcode does its own bookkeeping.
//!
//! Channels live on the heap too: a channel exists as long as any
//! thread, frame or alt table still references it.

use std::collections::HashMap;

use crate::channel::Channel;
use crate::value::{Fault, HandleId, TypeDesc, Value, ValueKind};

/// One heap block.
#[derive(Debug)]
pub enum Block {
    /// Type-described record storage.
    Data { desc: TypeDesc, slots: Vec<Value> },
    /// Array storage.
    Array { items: Vec<Value> },
    /// Immutable-by-convention string storage (replaced wholesale by
    /// string instructions).
    Str(String),
    /// One list cell.
    ListCell { kind: ValueKind, head: Value, tail: Value },
    /// A rendezvous channel.
    Chan(Channel),
}

struct Cell {
    refs: usize,
    block: Block,
}

/// The heap: a counted arena of blocks addressed by [`HandleId`].
pub struct Heap {
    cells: HashMap<u64, Cell>,
    next: u64,
    quota: usize,
}

impl Heap {
    /// Heap with the given block quota. Exceeding the quota is the
    /// allocator-exhaustion fault, fatal to the requesting thread.
    pub fn with_quota(quota: usize) -> Self {
        Heap { cells: HashMap::new(), next: 1, quota }
    }

    fn insert(&mut self, block: Block) -> Result<HandleId, Fault> {
        if self.cells.len() >= self.quota {
            return Err(Fault::HeapExhausted { quota: self.quota });
        }
        let id = HandleId(self.next);
        self.next += 1;
        self.cells.insert(id.0, Cell { refs: 1, block });
        Ok(id)
    }

    /// Allocate a zero-initialized data block shaped by `desc`.
    pub fn alloc_data(&mut self, desc: TypeDesc) -> Result<HandleId, Fault> {
        let slots = vec![Value::Nil; desc.slots];
        self.insert(Block::Data { desc, slots })
    }

    /// Allocate a zero-initialized array of `len` elements.
    pub fn alloc_array(&mut self, len: usize) -> Result<HandleId, Fault> {
        self.insert(Block::Array { items: vec![Value::Nil; len] })
    }

    /// Allocate an array from prepared elements. The caller accounts
    /// for the references the elements carry.
    pub fn alloc_array_from(&mut self, items: Vec<Value>) -> Result<HandleId, Fault> {
        self.insert(Block::Array { items })
    }

    /// Allocate a string block.
    pub fn alloc_str(&mut self, s: String) -> Result<HandleId, Fault> {
        self.insert(Block::Str(s))
    }

    /// Allocate a list cell. Takes ownership of the references in
    /// `head` and `tail`.
    pub fn alloc_cell(&mut self, kind: ValueKind, head: Value, tail: Value) -> Result<HandleId, Fault> {
        self.insert(Block::ListCell { kind, head, tail })
    }

    /// Allocate a channel of the given element kind.
    pub fn alloc_chan(&mut self, kind: ValueKind) -> Result<HandleId, Fault> {
        self.insert(Block::Chan(Channel::new(kind)))
    }

    /// Increment the ownership count of `h`.
    pub fn retain(&mut self, h: HandleId) {
        if let Some(cell) = self.cells.get_mut(&h.0) {
            cell.refs += 1;
        } else {
            debug_assert!(false, "retain of dangling handle {:?}", h);
        }
    }

    /// Decrement the ownership count of `h`, freeing the block and
    /// releasing its interior references when the count reaches zero.
    pub fn release(&mut self, h: HandleId) {
        let mut work = vec![h];
        while let Some(h) = work.pop() {
            let Some(cell) = self.cells.get_mut(&h.0) else {
                debug_assert!(false, "release of dangling handle {:?}", h);
                continue;
            };
            cell.refs -= 1;
            if cell.refs > 0 {
                continue;
            }
            let Some(cell) = self.cells.remove(&h.0) else { continue };
            match cell.block {
                Block::Data { slots, .. } => {
                    work.extend(slots.iter().filter_map(Value::heap_handle));
                }
                Block::Array { items } => {
                    work.extend(items.iter().filter_map(Value::heap_handle));
                }
                Block::ListCell { head, tail, .. } => {
                    work.extend(head.heap_handle());
                    work.extend(tail.heap_handle());
                }
                Block::Str(_) => {}
                // Parked waiters do not own values; nothing to cascade.
                Block::Chan(_) => {}
            }
        }
    }

    /// Retain the reference owned by `v`, if it bears one.
    pub fn retain_value(&mut self, v: &Value) {
        if let Some(h) = v.heap_handle() {
            self.retain(h);
        }
    }

    /// Release the reference owned by `v`, if it bears one.
    pub fn release_value(&mut self, v: &Value) {
        if let Some(h) = v.heap_handle() {
            self.release(h);
        }
    }

    /// Borrow a block.
    pub fn get(&self, h: HandleId) -> Result<&Block, Fault> {
        self.cells.get(&h.0).map(|c| &c.block).ok_or(Fault::DanglingHandle)
    }

    /// Borrow a block mutably.
    pub fn get_mut(&mut self, h: HandleId) -> Result<&mut Block, Fault> {
        self.cells.get_mut(&h.0).map(|c| &mut c.block).ok_or(Fault::DanglingHandle)
    }

    /// Current ownership count of `h` (testing/diagnostics).
    pub fn refcount(&self, h: HandleId) -> Option<usize> {
        self.cells.get(&h.0).map(|c| c.refs)
    }

    /// Number of live blocks (testing/diagnostics).
    pub fn live(&self) -> usize {
        self.cells.len()
    }

    /// Read an element of a data or array block.
    pub fn slot(&self, h: HandleId, idx: usize) -> Result<&Value, Fault> {
        let slots = self.block_slots(h)?;
        slots.get(idx).ok_or(Fault::OutOfBounds { index: idx as i64, len: slots.len() })
    }

    /// Replace an element of a data or array block, returning the old
    /// value so the caller can release it.
    pub fn slot_replace(&mut self, h: HandleId, idx: usize, v: Value) -> Result<Value, Fault> {
        let slots = self.block_slots_mut(h)?;
        let len = slots.len();
        let slot = slots.get_mut(idx).ok_or(Fault::OutOfBounds { index: idx as i64, len })?;
        Ok(std::mem::replace(slot, v))
    }

    fn block_slots(&self, h: HandleId) -> Result<&[Value], Fault> {
        match self.get(h)? {
            Block::Data { slots, .. } => Ok(slots),
            Block::Array { items } => Ok(items),
            b => Err(Fault::TypeMismatch { expected: "data or array block", found: block_name(b) }),
        }
    }

    fn block_slots_mut(&mut self, h: HandleId) -> Result<&mut Vec<Value>, Fault> {
        match self.get_mut(h)? {
            Block::Data { slots, .. } => Ok(slots),
            Block::Array { items } => Ok(items),
            b => Err(Fault::TypeMismatch { expected: "data or array block", found: block_name(b) }),
        }
    }

    /// Borrow a string block.
    pub fn str(&self, h: HandleId) -> Result<&str, Fault> {
        match self.get(h)? {
            Block::Str(s) => Ok(s),
            b => Err(Fault::TypeMismatch { expected: "string block", found: block_name(b) }),
        }
    }

    /// Replace the contents of a string block.
    pub fn str_set(&mut self, h: HandleId, s: String) -> Result<(), Fault> {
        match self.get_mut(h)? {
            Block::Str(slot) => {
                *slot = s;
                Ok(())
            }
            b => Err(Fault::TypeMismatch { expected: "string block", found: block_name(b) }),
        }
    }

    /// Borrow a channel block.
    pub fn chan(&self, h: HandleId) -> Result<&Channel, Fault> {
        match self.get(h)? {
            Block::Chan(c) => Ok(c),
            b => Err(Fault::TypeMismatch { expected: "channel block", found: block_name(b) }),
        }
    }

    /// Borrow a channel block mutably.
    pub fn chan_mut(&mut self, h: HandleId) -> Result<&mut Channel, Fault> {
        match self.get_mut(h)? {
            Block::Chan(c) => Ok(c),
            b => Err(Fault::TypeMismatch { expected: "channel block", found: block_name(b) }),
        }
    }

    /// Borrow a list cell.
    pub fn list_cell(&self, h: HandleId) -> Result<(&Value, &Value), Fault> {
        match self.get(h)? {
            Block::ListCell { head, tail, .. } => Ok((head, tail)),
            b => Err(Fault::TypeMismatch { expected: "list cell", found: block_name(b) }),
        }
    }

    /// Array length.
    pub fn array_len(&self, h: HandleId) -> Result<usize, Fault> {
        match self.get(h)? {
            Block::Array { items } => Ok(items.len()),
            b => Err(Fault::TypeMismatch { expected: "array block", found: block_name(b) }),
        }
    }

    /// Descriptor of a data block (for runtime type compare).
    pub fn data_desc(&self, h: HandleId) -> Result<&TypeDesc, Fault> {
        match self.get(h)? {
            Block::Data { desc, .. } => Ok(desc),
            b => Err(Fault::TypeMismatch { expected: "data block", found: block_name(b) }),
        }
    }
}

fn block_name(b: &Block) -> &'static str {
    match b {
        Block::Data { .. } => "data block",
        Block::Array { .. } => "array block",
        Block::Str(_) => "string block",
        Block::ListCell { .. } => "list cell",
        Block::Chan(_) => "channel block",
    }
}
