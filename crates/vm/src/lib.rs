//! Weft Virtual Machine
//!
//! A concurrent bytecode VM built around:
//! - Cooperative threads interleaved at instruction granularity
//! - Synchronous (rendezvous) typed channels with `alt`/`nbalt`
//! - Heap-allocated call frames consumed exactly once
//! - Dynamic module loading with signature-checked linkage tables
//! - Reference-counted heap blocks with thread-local faults

pub mod channel;
pub mod frame;
pub mod heap;
pub mod module;
pub mod scheduler;
pub mod thread;
pub mod value;
pub mod vm;

pub use channel::*;
pub use frame::*;
pub use heap::*;
pub use module::*;
pub use scheduler::*;
pub use thread::*;
pub use value::*;
pub use vm::{LoadedModule, RunStats, Vm, VmConfig};
