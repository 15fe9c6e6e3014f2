//! Value and type layer: slot contents, type descriptors, decoded
//! instructions, and the runtime fault taxonomy.
//!
//! Every storage location the VM can address (frame slot, module data
//! slot, heap block element) holds a [`Value`]. Slots are dynamically
//! tagged; instructions check tags on access and fault on mismatch
//! rather than coercing silently.

use std::fmt;
use std::sync::Arc;

/// 8-bit unsigned scalar.
pub type Byte = u8;
/// 32-bit two's-complement scalar.
pub type Word = i32;
/// 64-bit two's-complement scalar.
pub type Big = i64;
/// 64-bit IEEE floating point scalar.
pub type Real = f64;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u64);

/// Handle to a reference-counted heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// Handle to a pending frame (built by `frame`/`mframe`, not yet called).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

/// Index of a loaded module instance within the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModId(pub usize);

/// Handle to a resolved linkage table (the module reference `load` yields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub usize);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operand size/type classes, as carried by typed instruction families
/// and channel element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Byte,
    Word,
    Big,
    Real,
    Pointer,
    String,
    Memory,
    MemoryPtrs,
}

impl ValueKind {
    /// Kinds whose channel transfer moves ownership instead of copying.
    pub fn moves_ownership(self) -> bool {
        matches!(
            self,
            ValueKind::Pointer | ValueKind::String | ValueKind::Memory | ValueKind::MemoryPtrs
        )
    }
}

/// A type descriptor: slot count plus the offsets of pointer-bearing
/// slots. Shapes frames, heap data blocks and `movmp` copies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeDesc {
    /// Total number of slots.
    pub slots: usize,
    /// Offsets of the pointer-bearing slots.
    pub ptrs: Vec<usize>,
}

impl TypeDesc {
    /// Descriptor with `slots` slots, none of them pointers.
    pub fn scalar(slots: usize) -> Self {
        TypeDesc { slots, ptrs: Vec::new() }
    }

    /// Descriptor with `slots` slots, pointers at the given offsets.
    pub fn with_ptrs(slots: usize, ptrs: Vec<usize>) -> Self {
        TypeDesc { slots, ptrs }
    }
}

/// Contents of one storage slot.
///
/// `Nil` doubles as the invalid handle `H`: it is the zero-initial
/// content of every slot and the result of a failed `load`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Byte(Byte),
    Word(Word),
    Big(Big),
    Real(Real),
    /// Heap string block.
    Str(HandleId),
    /// Heap data/array/list block.
    Ref(HandleId),
    /// Heap channel block.
    Chan(HandleId),
    /// Resolved linkage handle produced by `load`.
    Module(LinkId),
    /// Pending frame produced by `frame`/`mframe`.
    Frame(FrameId),
    /// First-class element address produced by `lea`/`indx`.
    Addr(Loc),
    /// Code address produced by `movpc`.
    Pc(usize),
}

impl Value {
    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Byte(_) => "byte",
            Value::Word(_) => "word",
            Value::Big(_) => "big",
            Value::Real(_) => "real",
            Value::Str(_) => "string",
            Value::Ref(_) => "ref",
            Value::Chan(_) => "channel",
            Value::Module(_) => "module",
            Value::Frame(_) => "frame",
            Value::Addr(_) => "addr",
            Value::Pc(_) => "pc",
        }
    }

    /// Heap handle owned by this value, if any. Ownership accounting
    /// (retain on copy, release on overwrite) applies exactly to these.
    pub fn heap_handle(&self) -> Option<HandleId> {
        match self {
            Value::Str(h) | Value::Ref(h) | Value::Chan(h) => Some(*h),
            _ => None,
        }
    }
}

/// `Nil` is the zero value of every slot.
impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

/// A resolved storage location. This is what operand resolution yields
/// for writable operands and the unit channel waiters park on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Loc {
    /// Slot in the top frame of a thread.
    Frame(Tid, usize),
    /// Slot in a module instance's data segment.
    Data(ModId, usize),
    /// Element of a heap data/array block.
    Elem(HandleId, usize),
}

/// A decoded operand: an addressing mode, resolved against the current
/// frame and module at execution time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Word literal.
    Imm(Word),
    /// Frame slot.
    Fp(usize),
    /// Module data slot.
    Mp(usize),
    /// Indirect: pointer or address held in a frame slot, plus offset.
    FpInd(usize, usize),
    /// Indirect: pointer or address held in a data slot, plus offset.
    MpInd(usize, usize),
}

/// Direction of one alternation candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltDir {
    Send,
    Recv,
}

/// One candidate of an `alt`/`nbalt` table: a channel operand paired
/// with a source (send) or destination (receive) operand. Send entries
/// come first in the table, matching the original layout.
#[derive(Debug, Clone)]
pub struct AltEntry {
    pub dir: AltDir,
    pub chan: Operand,
    pub val: Operand,
}

/// One arm of a `case` table: matches `lo <= v < hi`.
#[derive(Debug, Clone, Copy)]
pub struct CaseArm {
    pub lo: Word,
    pub hi: Word,
    pub target: usize,
}

/// The decoded instruction set.
///
/// One variant per operation of the source instruction set; typed
/// families (channel allocation, list cons/head) carry their
/// [`ValueKind`] as data, scalar arithmetic keeps per-type variants.
/// Jump and case tables are carried in the instruction as validated
/// tables with explicit range checks. `Runt` and `Eclr` are reserved
/// opcodes with no documented semantics and execute as no-ops.
///
/// Three-operand arithmetic follows the source convention
/// `op src, mid, dst`: `dst = mid OP src` (so `Subw` is `dst = mid - src`).
/// Branch comparisons are `b?? src, mid, target`: branch if `src REL mid`.
#[derive(Debug, Clone)]
pub enum Instruction {
    Nop,

    // === Communication ===
    /// Non-deterministic alternation; blocks when nothing is ready.
    Alt { entries: Arc<[AltEntry]>, dst: Operand },
    /// Alternation that jumps to `else_pc` instead of blocking.
    Nbalt { entries: Arc<[AltEntry]>, dst: Operand, else_pc: usize },
    /// Allocate a channel of the given element kind.
    Newc { kind: ValueKind, dst: Operand },
    /// Synchronous send; blocks until a receiver rendezvouses.
    Send { chan: Operand, src: Operand },
    /// Synchronous receive; blocks until a sender rendezvouses.
    Recv { chan: Operand, dst: Operand },

    // === Control ===
    /// Computed goto over a validated pc table.
    Goto { src: Operand, table: Arc<[usize]> },
    /// Same-module call through a frame built by `Frame`.
    Call { frame: Operand, target: usize },
    /// Allocate a frame shaped by descriptor `desc` of the current module.
    Frame { desc: usize, dst: Operand },
    /// Create a new thread running `target` with the given frame.
    Spawn { frame: Operand, target: usize },
    /// Reserved opcode; no-op.
    Runt,
    /// Load a module and resolve the linkage descriptor `desc` against it.
    Load { path: Operand, desc: usize, dst: Operand },
    /// Inter-module call through a linkage table entry.
    Mcall { frame: Operand, index: Operand, module: Operand },
    /// Inter-module spawn through a linkage table entry.
    Mspawn { frame: Operand, index: Operand, module: Operand },
    /// Allocate a frame for a linkage table entry of `module`.
    Mframe { module: Operand, index: Operand, dst: Operand },
    /// Return from the current frame; from the initial frame, exits.
    Ret,
    /// Unconditional branch.
    Jmp { target: usize },
    /// Range-match a word against a case table.
    Case { src: Operand, arms: Arc<[CaseArm]>, default: usize },
    /// Exact-match a string against a case table.
    Casec { src: Operand, arms: Arc<[(Arc<str>, usize)]>, default: usize },
    /// Terminate the calling thread.
    Exit,

    // === Allocation ===
    /// Allocate a data block shaped by descriptor `desc`.
    New { desc: usize, dst: Operand },
    /// Allocate a data block, zero-filled (identical here; see notes).
    Newz { desc: usize, dst: Operand },
    /// Allocate a data block shaped by a descriptor of another module.
    Mnewz { module: Operand, index: Operand, dst: Operand },
    /// Allocate an array of `len` elements.
    Newa { len: Operand, dst: Operand },
    /// Allocate an array, zero-filled (identical here; see notes).
    Newaz { len: Operand, dst: Operand },

    // === Lists ===
    /// Prepend `src` to the list in `dst`, storing the new cell in `dst`.
    Cons { kind: ValueKind, src: Operand, dst: Operand },
    /// Head of the list at `src`.
    Head { kind: ValueKind, src: Operand, dst: Operand },
    /// Tail of the list at `src`.
    Tail { src: Operand, dst: Operand },
    /// Length of the list at `src`.
    Lenl { src: Operand, dst: Operand },

    // === Addressing ===
    /// Load the address of `src`.
    Lea { src: Operand, dst: Operand },
    /// Address of array element: `dst = &src[idx]`.
    Indx { arr: Operand, idx: Operand, dst: Operand },
    Indb { arr: Operand, idx: Operand, dst: Operand },
    Indw { arr: Operand, idx: Operand, dst: Operand },
    Indf { arr: Operand, idx: Operand, dst: Operand },
    Indl { arr: Operand, idx: Operand, dst: Operand },

    // === Moves ===
    Movb { src: Operand, dst: Operand },
    Movw { src: Operand, dst: Operand },
    Movl { src: Operand, dst: Operand },
    Movf { src: Operand, dst: Operand },
    /// Move a pointer, retaining the reference for the destination.
    Movp { src: Operand, dst: Operand },
    /// Copy `len` scalar slots between block locations.
    Movm { src: Operand, dst: Operand, len: usize },
    /// Copy slots shaped by descriptor `desc`, updating reference counts.
    Movmp { src: Operand, dst: Operand, desc: usize },
    /// Store the code address `target` into `dst`.
    Movpc { target: usize, dst: Operand },

    // === Arithmetic: byte ===
    Addb { src: Operand, mid: Operand, dst: Operand },
    Subb { src: Operand, mid: Operand, dst: Operand },
    Mulb { src: Operand, mid: Operand, dst: Operand },
    Divb { src: Operand, mid: Operand, dst: Operand },
    Modb { src: Operand, mid: Operand, dst: Operand },
    Andb { src: Operand, mid: Operand, dst: Operand },
    Orb { src: Operand, mid: Operand, dst: Operand },
    Xorb { src: Operand, mid: Operand, dst: Operand },
    Shlb { src: Operand, mid: Operand, dst: Operand },
    Shrb { src: Operand, mid: Operand, dst: Operand },

    // === Arithmetic: word ===
    Addw { src: Operand, mid: Operand, dst: Operand },
    Subw { src: Operand, mid: Operand, dst: Operand },
    Mulw { src: Operand, mid: Operand, dst: Operand },
    Divw { src: Operand, mid: Operand, dst: Operand },
    Modw { src: Operand, mid: Operand, dst: Operand },
    Andw { src: Operand, mid: Operand, dst: Operand },
    Orw { src: Operand, mid: Operand, dst: Operand },
    Xorw { src: Operand, mid: Operand, dst: Operand },
    Shlw { src: Operand, mid: Operand, dst: Operand },
    Shrw { src: Operand, mid: Operand, dst: Operand },
    /// Logical (unsigned) shift right.
    Lsrw { src: Operand, mid: Operand, dst: Operand },

    // === Arithmetic: big ===
    Addl { src: Operand, mid: Operand, dst: Operand },
    Subl { src: Operand, mid: Operand, dst: Operand },
    Mull { src: Operand, mid: Operand, dst: Operand },
    Divl { src: Operand, mid: Operand, dst: Operand },
    Modl { src: Operand, mid: Operand, dst: Operand },
    Andl { src: Operand, mid: Operand, dst: Operand },
    Orl { src: Operand, mid: Operand, dst: Operand },
    Xorl { src: Operand, mid: Operand, dst: Operand },
    Shll { src: Operand, mid: Operand, dst: Operand },
    Shrl { src: Operand, mid: Operand, dst: Operand },
    Lsrl { src: Operand, mid: Operand, dst: Operand },

    // === Arithmetic: real ===
    Addf { src: Operand, mid: Operand, dst: Operand },
    Subf { src: Operand, mid: Operand, dst: Operand },
    Mulf { src: Operand, mid: Operand, dst: Operand },
    Divf { src: Operand, mid: Operand, dst: Operand },
    Negf { src: Operand, dst: Operand },

    // === Strings ===
    /// Concatenate: `dst = mid + src`.
    Addc { src: Operand, mid: Operand, dst: Operand },
    /// Character code at index: `dst = src[idx]`.
    Indc { src: Operand, idx: Operand, dst: Operand },
    /// Insert character `ch` into the string at `dst` at index `idx`.
    Insc { ch: Operand, idx: Operand, dst: Operand },
    /// Character count of the string at `src`.
    Lenc { src: Operand, dst: Operand },
    /// Replace the string at `dst` with `dst[start..end]`.
    Slicec { start: Operand, end: Operand, dst: Operand },

    // === Arrays ===
    /// Element count of the array at `src`.
    Lena { src: Operand, dst: Operand },
    /// Replace the array at `dst` with a copy of `dst[start..end]`.
    Slicea { start: Operand, end: Operand, dst: Operand },
    /// Store the elements of the array at `src` into `dst` from `idx`.
    Slicela { src: Operand, idx: Operand, dst: Operand },

    // === Branches: byte ===
    Beqb { src: Operand, mid: Operand, target: usize },
    Bneb { src: Operand, mid: Operand, target: usize },
    Bltb { src: Operand, mid: Operand, target: usize },
    Bleb { src: Operand, mid: Operand, target: usize },
    Bgtb { src: Operand, mid: Operand, target: usize },
    Bgeb { src: Operand, mid: Operand, target: usize },

    // === Branches: word ===
    Beqw { src: Operand, mid: Operand, target: usize },
    Bnew { src: Operand, mid: Operand, target: usize },
    Bltw { src: Operand, mid: Operand, target: usize },
    Blew { src: Operand, mid: Operand, target: usize },
    Bgtw { src: Operand, mid: Operand, target: usize },
    Bgew { src: Operand, mid: Operand, target: usize },

    // === Branches: big ===
    Beql { src: Operand, mid: Operand, target: usize },
    Bnel { src: Operand, mid: Operand, target: usize },
    Bltl { src: Operand, mid: Operand, target: usize },
    Blel { src: Operand, mid: Operand, target: usize },
    Bgtl { src: Operand, mid: Operand, target: usize },
    Bgel { src: Operand, mid: Operand, target: usize },

    // === Branches: real ===
    Beqf { src: Operand, mid: Operand, target: usize },
    Bnef { src: Operand, mid: Operand, target: usize },
    Bltf { src: Operand, mid: Operand, target: usize },
    Blef { src: Operand, mid: Operand, target: usize },
    Bgtf { src: Operand, mid: Operand, target: usize },
    Bgef { src: Operand, mid: Operand, target: usize },

    // === Branches: string ===
    Beqc { src: Operand, mid: Operand, target: usize },
    Bnec { src: Operand, mid: Operand, target: usize },
    Bltc { src: Operand, mid: Operand, target: usize },
    Blec { src: Operand, mid: Operand, target: usize },
    Bgtc { src: Operand, mid: Operand, target: usize },
    Bgec { src: Operand, mid: Operand, target: usize },

    // === Conversions ===
    Cvtbw { src: Operand, dst: Operand },
    Cvtwb { src: Operand, dst: Operand },
    Cvtfw { src: Operand, dst: Operand },
    Cvtwf { src: Operand, dst: Operand },
    Cvtlf { src: Operand, dst: Operand },
    Cvtfl { src: Operand, dst: Operand },
    Cvtlw { src: Operand, dst: Operand },
    Cvtwl { src: Operand, dst: Operand },
    /// String to byte array.
    Cvtca { src: Operand, dst: Operand },
    /// Byte array to string.
    Cvtac { src: Operand, dst: Operand },
    Cvtwc { src: Operand, dst: Operand },
    Cvtcw { src: Operand, dst: Operand },
    Cvtfc { src: Operand, dst: Operand },
    Cvtcf { src: Operand, dst: Operand },
    Cvtlc { src: Operand, dst: Operand },
    Cvtcl { src: Operand, dst: Operand },
    /// Short real (f32) to real.
    Cvtrf { src: Operand, dst: Operand },
    /// Real to short real (f32).
    Cvtfr { src: Operand, dst: Operand },
    /// Word to short word (i16, sign-extended back into a word).
    Cvtws { src: Operand, dst: Operand },
    /// Short word to word.
    Cvtsw { src: Operand, dst: Operand },

    // === Misc ===
    /// Runtime type compare; faults unless `src` is nil or the block
    /// shapes match.
    Tcmp { src: Operand, dst: Operand },
    /// Reserved opcode; no-op.
    Eclr,
}

/// A runtime fault. Faults are local to the issuing thread: the thread
/// is terminated and a diagnostic surfaced; other threads continue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("linkage index {index} out of range (table has {len} entries)")]
    LinkIndex { index: i64, len: usize },

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    #[error("operand is not addressable")]
    BadOperand,

    #[error("index {index} out of bounds (length {len})")]
    OutOfBounds { index: i64, len: usize },

    #[error("nil dereference")]
    NilDeref,

    #[error("divide by zero")]
    DivideByZero,

    #[error("frame already consumed")]
    FrameConsumed,

    #[error("heap exhausted (quota {quota} blocks)")]
    HeapExhausted { quota: usize },

    #[error("jump target {target} out of range")]
    JumpOutOfRange { target: usize },

    #[error("program counter {pc} out of range")]
    PcOutOfRange { pc: usize },

    #[error("dangling heap handle")]
    DanglingHandle,
}

/// A module load failure. Reported to bytecode as a nil handle in the
/// `load` destination, never as a thread fault.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("invalid module image: {0}")]
    BadImage(String),

    #[error("unresolved import {name} (sig {sig:#010x})")]
    Unresolved { name: String, sig: u32 },
}

impl Fault {
    /// Fault for a value whose tag does not match the expected kind.
    pub fn expected(expected: &'static str, found: &Value) -> Fault {
        Fault::TypeMismatch { expected, found: found.type_name() }
    }
}
