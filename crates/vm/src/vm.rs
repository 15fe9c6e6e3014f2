//! The virtual machine: dispatch loop, operand resolution, and the
//! semantics of every instruction.
//!
//! One [`Vm`] owns a scheduler, a heap, the pending-frame arena, the
//! loaded module instances and their linkage tables. The dispatch loop
//! interleaves threads at instruction granularity: fetch, advance the
//! program counter, execute, requeue. A fault terminates the issuing
//! thread and is surfaced as a diagnostic; every other thread keeps
//! running. When the run queue drains with threads still blocked, the
//! remaining threads are deadlocked; that is a quiescent outcome, not
//! an error.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::channel::{AltCtx, Payload, Waiter};
use crate::frame::{Frame, FrameTable};
use crate::heap::Heap;
use crate::module::{resolve_linkage, DataInit, ImageRegistry, Import, Linkage, ModuleImage, ModuleSource};
use crate::scheduler::Scheduler;
use crate::value::{
    AltDir, AltEntry, Big, Byte, Fault, HandleId, Instruction, LinkId, LoadError, Loc, ModId,
    Operand, Real, Tid, TypeDesc, Value, Word,
};

/// Tunables of a VM instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum number of live heap blocks.
    pub heap_quota: usize,
    /// Seed for the alternation choice; random when unset.
    pub alt_seed: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { heap_quota: 1 << 16, alt_seed: None }
    }
}

/// Outcome of a [`Vm::run`] to quiescence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Instructions dispatched.
    pub steps: u64,
    /// Threads left blocked with no runnable partner.
    pub deadlocked: usize,
}

/// A module instance: the shared immutable image plus this VM's own
/// mutable data segment.
pub struct LoadedModule {
    pub image: Arc<ModuleImage>,
    pub data: Vec<Value>,
}

/// The execution core.
pub struct Vm {
    sched: Scheduler,
    heap: Heap,
    frames: FrameTable,
    modules: Vec<LoadedModule>,
    links: Vec<Linkage>,
    /// Path -> instance, so repeated loads share one data segment.
    instances: HashMap<String, ModId>,
    registry: Arc<ImageRegistry>,
    source: Box<dyn ModuleSource>,
    rng: StdRng,
}

impl Vm {
    pub fn new<S: ModuleSource + 'static>(source: S) -> Self {
        Self::with_config(source, VmConfig::default())
    }

    pub fn with_config<S: ModuleSource + 'static>(source: S, config: VmConfig) -> Self {
        let rng = match config.alt_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Vm {
            sched: Scheduler::new(),
            heap: Heap::with_quota(config.heap_quota),
            frames: FrameTable::new(),
            modules: Vec::new(),
            links: Vec::new(),
            instances: HashMap::new(),
            registry: Arc::new(ImageRegistry::new()),
            source: Box::new(source),
            rng,
        }
    }

    /// Share a registry of parsed images across VM instances.
    pub fn with_registry(mut self, registry: Arc<ImageRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Instantiate `path` and start a thread at its entry point.
    pub fn boot(&mut self, path: &str) -> Result<Tid, LoadError> {
        let mid = self.instantiate(path)?;
        let image = self.modules[mid.0].image.clone();
        let entry = image
            .entry
            .ok_or_else(|| LoadError::BadImage(format!("{path} has no entry point")))?;
        let desc = image
            .descs
            .get(entry.frame_desc)
            .ok_or_else(|| LoadError::BadImage(format!("{path}: bad entry frame descriptor")))?;
        if entry.pc >= image.code.len() {
            return Err(LoadError::BadImage(format!("{path}: entry pc outside code")));
        }
        let frame = Frame::new(mid, desc.slots);
        Ok(self.sched.spawn(mid, entry.pc, frame))
    }

    /// Run until no thread is runnable.
    pub fn run(&mut self) -> RunStats {
        let mut steps = 0u64;
        while let Some(tid) = self.sched.schedule_next() {
            steps += 1;
            match self.step(tid) {
                Ok(()) => self.sched.requeue(tid),
                Err(fault) => {
                    warn!(%tid, %fault, "thread faulted");
                    self.terminate_thread(tid);
                }
            }
        }
        let deadlocked = self.sched.blocked_count();
        if deadlocked > 0 {
            warn!(deadlocked, "run queue drained with blocked threads");
        }
        RunStats { steps, deadlocked }
    }

    /// Fetch, advance pc, execute one instruction of `tid`.
    fn step(&mut self, tid: Tid) -> Result<(), Fault> {
        let (module, pc) = {
            let t = self.sched.thread(tid).ok_or(Fault::DanglingHandle)?;
            (t.module, t.pc)
        };
        let code = self.modules.get(module.0).ok_or(Fault::DanglingHandle)?.image.code.clone();
        let instr = code.get(pc).ok_or(Fault::PcOutOfRange { pc })?;
        if let Some(t) = self.sched.thread_mut(tid) {
            t.pc = pc + 1;
        }
        self.exec(tid, instr)
    }

    fn exec(&mut self, tid: Tid, instr: &Instruction) -> Result<(), Fault> {
        match instr {
            Instruction::Nop | Instruction::Runt | Instruction::Eclr => Ok(()),

            // === Communication ===
            Instruction::Newc { kind, dst } => {
                let h = self.heap.alloc_chan(*kind)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Chan(h))
            }
            Instruction::Send { chan, src } => {
                let ch = self.read_chan(tid, *chan)?;
                let (kind, ready) = {
                    let c = self.heap.chan(ch)?;
                    (c.kind, c.receiver_ready(tid))
                };
                if ready {
                    // Validate our side fully before touching the
                    // receiver's registration.
                    let payload = self.send_payload(tid, kind, *src)?;
                    let value = self.transfer_out(kind, payload)?;
                    self.rendezvous_send(ch, tid, value)
                } else {
                    let payload = self.send_payload(tid, kind, *src)?;
                    let resume_pc = self.pc_of(tid)?;
                    self.heap
                        .chan_mut(ch)?
                        .park_sender(Waiter { tid, payload, resume_pc, alt: None });
                    self.sched.block(tid);
                    Ok(())
                }
            }
            Instruction::Recv { chan, dst } => {
                let ch = self.read_chan(tid, *chan)?;
                let (kind, ready) = {
                    let c = self.heap.chan(ch)?;
                    (c.kind, c.sender_ready(tid))
                };
                if ready {
                    self.rendezvous_recv(ch, tid, kind, *dst)
                } else {
                    let payload = Payload::Loc(self.loc(tid, *dst)?);
                    let resume_pc = self.pc_of(tid)?;
                    self.heap
                        .chan_mut(ch)?
                        .park_receiver(Waiter { tid, payload, resume_pc, alt: None });
                    self.sched.block(tid);
                    Ok(())
                }
            }
            Instruction::Alt { entries, dst } => self.do_alt(tid, entries, *dst, None),
            Instruction::Nbalt { entries, dst, else_pc } => {
                self.do_alt(tid, entries, *dst, Some(*else_pc))
            }

            // === Control ===
            Instruction::Jmp { target } => self.jump(tid, *target),
            Instruction::Goto { src, table } => {
                let w = self.read_word(tid, *src)?;
                if w < 0 || w as usize >= table.len() {
                    return Err(Fault::OutOfBounds { index: w as i64, len: table.len() });
                }
                self.jump(tid, table[w as usize])
            }
            Instruction::Case { src, arms, default } => {
                let v = self.read_word(tid, *src)?;
                let target = arms
                    .iter()
                    .find(|a| a.lo <= v && v < a.hi)
                    .map_or(*default, |a| a.target);
                self.jump(tid, target)
            }
            Instruction::Casec { src, arms, default } => {
                let s = self.read_str(tid, *src)?;
                let target = arms
                    .iter()
                    .find(|(pat, _)| pat.as_ref() == s)
                    .map_or(*default, |(_, t)| *t);
                self.jump(tid, target)
            }
            Instruction::Frame { desc, dst } => {
                let module = self.module_of(tid)?;
                let td = self.desc(module, *desc)?;
                let id = self.frames.insert(Frame::new(module, td.slots));
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Frame(id))
            }
            Instruction::Call { frame, target } => {
                let mut fr = self.consume_frame(tid, *frame)?;
                self.check_target(fr.module, *target)?;
                let t = self.sched.thread_mut(tid).ok_or(Fault::DanglingHandle)?;
                fr.ret_pc = Some(t.pc);
                fr.ret_module = Some(t.module);
                t.module = fr.module;
                t.pc = *target;
                t.stack.push(fr);
                Ok(())
            }
            Instruction::Spawn { frame, target } => {
                let fr = self.consume_frame(tid, *frame)?;
                self.check_target(fr.module, *target)?;
                let module = fr.module;
                self.sched.spawn(module, *target, fr);
                Ok(())
            }
            Instruction::Ret => self.do_ret(tid),
            Instruction::Exit => {
                self.terminate_thread(tid);
                Ok(())
            }
            Instruction::Load { path, desc, dst } => self.do_load(tid, *path, *desc, *dst),
            Instruction::Mframe { module, index, dst } => {
                let entry = self.link_entry(tid, *module, *index)?;
                let td = self.desc(entry.module, entry.frame_desc)?;
                let id = self.frames.insert(Frame::new(entry.module, td.slots));
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Frame(id))
            }
            Instruction::Mcall { frame, index, module } => {
                let entry = self.link_entry(tid, *module, *index)?;
                let mut fr = self.consume_frame(tid, *frame)?;
                let t = self.sched.thread_mut(tid).ok_or(Fault::DanglingHandle)?;
                fr.ret_pc = Some(t.pc);
                fr.ret_module = Some(t.module);
                t.module = entry.module;
                t.pc = entry.pc;
                t.stack.push(fr);
                Ok(())
            }
            Instruction::Mspawn { frame, index, module } => {
                let entry = self.link_entry(tid, *module, *index)?;
                let fr = self.consume_frame(tid, *frame)?;
                self.sched.spawn(entry.module, entry.pc, fr);
                Ok(())
            }

            // === Allocation ===
            Instruction::New { desc, dst } | Instruction::Newz { desc, dst } => {
                let module = self.module_of(tid)?;
                let td = self.desc(module, *desc)?;
                let h = self.heap.alloc_data(td)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Ref(h))
            }
            Instruction::Mnewz { module, index, dst } => {
                let lv = self.read(tid, *module)?;
                let link = self.linkage(&lv)?;
                let target = link.module;
                let w = self.read_word(tid, *index)?;
                if w < 0 {
                    return Err(Fault::OutOfBounds { index: w as i64, len: 0 });
                }
                let td = self.desc(target, w as usize)?;
                let h = self.heap.alloc_data(td)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Ref(h))
            }
            Instruction::Newa { len, dst } | Instruction::Newaz { len, dst } => {
                let n = self.read_word(tid, *len)?;
                if n < 0 {
                    return Err(Fault::OutOfBounds { index: n as i64, len: 0 });
                }
                let h = self.heap.alloc_array(n as usize)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Ref(h))
            }

            // === Lists ===
            Instruction::Cons { kind, src, dst } => {
                let head = self.read(tid, *src)?;
                self.check_kind(*kind, &head)?;
                let dst_loc = self.loc(tid, *dst)?;
                let tail = self.read_loc(dst_loc)?;
                if !matches!(tail, Value::Nil | Value::Ref(_)) {
                    return Err(Fault::expected("list", &tail));
                }
                self.heap.retain_value(&head);
                // The cell takes over the list reference held in dst.
                let tail = self.take_at(dst_loc)?;
                match self.heap.alloc_cell(*kind, head.clone(), tail.clone()) {
                    Ok(cell) => self.write(dst_loc, Value::Ref(cell)),
                    Err(fault) => {
                        self.heap.release_value(&head);
                        self.write(dst_loc, tail)?;
                        Err(fault)
                    }
                }
            }
            Instruction::Head { kind, src, dst } => {
                let h = self.read_list(tid, *src)?;
                let (head, _) = self.heap.list_cell(h)?;
                let head = head.clone();
                self.check_kind(*kind, &head)?;
                self.heap.retain_value(&head);
                let loc = self.loc(tid, *dst)?;
                self.write(loc, head)
            }
            Instruction::Tail { src, dst } => {
                let h = self.read_list(tid, *src)?;
                let (_, tail) = self.heap.list_cell(h)?;
                let tail = tail.clone();
                self.heap.retain_value(&tail);
                let loc = self.loc(tid, *dst)?;
                self.write(loc, tail)
            }
            Instruction::Lenl { src, dst } => {
                let mut v = self.read(tid, *src)?;
                let mut n: Word = 0;
                while let Value::Ref(h) = v {
                    let (_, tail) = self.heap.list_cell(h)?;
                    v = tail.clone();
                    n += 1;
                }
                if v != Value::Nil {
                    return Err(Fault::expected("list", &v));
                }
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(n))
            }

            // === Addressing ===
            Instruction::Lea { src, dst } => {
                let addr = self.loc(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Addr(addr))
            }
            Instruction::Indx { arr, idx, dst }
            | Instruction::Indb { arr, idx, dst }
            | Instruction::Indw { arr, idx, dst }
            | Instruction::Indf { arr, idx, dst }
            | Instruction::Indl { arr, idx, dst } => {
                let h = self.read_array(tid, *arr)?;
                let w = self.read_word(tid, *idx)?;
                let len = self.heap.array_len(h)?;
                let i = array_index(w, len)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Addr(Loc::Elem(h, i)))
            }

            // === Moves ===
            Instruction::Movb { src, dst } => {
                let b = self.read_byte(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Byte(b))
            }
            Instruction::Movw { src, dst } => {
                let w = self.read_word(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(w))
            }
            Instruction::Movl { src, dst } => {
                let b = self.read_big(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Big(b))
            }
            Instruction::Movf { src, dst } => {
                let r = self.read_real(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Real(r))
            }
            Instruction::Movp { src, dst } => {
                let v = self.read(tid, *src)?;
                if !matches!(
                    v,
                    Value::Nil | Value::Ref(_) | Value::Str(_) | Value::Chan(_) | Value::Module(_)
                ) {
                    return Err(Fault::expected("pointer", &v));
                }
                self.heap.retain_value(&v);
                let loc = self.loc(tid, *dst)?;
                self.write(loc, v)
            }
            Instruction::Movm { src, dst, len } => {
                let s = self.loc(tid, *src)?;
                let d = self.loc(tid, *dst)?;
                for i in 0..*len {
                    let v = self.read_loc(offset(s, i))?;
                    if v.heap_handle().is_some() {
                        return Err(Fault::expected("scalar slot", &v));
                    }
                    self.write(offset(d, i), v)?;
                }
                Ok(())
            }
            Instruction::Movmp { src, dst, desc } => {
                let module = self.module_of(tid)?;
                let td = self.desc(module, *desc)?;
                let s = self.loc(tid, *src)?;
                let d = self.loc(tid, *dst)?;
                for i in 0..td.slots {
                    let v = self.read_loc(offset(s, i))?;
                    self.heap.retain_value(&v);
                    self.write(offset(d, i), v)?;
                }
                Ok(())
            }
            Instruction::Movpc { target, dst } => {
                self.check_target(self.module_of(tid)?, *target)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Pc(*target))
            }

            // === Arithmetic: byte ===
            Instruction::Addb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_add(s))),
            Instruction::Subb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_sub(s))),
            Instruction::Mulb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_mul(s))),
            Instruction::Divb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| {
                if s == 0 { Err(Fault::DivideByZero) } else { Ok(m / s) }
            }),
            Instruction::Modb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| {
                if s == 0 { Err(Fault::DivideByZero) } else { Ok(m % s) }
            }),
            Instruction::Andb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m & s)),
            Instruction::Orb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m | s)),
            Instruction::Xorb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m ^ s)),
            Instruction::Shlb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_shl(s as u32))),
            Instruction::Shrb { src, mid, dst } => self.byte_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_shr(s as u32))),

            // === Arithmetic: word ===
            Instruction::Addw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_add(s))),
            Instruction::Subw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_sub(s))),
            Instruction::Mulw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_mul(s))),
            Instruction::Divw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| {
                if s == 0 { Err(Fault::DivideByZero) } else { Ok(m.wrapping_div(s)) }
            }),
            Instruction::Modw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| {
                if s == 0 { Err(Fault::DivideByZero) } else { Ok(m.wrapping_rem(s)) }
            }),
            Instruction::Andw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m & s)),
            Instruction::Orw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m | s)),
            Instruction::Xorw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m ^ s)),
            Instruction::Shlw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_shl(s as u32))),
            Instruction::Shrw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_shr(s as u32))),
            Instruction::Lsrw { src, mid, dst } => self.word_op(tid, *src, *mid, *dst, |s, m| {
                Ok((m as u32).wrapping_shr(s as u32) as Word)
            }),

            // === Arithmetic: big ===
            Instruction::Addl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_add(s))),
            Instruction::Subl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_sub(s))),
            Instruction::Mull { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_mul(s))),
            Instruction::Divl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| {
                if s == 0 { Err(Fault::DivideByZero) } else { Ok(m.wrapping_div(s)) }
            }),
            Instruction::Modl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| {
                if s == 0 { Err(Fault::DivideByZero) } else { Ok(m.wrapping_rem(s)) }
            }),
            Instruction::Andl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m & s)),
            Instruction::Orl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m | s)),
            Instruction::Xorl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m ^ s)),
            Instruction::Shll { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_shl(s as u32))),
            Instruction::Shrl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| Ok(m.wrapping_shr(s as u32))),
            Instruction::Lsrl { src, mid, dst } => self.big_op(tid, *src, *mid, *dst, |s, m| {
                Ok((m as u64).wrapping_shr(s as u32) as Big)
            }),

            // === Arithmetic: real ===
            Instruction::Addf { src, mid, dst } => self.real_op(tid, *src, *mid, *dst, |s, m| m + s),
            Instruction::Subf { src, mid, dst } => self.real_op(tid, *src, *mid, *dst, |s, m| m - s),
            Instruction::Mulf { src, mid, dst } => self.real_op(tid, *src, *mid, *dst, |s, m| m * s),
            Instruction::Divf { src, mid, dst } => self.real_op(tid, *src, *mid, *dst, |s, m| m / s),
            Instruction::Negf { src, dst } => {
                let r = self.read_real(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Real(-r))
            }

            // === Strings ===
            Instruction::Addc { src, mid, dst } => {
                let s = self.read_str(tid, *src)?;
                let m = self.read_str(tid, *mid)?;
                let h = self.heap.alloc_str(m + &s)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Str(h))
            }
            Instruction::Indc { src, idx, dst } => {
                let s = self.read_str(tid, *src)?;
                let w = self.read_word(tid, *idx)?;
                let len = s.chars().count();
                let i = array_index(w, len)?;
                let ch = s.chars().nth(i).ok_or(Fault::OutOfBounds { index: w as i64, len })?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(ch as Word))
            }
            Instruction::Insc { ch, idx, dst } => {
                let w = self.read_word(tid, *ch)?;
                let ch = char::from_u32(w as u32)
                    .ok_or(Fault::TypeMismatch { expected: "unicode scalar value", found: "word" })?;
                let i = self.read_word(tid, *idx)?;
                let dst_loc = self.loc(tid, *dst)?;
                let s = self.str_at(dst_loc)?;
                let len = s.chars().count();
                if i < 0 || i as usize > len {
                    return Err(Fault::OutOfBounds { index: i as i64, len });
                }
                let mut out = String::with_capacity(s.len() + ch.len_utf8());
                out.extend(s.chars().take(i as usize));
                out.push(ch);
                out.extend(s.chars().skip(i as usize));
                let h = self.heap.alloc_str(out)?;
                self.write(dst_loc, Value::Str(h))
            }
            Instruction::Lenc { src, dst } => {
                let s = self.read_str(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(s.chars().count() as Word))
            }
            Instruction::Slicec { start, end, dst } => {
                let lo = self.read_word(tid, *start)?;
                let hi = self.read_word(tid, *end)?;
                let dst_loc = self.loc(tid, *dst)?;
                let s = self.str_at(dst_loc)?;
                let len = s.chars().count();
                check_slice(lo, hi, len)?;
                let out: String =
                    s.chars().skip(lo as usize).take((hi - lo) as usize).collect();
                let h = self.heap.alloc_str(out)?;
                self.write(dst_loc, Value::Str(h))
            }

            // === Arrays ===
            Instruction::Lena { src, dst } => {
                let n = match self.read(tid, *src)? {
                    Value::Nil => 0,
                    Value::Ref(h) => self.heap.array_len(h)? as Word,
                    v => return Err(Fault::expected("array", &v)),
                };
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(n))
            }
            Instruction::Slicea { start, end, dst } => {
                let lo = self.read_word(tid, *start)?;
                let hi = self.read_word(tid, *end)?;
                let dst_loc = self.loc(tid, *dst)?;
                let h = match self.read_loc(dst_loc)? {
                    Value::Ref(h) => h,
                    v => return Err(Fault::expected("array", &v)),
                };
                let len = self.heap.array_len(h)?;
                check_slice(lo, hi, len)?;
                let mut items = Vec::with_capacity((hi - lo) as usize);
                for i in lo as usize..hi as usize {
                    items.push(self.heap.slot(h, i)?.clone());
                }
                for v in &items {
                    self.heap.retain_value(v);
                }
                let out = self.heap.alloc_array_from(items)?;
                self.write(dst_loc, Value::Ref(out))
            }
            Instruction::Slicela { src, idx, dst } => {
                let sh = self.read_array(tid, *src)?;
                let at = self.read_word(tid, *idx)?;
                let dh = self.read_array(tid, *dst)?;
                let src_len = self.heap.array_len(sh)?;
                let dst_len = self.heap.array_len(dh)?;
                if at < 0 || at as usize + src_len > dst_len {
                    return Err(Fault::OutOfBounds { index: at as i64, len: dst_len });
                }
                let mut items = Vec::with_capacity(src_len);
                for i in 0..src_len {
                    items.push(self.heap.slot(sh, i)?.clone());
                }
                for (i, v) in items.into_iter().enumerate() {
                    self.heap.retain_value(&v);
                    let old = self.heap.slot_replace(dh, at as usize + i, v)?;
                    self.heap.release_value(&old);
                }
                Ok(())
            }

            // === Branches ===
            Instruction::Beqb { src, mid, target } => self.branch_b(tid, *src, *mid, *target, |s, m| s == m),
            Instruction::Bneb { src, mid, target } => self.branch_b(tid, *src, *mid, *target, |s, m| s != m),
            Instruction::Bltb { src, mid, target } => self.branch_b(tid, *src, *mid, *target, |s, m| s < m),
            Instruction::Bleb { src, mid, target } => self.branch_b(tid, *src, *mid, *target, |s, m| s <= m),
            Instruction::Bgtb { src, mid, target } => self.branch_b(tid, *src, *mid, *target, |s, m| s > m),
            Instruction::Bgeb { src, mid, target } => self.branch_b(tid, *src, *mid, *target, |s, m| s >= m),

            Instruction::Beqw { src, mid, target } => self.branch_w(tid, *src, *mid, *target, |s, m| s == m),
            Instruction::Bnew { src, mid, target } => self.branch_w(tid, *src, *mid, *target, |s, m| s != m),
            Instruction::Bltw { src, mid, target } => self.branch_w(tid, *src, *mid, *target, |s, m| s < m),
            Instruction::Blew { src, mid, target } => self.branch_w(tid, *src, *mid, *target, |s, m| s <= m),
            Instruction::Bgtw { src, mid, target } => self.branch_w(tid, *src, *mid, *target, |s, m| s > m),
            Instruction::Bgew { src, mid, target } => self.branch_w(tid, *src, *mid, *target, |s, m| s >= m),

            Instruction::Beql { src, mid, target } => self.branch_l(tid, *src, *mid, *target, |s, m| s == m),
            Instruction::Bnel { src, mid, target } => self.branch_l(tid, *src, *mid, *target, |s, m| s != m),
            Instruction::Bltl { src, mid, target } => self.branch_l(tid, *src, *mid, *target, |s, m| s < m),
            Instruction::Blel { src, mid, target } => self.branch_l(tid, *src, *mid, *target, |s, m| s <= m),
            Instruction::Bgtl { src, mid, target } => self.branch_l(tid, *src, *mid, *target, |s, m| s > m),
            Instruction::Bgel { src, mid, target } => self.branch_l(tid, *src, *mid, *target, |s, m| s >= m),

            Instruction::Beqf { src, mid, target } => self.branch_f(tid, *src, *mid, *target, |s, m| s == m),
            Instruction::Bnef { src, mid, target } => self.branch_f(tid, *src, *mid, *target, |s, m| s != m),
            Instruction::Bltf { src, mid, target } => self.branch_f(tid, *src, *mid, *target, |s, m| s < m),
            Instruction::Blef { src, mid, target } => self.branch_f(tid, *src, *mid, *target, |s, m| s <= m),
            Instruction::Bgtf { src, mid, target } => self.branch_f(tid, *src, *mid, *target, |s, m| s > m),
            Instruction::Bgef { src, mid, target } => self.branch_f(tid, *src, *mid, *target, |s, m| s >= m),

            Instruction::Beqc { src, mid, target } => self.branch_c(tid, *src, *mid, *target, |s, m| s == m),
            Instruction::Bnec { src, mid, target } => self.branch_c(tid, *src, *mid, *target, |s, m| s != m),
            Instruction::Bltc { src, mid, target } => self.branch_c(tid, *src, *mid, *target, |s, m| s < m),
            Instruction::Blec { src, mid, target } => self.branch_c(tid, *src, *mid, *target, |s, m| s <= m),
            Instruction::Bgtc { src, mid, target } => self.branch_c(tid, *src, *mid, *target, |s, m| s > m),
            Instruction::Bgec { src, mid, target } => self.branch_c(tid, *src, *mid, *target, |s, m| s >= m),

            // === Conversions ===
            Instruction::Cvtbw { src, dst } => {
                let b = self.read_byte(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(b as Word))
            }
            Instruction::Cvtwb { src, dst } => {
                let w = self.read_word(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Byte(w as Byte))
            }
            Instruction::Cvtfw { src, dst } => {
                let r = self.read_real(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(r.round() as Word))
            }
            Instruction::Cvtwf { src, dst } => {
                let w = self.read_word(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Real(w as Real))
            }
            Instruction::Cvtlf { src, dst } => {
                let b = self.read_big(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Real(b as Real))
            }
            Instruction::Cvtfl { src, dst } => {
                let r = self.read_real(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Big(r.round() as Big))
            }
            Instruction::Cvtlw { src, dst } => {
                let b = self.read_big(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(b as Word))
            }
            Instruction::Cvtwl { src, dst } => {
                let w = self.read_word(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Big(w as Big))
            }
            Instruction::Cvtca { src, dst } => {
                let s = self.read_str(tid, *src)?;
                let items: Vec<Value> = s.bytes().map(Value::Byte).collect();
                let h = self.heap.alloc_array_from(items)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Ref(h))
            }
            Instruction::Cvtac { src, dst } => {
                let h = self.read_array(tid, *src)?;
                let len = self.heap.array_len(h)?;
                let mut bytes = Vec::with_capacity(len);
                for i in 0..len {
                    match self.heap.slot(h, i)? {
                        Value::Byte(b) => bytes.push(*b),
                        v => return Err(Fault::expected("byte", v)),
                    }
                }
                let s = String::from_utf8(bytes)
                    .map_err(|_| Fault::TypeMismatch { expected: "utf-8 bytes", found: "byte array" })?;
                let out = self.heap.alloc_str(s)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Str(out))
            }
            Instruction::Cvtwc { src, dst } => {
                let w = self.read_word(tid, *src)?;
                let h = self.heap.alloc_str(w.to_string())?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Str(h))
            }
            Instruction::Cvtcw { src, dst } => {
                let s = self.read_str(tid, *src)?;
                let w = s.trim().parse::<Word>().unwrap_or(0);
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(w))
            }
            Instruction::Cvtfc { src, dst } => {
                let r = self.read_real(tid, *src)?;
                let h = self.heap.alloc_str(r.to_string())?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Str(h))
            }
            Instruction::Cvtcf { src, dst } => {
                let s = self.read_str(tid, *src)?;
                let r = s.trim().parse::<Real>().unwrap_or(0.0);
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Real(r))
            }
            Instruction::Cvtlc { src, dst } => {
                let b = self.read_big(tid, *src)?;
                let h = self.heap.alloc_str(b.to_string())?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Str(h))
            }
            Instruction::Cvtcl { src, dst } => {
                let s = self.read_str(tid, *src)?;
                let b = s.trim().parse::<Big>().unwrap_or(0);
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Big(b))
            }
            Instruction::Cvtrf { src, dst } | Instruction::Cvtfr { src, dst } => {
                // Short reals are stored widened; both directions narrow
                // through f32.
                let r = self.read_real(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Real((r as f32) as Real))
            }
            Instruction::Cvtws { src, dst } | Instruction::Cvtsw { src, dst } => {
                let w = self.read_word(tid, *src)?;
                let loc = self.loc(tid, *dst)?;
                self.write(loc, Value::Word(w as i16 as Word))
            }

            // === Misc ===
            Instruction::Tcmp { src, dst } => {
                let s = self.read(tid, *src)?;
                if s == Value::Nil {
                    return Ok(());
                }
                let Value::Ref(sh) = s else {
                    return Err(Fault::expected("data block", &s));
                };
                let d = self.read(tid, *dst)?;
                let Value::Ref(dh) = d else {
                    return Err(Fault::expected("data block", &d));
                };
                if self.heap.data_desc(sh)? != self.heap.data_desc(dh)? {
                    return Err(Fault::TypeMismatch {
                        expected: "matching type descriptors",
                        found: "data block",
                    });
                }
                Ok(())
            }
        }
    }

    // === Operand resolution ===

    /// Resolve a writable operand to a storage location.
    fn loc(&self, tid: Tid, op: Operand) -> Result<Loc, Fault> {
        match op {
            Operand::Imm(_) => Err(Fault::BadOperand),
            Operand::Fp(i) => Ok(Loc::Frame(tid, i)),
            Operand::Mp(i) => Ok(Loc::Data(self.module_of(tid)?, i)),
            Operand::FpInd(i, off) => {
                let base = self.read_loc(Loc::Frame(tid, i))?;
                indirect(base, off)
            }
            Operand::MpInd(i, off) => {
                let base = self.read_loc(Loc::Data(self.module_of(tid)?, i))?;
                indirect(base, off)
            }
        }
    }

    /// Read the value at a resolved location.
    fn read_loc(&self, loc: Loc) -> Result<Value, Fault> {
        match loc {
            Loc::Frame(tid, i) => {
                let frame = self.sched.thread(tid).ok_or(Fault::DanglingHandle)?.frame()?;
                frame
                    .slots
                    .get(i)
                    .cloned()
                    .ok_or(Fault::OutOfBounds { index: i as i64, len: frame.slots.len() })
            }
            Loc::Data(mid, i) => {
                let data = &self.modules.get(mid.0).ok_or(Fault::DanglingHandle)?.data;
                data.get(i)
                    .cloned()
                    .ok_or(Fault::OutOfBounds { index: i as i64, len: data.len() })
            }
            Loc::Elem(h, i) => self.heap.slot(h, i).cloned(),
        }
    }

    /// Read an operand; immediates materialize as words.
    fn read(&self, tid: Tid, op: Operand) -> Result<Value, Fault> {
        match op {
            Operand::Imm(w) => Ok(Value::Word(w)),
            _ => self.read_loc(self.loc(tid, op)?),
        }
    }

    /// Store into a location, releasing whatever the slot held. An
    /// overwritten pending-frame handle discards the frame.
    fn write(&mut self, loc: Loc, v: Value) -> Result<(), Fault> {
        let old = match loc {
            Loc::Frame(tid, i) => {
                let frame =
                    self.sched.thread_mut(tid).ok_or(Fault::DanglingHandle)?.frame_mut()?;
                let len = frame.slots.len();
                let slot = frame
                    .slots
                    .get_mut(i)
                    .ok_or(Fault::OutOfBounds { index: i as i64, len })?;
                std::mem::replace(slot, v)
            }
            Loc::Data(mid, i) => {
                let data = &mut self.modules.get_mut(mid.0).ok_or(Fault::DanglingHandle)?.data;
                let len = data.len();
                let slot =
                    data.get_mut(i).ok_or(Fault::OutOfBounds { index: i as i64, len })?;
                std::mem::replace(slot, v)
            }
            Loc::Elem(h, i) => self.heap.slot_replace(h, i, v)?,
        };
        if let Value::Frame(fid) = old {
            if let Some(frame) = self.frames.discard(fid) {
                self.release_frame(frame);
            }
        } else {
            self.heap.release_value(&old);
        }
        Ok(())
    }

    /// Take the value out of a location, leaving nil, without touching
    /// reference counts. The ownership moves to the caller.
    fn take_at(&mut self, loc: Loc) -> Result<Value, Fault> {
        match loc {
            Loc::Frame(tid, i) => {
                let frame =
                    self.sched.thread_mut(tid).ok_or(Fault::DanglingHandle)?.frame_mut()?;
                let len = frame.slots.len();
                let slot = frame
                    .slots
                    .get_mut(i)
                    .ok_or(Fault::OutOfBounds { index: i as i64, len })?;
                Ok(std::mem::take(slot))
            }
            Loc::Data(mid, i) => {
                let data = &mut self.modules.get_mut(mid.0).ok_or(Fault::DanglingHandle)?.data;
                let len = data.len();
                let slot =
                    data.get_mut(i).ok_or(Fault::OutOfBounds { index: i as i64, len })?;
                Ok(std::mem::take(slot))
            }
            Loc::Elem(h, i) => self.heap.slot_replace(h, i, Value::Nil),
        }
    }

    // === Typed reads ===

    fn read_byte(&self, tid: Tid, op: Operand) -> Result<Byte, Fault> {
        match op {
            Operand::Imm(w) => Ok(w as Byte),
            _ => match self.read(tid, op)? {
                Value::Byte(b) => Ok(b),
                v => Err(Fault::expected("byte", &v)),
            },
        }
    }

    fn read_word(&self, tid: Tid, op: Operand) -> Result<Word, Fault> {
        match self.read(tid, op)? {
            Value::Word(w) => Ok(w),
            v => Err(Fault::expected("word", &v)),
        }
    }

    fn read_big(&self, tid: Tid, op: Operand) -> Result<Big, Fault> {
        match op {
            Operand::Imm(w) => Ok(w as Big),
            _ => match self.read(tid, op)? {
                Value::Big(b) => Ok(b),
                v => Err(Fault::expected("big", &v)),
            },
        }
    }

    fn read_real(&self, tid: Tid, op: Operand) -> Result<Real, Fault> {
        match op {
            Operand::Imm(w) => Ok(w as Real),
            _ => match self.read(tid, op)? {
                Value::Real(r) => Ok(r),
                v => Err(Fault::expected("real", &v)),
            },
        }
    }

    /// Read a string operand; nil reads as the empty string.
    fn read_str(&self, tid: Tid, op: Operand) -> Result<String, Fault> {
        match self.read(tid, op)? {
            Value::Nil => Ok(String::new()),
            Value::Str(h) => Ok(self.heap.str(h)?.to_string()),
            v => Err(Fault::expected("string", &v)),
        }
    }

    /// Read the string held at an already-resolved location.
    fn str_at(&self, loc: Loc) -> Result<String, Fault> {
        match self.read_loc(loc)? {
            Value::Nil => Ok(String::new()),
            Value::Str(h) => Ok(self.heap.str(h)?.to_string()),
            v => Err(Fault::expected("string", &v)),
        }
    }

    fn read_chan(&self, tid: Tid, op: Operand) -> Result<HandleId, Fault> {
        match self.read(tid, op)? {
            Value::Chan(h) => Ok(h),
            Value::Nil => Err(Fault::NilDeref),
            v => Err(Fault::expected("channel", &v)),
        }
    }

    fn read_array(&self, tid: Tid, op: Operand) -> Result<HandleId, Fault> {
        match self.read(tid, op)? {
            Value::Ref(h) => Ok(h),
            Value::Nil => Err(Fault::NilDeref),
            v => Err(Fault::expected("array", &v)),
        }
    }

    fn read_list(&self, tid: Tid, op: Operand) -> Result<HandleId, Fault> {
        match self.read(tid, op)? {
            Value::Ref(h) => Ok(h),
            Value::Nil => Err(Fault::NilDeref),
            v => Err(Fault::expected("list", &v)),
        }
    }

    // === Arithmetic and branch plumbing ===

    fn byte_op(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        dst: Operand,
        f: fn(Byte, Byte) -> Result<Byte, Fault>,
    ) -> Result<(), Fault> {
        let s = self.read_byte(tid, src)?;
        let m = self.read_byte(tid, mid)?;
        let loc = self.loc(tid, dst)?;
        self.write(loc, Value::Byte(f(s, m)?))
    }

    fn word_op(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        dst: Operand,
        f: fn(Word, Word) -> Result<Word, Fault>,
    ) -> Result<(), Fault> {
        let s = self.read_word(tid, src)?;
        let m = self.read_word(tid, mid)?;
        let loc = self.loc(tid, dst)?;
        self.write(loc, Value::Word(f(s, m)?))
    }

    fn big_op(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        dst: Operand,
        f: fn(Big, Big) -> Result<Big, Fault>,
    ) -> Result<(), Fault> {
        let s = self.read_big(tid, src)?;
        let m = self.read_big(tid, mid)?;
        let loc = self.loc(tid, dst)?;
        self.write(loc, Value::Big(f(s, m)?))
    }

    fn real_op(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        dst: Operand,
        f: fn(Real, Real) -> Real,
    ) -> Result<(), Fault> {
        let s = self.read_real(tid, src)?;
        let m = self.read_real(tid, mid)?;
        let loc = self.loc(tid, dst)?;
        self.write(loc, Value::Real(f(s, m)))
    }

    fn branch_b(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        target: usize,
        f: fn(Byte, Byte) -> bool,
    ) -> Result<(), Fault> {
        let s = self.read_byte(tid, src)?;
        let m = self.read_byte(tid, mid)?;
        if f(s, m) { self.jump(tid, target) } else { Ok(()) }
    }

    fn branch_w(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        target: usize,
        f: fn(Word, Word) -> bool,
    ) -> Result<(), Fault> {
        let s = self.read_word(tid, src)?;
        let m = self.read_word(tid, mid)?;
        if f(s, m) { self.jump(tid, target) } else { Ok(()) }
    }

    fn branch_l(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        target: usize,
        f: fn(Big, Big) -> bool,
    ) -> Result<(), Fault> {
        let s = self.read_big(tid, src)?;
        let m = self.read_big(tid, mid)?;
        if f(s, m) { self.jump(tid, target) } else { Ok(()) }
    }

    fn branch_f(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        target: usize,
        f: fn(Real, Real) -> bool,
    ) -> Result<(), Fault> {
        let s = self.read_real(tid, src)?;
        let m = self.read_real(tid, mid)?;
        if f(s, m) { self.jump(tid, target) } else { Ok(()) }
    }

    fn branch_c(
        &mut self,
        tid: Tid,
        src: Operand,
        mid: Operand,
        target: usize,
        f: fn(&str, &str) -> bool,
    ) -> Result<(), Fault> {
        let s = self.read_str(tid, src)?;
        let m = self.read_str(tid, mid)?;
        if f(&s, &m) { self.jump(tid, target) } else { Ok(()) }
    }

    // === Control plumbing ===

    fn module_of(&self, tid: Tid) -> Result<ModId, Fault> {
        Ok(self.sched.thread(tid).ok_or(Fault::DanglingHandle)?.module)
    }

    fn pc_of(&self, tid: Tid) -> Result<usize, Fault> {
        Ok(self.sched.thread(tid).ok_or(Fault::DanglingHandle)?.pc)
    }

    fn desc(&self, module: ModId, index: usize) -> Result<TypeDesc, Fault> {
        let descs = &self.modules.get(module.0).ok_or(Fault::DanglingHandle)?.image.descs;
        descs
            .get(index)
            .cloned()
            .ok_or(Fault::OutOfBounds { index: index as i64, len: descs.len() })
    }

    /// Validate a branch target against a module's code, then take it.
    fn jump(&mut self, tid: Tid, target: usize) -> Result<(), Fault> {
        let module = self.module_of(tid)?;
        self.check_target(module, target)?;
        if let Some(t) = self.sched.thread_mut(tid) {
            t.pc = target;
        }
        Ok(())
    }

    fn check_target(&self, module: ModId, target: usize) -> Result<(), Fault> {
        let len = self.modules.get(module.0).ok_or(Fault::DanglingHandle)?.image.code.len();
        if target >= len {
            return Err(Fault::JumpOutOfRange { target });
        }
        Ok(())
    }

    /// Read a frame operand and consume the pending frame it names.
    fn consume_frame(&mut self, tid: Tid, op: Operand) -> Result<Frame, Fault> {
        match self.read(tid, op)? {
            Value::Frame(fid) => {
                let frame = self.frames.take(fid)?;
                // The handle in the slot is now dead; clear it so a later
                // overwrite does not discard a second time.
                if !matches!(op, Operand::Imm(_)) {
                    let loc = self.loc(tid, op)?;
                    self.take_at(loc)?;
                }
                Ok(frame)
            }
            Value::Nil => Err(Fault::NilDeref),
            v => Err(Fault::expected("frame", &v)),
        }
    }

    fn do_ret(&mut self, tid: Tid) -> Result<(), Fault> {
        let frame = {
            let t = self.sched.thread_mut(tid).ok_or(Fault::DanglingHandle)?;
            t.stack.pop()
        };
        let Some(frame) = frame else {
            self.terminate_thread(tid);
            return Ok(());
        };
        let link = (frame.ret_pc, frame.ret_module);
        self.release_frame(frame);
        match link {
            (Some(pc), Some(module)) => {
                if let Some(t) = self.sched.thread_mut(tid) {
                    t.pc = pc;
                    t.module = module;
                }
                Ok(())
            }
            // Returning off the initial frame ends the thread.
            _ => {
                self.terminate_thread(tid);
                Ok(())
            }
        }
    }

    fn linkage(&self, v: &Value) -> Result<&Linkage, Fault> {
        match v {
            Value::Module(LinkId(i)) => self.links.get(*i).ok_or(Fault::DanglingHandle),
            Value::Nil => Err(Fault::NilDeref),
            v => Err(Fault::expected("module", v)),
        }
    }

    /// Resolve `module[index]` to a linkage entry.
    fn link_entry(
        &self,
        tid: Tid,
        module: Operand,
        index: Operand,
    ) -> Result<crate::module::LinkEntry, Fault> {
        let lv = self.read(tid, module)?;
        let link = self.linkage(&lv)?;
        let w = self.read_word(tid, index)?;
        if w < 0 {
            return Err(Fault::LinkIndex { index: w as i64, len: link.entries.len() });
        }
        link.entry(w as usize)
            .copied()
            .ok_or(Fault::LinkIndex { index: w as i64, len: link.entries.len() })
    }

    fn do_load(&mut self, tid: Tid, path: Operand, desc: usize, dst: Operand) -> Result<(), Fault> {
        let path = match self.read(tid, path)? {
            Value::Str(h) => self.heap.str(h)?.to_string(),
            Value::Nil => return Err(Fault::NilDeref),
            v => return Err(Fault::expected("string", &v)),
        };
        let module = self.module_of(tid)?;
        let descriptor: Vec<Import> = {
            let descs = &self.modules[module.0].image.link_descs;
            descs
                .get(desc)
                .cloned()
                .ok_or(Fault::OutOfBounds { index: desc as i64, len: descs.len() })?
        };
        let dst_loc = self.loc(tid, dst)?;
        match self.load_module(&path, &descriptor) {
            Ok(link) => self.write(dst_loc, Value::Module(link)),
            // Load failure is reported as nil, never as a fault.
            Err(err) => {
                debug!(path, %err, "load failed");
                self.write(dst_loc, Value::Nil)
            }
        }
    }

    /// Instantiate `path` and resolve `descriptor` against it. When
    /// any import fails to resolve, no linkage table or handle is
    /// produced; the image cache and the per-path instance stay
    /// (load-or-get-cached), so a later load does not re-run the
    /// data-segment initializers.
    fn load_module(&mut self, path: &str, descriptor: &[Import]) -> Result<LinkId, LoadError> {
        let mid = self.instantiate(path)?;
        let image = self.modules[mid.0].image.clone();
        let linkage = resolve_linkage(&image, mid, descriptor)?;
        self.links.push(linkage);
        Ok(LinkId(self.links.len() - 1))
    }

    /// One instance per path: repeated loads see the same data segment.
    fn instantiate(&mut self, path: &str) -> Result<ModId, LoadError> {
        if let Some(mid) = self.instances.get(path) {
            return Ok(*mid);
        }
        let image = self.registry.fetch(path, &*self.source)?;
        let mut data = Vec::with_capacity(image.data.len());
        for init in &image.data {
            data.push(match init {
                DataInit::Nil => Value::Nil,
                DataInit::Byte(b) => Value::Byte(*b),
                DataInit::Word(w) => Value::Word(*w),
                DataInit::Big(b) => Value::Big(*b),
                DataInit::Real(r) => Value::Real(*r),
                DataInit::Str(s) => {
                    let h = self
                        .heap
                        .alloc_str(s.clone())
                        .map_err(|f| LoadError::BadImage(format!("data segment: {f}")))?;
                    Value::Str(h)
                }
            });
        }
        let mid = ModId(self.modules.len());
        debug!(path, module = %image.name, instance = mid.0, "module instantiated");
        self.modules.push(LoadedModule { image, data });
        self.instances.insert(path.to_string(), mid);
        Ok(mid)
    }

    // === Channel plumbing ===

    /// Materialize a send source at park/commit time.
    fn send_payload(&self, tid: Tid, kind: crate::value::ValueKind, op: Operand) -> Result<Payload, Fault> {
        match op {
            Operand::Imm(w) => Ok(Payload::Val(imm_as(kind, w)?)),
            _ => Ok(Payload::Loc(self.loc(tid, op)?)),
        }
    }

    /// Pull the transferred value out of a sender payload: pointer
    /// kinds move (source goes nil without a release), scalars copy.
    /// The kind check runs before any move so a mismatch leaves the
    /// source slot intact.
    fn transfer_out(&mut self, kind: crate::value::ValueKind, payload: Payload) -> Result<Value, Fault> {
        match payload {
            Payload::Val(v) => {
                self.check_kind(kind, &v)?;
                Ok(v)
            }
            Payload::Loc(loc) => {
                let v = self.read_loc(loc)?;
                self.check_kind(kind, &v)?;
                if kind.moves_ownership() {
                    self.take_at(loc)
                } else {
                    Ok(v)
                }
            }
        }
    }

    /// Active sender meets a parked receiver: hand over an already
    /// validated value. A fault on the receiving side re-parks the
    /// receiver; a partner's fault never costs a parked thread its
    /// registration.
    fn rendezvous_send(&mut self, ch: HandleId, tid: Tid, value: Value) -> Result<(), Fault> {
        let Some(w) = self.heap.chan_mut(ch)?.take_receiver(tid) else {
            self.heap.release_value(&value);
            return Err(Fault::DanglingHandle);
        };
        let dst = match &w.payload {
            Payload::Loc(loc) => *loc,
            Payload::Val(_) => {
                self.heap.release_value(&value);
                self.repark_receiver(ch, w);
                return Err(Fault::BadOperand);
            }
        };
        if let Err(fault) = self.write(dst, value) {
            self.repark_receiver(ch, w);
            return Err(fault);
        }
        self.finish_waiter(w.tid, w.resume_pc, w.alt)
    }

    /// Active receiver meets a parked sender: move its value into
    /// `dst`. A fault re-parks the sender, payload intact.
    fn rendezvous_recv(
        &mut self,
        ch: HandleId,
        tid: Tid,
        kind: crate::value::ValueKind,
        dst: Operand,
    ) -> Result<(), Fault> {
        let Some(w) = self.heap.chan_mut(ch)?.take_sender(tid) else {
            return Err(Fault::DanglingHandle);
        };
        match self.pull_from_sender(tid, kind, dst, &w) {
            Ok(()) => self.finish_waiter(w.tid, w.resume_pc, w.alt),
            Err(fault) => {
                if let Ok(c) = self.heap.chan_mut(ch) {
                    c.park_sender(w);
                }
                Err(fault)
            }
        }
    }

    fn pull_from_sender(
        &mut self,
        tid: Tid,
        kind: crate::value::ValueKind,
        dst: Operand,
        w: &Waiter,
    ) -> Result<(), Fault> {
        let loc = self.loc(tid, dst)?;
        let value = self.transfer_out(kind, w.payload.clone())?;
        self.write(loc, value)
    }

    fn repark_receiver(&mut self, ch: HandleId, w: Waiter) {
        if let Ok(c) = self.heap.chan_mut(ch) {
            c.park_receiver(w);
        }
    }

    /// Complete a parked partner: commit its alt entry if it was in an
    /// alternation, then wake it past its blocking instruction.
    fn finish_waiter(
        &mut self,
        tid: Tid,
        resume_pc: usize,
        alt: Option<AltCtx>,
    ) -> Result<(), Fault> {
        if let Some(alt) = alt {
            self.write(alt.dst, Value::Word(alt.index as Word))?;
            self.clear_alt(tid);
        }
        self.sched.wake(tid, resume_pc);
        Ok(())
    }

    /// Drop a thread's remaining alt registrations.
    fn clear_alt(&mut self, tid: Tid) {
        let channels = match self.sched.thread_mut(tid) {
            Some(t) => std::mem::take(&mut t.alt_channels),
            None => return,
        };
        for h in channels {
            if let Ok(c) = self.heap.chan_mut(h) {
                c.forget(tid);
            }
        }
    }

    fn do_alt(
        &mut self,
        tid: Tid,
        entries: &[AltEntry],
        dst: Operand,
        else_pc: Option<usize>,
    ) -> Result<(), Fault> {
        let mut channels = Vec::with_capacity(entries.len());
        let mut ready: SmallVec<[usize; 8]> = SmallVec::new();
        for (i, e) in entries.iter().enumerate() {
            let h = self.read_chan(tid, e.chan)?;
            let c = self.heap.chan(h)?;
            let is_ready = match e.dir {
                AltDir::Send => c.receiver_ready(tid),
                AltDir::Recv => c.sender_ready(tid),
            };
            if is_ready {
                ready.push(i);
            }
            channels.push(h);
        }

        if !ready.is_empty() {
            // Uniform choice among ready entries; starvation-freedom
            // of busy alternations depends on it.
            let pick = ready[self.rng.gen_range(0..ready.len())];
            let e = &entries[pick];
            let h = channels[pick];
            let kind = self.heap.chan(h)?.kind;
            match e.dir {
                AltDir::Send => {
                    let payload = self.send_payload(tid, kind, e.val)?;
                    let value = self.transfer_out(kind, payload)?;
                    self.rendezvous_send(h, tid, value)?;
                }
                AltDir::Recv => {
                    self.rendezvous_recv(h, tid, kind, e.val)?;
                }
            }
            let loc = self.loc(tid, dst)?;
            return self.write(loc, Value::Word(pick as Word));
        }

        if let Some(pc) = else_pc {
            return self.jump(tid, pc);
        }

        // Nothing ready: park one waiter per entry. Whichever partner
        // arrives first commits that entry and clears the rest.
        let dst_loc = self.loc(tid, dst)?;
        let resume_pc = self.pc_of(tid)?;
        for (i, e) in entries.iter().enumerate() {
            let kind = self.heap.chan(channels[i])?.kind;
            let payload = match e.dir {
                AltDir::Send => self.send_payload(tid, kind, e.val)?,
                AltDir::Recv => Payload::Loc(self.loc(tid, e.val)?),
            };
            let waiter = Waiter {
                tid,
                payload,
                resume_pc,
                alt: Some(AltCtx { index: i, dst: dst_loc }),
            };
            let c = self.heap.chan_mut(channels[i])?;
            match e.dir {
                AltDir::Send => c.park_sender(waiter),
                AltDir::Recv => c.park_receiver(waiter),
            }
        }
        if let Some(t) = self.sched.thread_mut(tid) {
            t.alt_channels = channels;
        }
        self.sched.block(tid);
        Ok(())
    }

    fn check_kind(&self, kind: crate::value::ValueKind, v: &Value) -> Result<(), Fault> {
        use crate::value::ValueKind as K;
        let ok = match kind {
            K::Byte => matches!(v, Value::Byte(_)),
            K::Word => matches!(v, Value::Word(_)),
            K::Big => matches!(v, Value::Big(_)),
            K::Real => matches!(v, Value::Real(_)),
            K::String => matches!(v, Value::Nil | Value::Str(_)),
            K::Pointer => {
                matches!(v, Value::Nil | Value::Ref(_) | Value::Str(_) | Value::Chan(_))
            }
            K::Memory | K::MemoryPtrs => matches!(v, Value::Nil | Value::Ref(_)),
        };
        if ok {
            Ok(())
        } else {
            Err(Fault::expected(kind_name(kind), v))
        }
    }

    // === Teardown ===

    fn terminate_thread(&mut self, tid: Tid) {
        self.clear_alt(tid);
        if let Some(thread) = self.sched.terminate(tid) {
            for frame in thread.stack {
                self.release_frame(frame);
            }
        }
    }

    fn release_frame(&mut self, frame: Frame) {
        for v in frame.slots {
            if let Value::Frame(fid) = v {
                if let Some(inner) = self.frames.discard(fid) {
                    self.release_frame(inner);
                }
            } else {
                self.heap.release_value(&v);
            }
        }
    }

    // === Introspection (hosts and tests) ===

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn registry(&self) -> &Arc<ImageRegistry> {
        &self.registry
    }

    /// Instance id of a loaded path, if any.
    pub fn instance(&self, path: &str) -> Option<ModId> {
        self.instances.get(path).copied()
    }

    /// Read a module instance's data slot.
    pub fn data_slot(&self, module: ModId, index: usize) -> Option<&Value> {
        self.modules.get(module.0)?.data.get(index)
    }

    /// Number of frames built but never consumed.
    pub fn pending_frames(&self) -> usize {
        self.frames.pending()
    }

    pub fn live_threads(&self) -> usize {
        self.sched.live_count()
    }

    pub fn blocked_threads(&self) -> usize {
        self.sched.blocked_count()
    }
}

/// Add an offset to a resolved location (block copies).
fn offset(loc: Loc, i: usize) -> Loc {
    match loc {
        Loc::Frame(tid, base) => Loc::Frame(tid, base + i),
        Loc::Data(mid, base) => Loc::Data(mid, base + i),
        Loc::Elem(h, base) => Loc::Elem(h, base + i),
    }
}

/// Resolve an indirect operand's base value plus offset.
fn indirect(base: Value, off: usize) -> Result<Loc, Fault> {
    match base {
        Value::Ref(h) => Ok(Loc::Elem(h, off)),
        Value::Addr(loc) => Ok(offset(loc, off)),
        Value::Nil => Err(Fault::NilDeref),
        v => Err(Fault::expected("pointer or address", &v)),
    }
}

fn array_index(w: Word, len: usize) -> Result<usize, Fault> {
    if w < 0 || w as usize >= len {
        return Err(Fault::OutOfBounds { index: w as i64, len });
    }
    Ok(w as usize)
}

fn check_slice(lo: Word, hi: Word, len: usize) -> Result<(), Fault> {
    if lo < 0 || hi < lo || hi as usize > len {
        return Err(Fault::OutOfBounds { index: hi as i64, len });
    }
    Ok(())
}

/// Materialize an immediate for a channel of the given kind.
fn imm_as(kind: crate::value::ValueKind, w: Word) -> Result<Value, Fault> {
    use crate::value::ValueKind as K;
    match kind {
        K::Byte => Ok(Value::Byte(w as Byte)),
        K::Word => Ok(Value::Word(w)),
        K::Big => Ok(Value::Big(w as Big)),
        K::Real => Ok(Value::Real(w as Real)),
        _ => Err(Fault::BadOperand),
    }
}

fn kind_name(kind: crate::value::ValueKind) -> &'static str {
    use crate::value::ValueKind as K;
    match kind {
        K::Byte => "byte",
        K::Word => "word",
        K::Big => "big",
        K::Real => "real",
        K::Pointer => "pointer",
        K::String => "string",
        K::Memory | K::MemoryPtrs => "memory block",
    }
}
