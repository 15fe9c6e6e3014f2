//! End-to-end execution tests: whole programs run to quiescence on a
//! [`Vm`], with outcomes observed through module data segments.

use std::sync::Arc;

use weft_vm::{
    AltDir, AltEntry, DataInit, Entry, Export, Import, Instruction, MapSource, ModuleImage,
    Operand, TypeDesc, Value, ValueKind, Vm, VmConfig,
};

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Image with descriptor 0 as the entry frame and entry pc 0.
fn image(code: Vec<Instruction>, descs: Vec<TypeDesc>, data: Vec<DataInit>) -> ModuleImage {
    ModuleImage {
        name: "main".into(),
        code: code.into(),
        descs,
        data,
        exports: Vec::new(),
        link_descs: Vec::new(),
        entry: Some(Entry { pc: 0, frame_desc: 0 }),
    }
}

fn run_main(img: ModuleImage) -> Vm {
    let mut source = MapSource::new();
    source.insert("main", img);
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    vm.run();
    vm
}

fn data(vm: &Vm, slot: usize) -> Value {
    let m = vm.instance("main").unwrap();
    vm.data_slot(m, slot).unwrap().clone()
}

fn recv(chan: Operand, val: Operand) -> AltEntry {
    AltEntry { dir: AltDir::Recv, chan, val }
}

fn send(chan: Operand, val: Operand) -> AltEntry {
    AltEntry { dir: AltDir::Send, chan, val }
}

// === Rendezvous ===

#[test]
fn test_producer_consumer_sums_over_channel() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Newc { kind: ValueKind::Word, dst: Mp(0) },
            Frame { desc: 1, dst: Fp(0) },
            Spawn { frame: Fp(0), target: 10 },
            Recv { chan: Mp(0), dst: Fp(0) },
            Addw { src: Fp(0), mid: Mp(1), dst: Mp(1) },
            Recv { chan: Mp(0), dst: Fp(0) },
            Addw { src: Fp(0), mid: Mp(1), dst: Mp(1) },
            Recv { chan: Mp(0), dst: Fp(0) },
            Addw { src: Fp(0), mid: Mp(1), dst: Mp(1) },
            Ret,
            // producer
            Send { chan: Mp(0), src: Imm(1) },
            Send { chan: Mp(0), src: Imm(2) },
            Send { chan: Mp(0), src: Imm(3) },
            Ret,
        ],
        vec![TypeDesc::scalar(1), TypeDesc::scalar(0)],
        vec![DataInit::Nil, DataInit::Word(0)],
    ));

    assert_eq!(data(&vm, 1), Value::Word(6));
    assert_eq!(vm.live_threads(), 0);
    assert_eq!(vm.blocked_threads(), 0);
}

#[test]
fn test_pointer_send_moves_ownership() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Newc { kind: ValueKind::String, dst: Mp(0) },
            Frame { desc: 1, dst: Fp(0) },
            Spawn { frame: Fp(0), target: 5 },
            Send { chan: Mp(0), src: Mp(1) },
            Ret,
            // receiver
            Recv { chan: Mp(0), dst: Mp(2) },
            Ret,
        ],
        vec![TypeDesc::scalar(1), TypeDesc::scalar(0)],
        vec![DataInit::Nil, DataInit::Str("payload".into()), DataInit::Nil],
    ));

    // The source slot is nil after the transfer; exactly one reference
    // survives, now owned by the destination.
    assert_eq!(data(&vm, 1), Value::Nil);
    let Value::Str(h) = data(&vm, 2) else { panic!("expected string in slot 2") };
    assert_eq!(vm.heap().str(h).unwrap(), "payload");
    assert_eq!(vm.heap().refcount(h), Some(1));
    assert_eq!(vm.blocked_threads(), 0);
}

#[test]
fn test_scalar_send_copies() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Newc { kind: ValueKind::Word, dst: Mp(0) },
            Frame { desc: 1, dst: Fp(0) },
            Spawn { frame: Fp(0), target: 5 },
            Send { chan: Mp(0), src: Mp(1) },
            Ret,
            Recv { chan: Mp(0), dst: Mp(2) },
            Ret,
        ],
        vec![TypeDesc::scalar(1), TypeDesc::scalar(0)],
        vec![DataInit::Nil, DataInit::Word(17), DataInit::Nil],
    ));

    assert_eq!(data(&vm, 1), Value::Word(17));
    assert_eq!(data(&vm, 2), Value::Word(17));
}

#[test]
fn test_failed_send_leaves_receiver_parked() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let mut source = MapSource::new();
    source.insert(
        "main",
        image(
            vec![
                Newc { kind: ValueKind::Word, dst: Mp(0) },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 8 },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 10 },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 13 },
                Ret,
                // receiver
                Recv { chan: Mp(0), dst: Mp(1) },
                Ret,
                // a string on a word channel: the sender faults alone
                Cvtwc { src: Imm(7), dst: Fp(1) },
                Send { chan: Mp(0), src: Fp(1) },
                Ret,
                // a well-typed sender arriving after the fault
                Nop,
                Nop,
                Send { chan: Mp(0), src: Imm(42) },
                Ret,
            ],
            vec![TypeDesc::scalar(1), TypeDesc::scalar(2)],
            vec![DataInit::Nil, DataInit::Nil],
        ),
    );
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    let stats = vm.run();

    // The receiver kept its registration across the partner's fault
    // and rendezvoused with the later sender.
    assert_eq!(data(&vm, 1), Value::Word(42));
    assert_eq!(stats.deadlocked, 0);
    assert_eq!(vm.live_threads(), 0);
}

#[test]
fn test_failed_receive_leaves_sender_parked() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let mut source = MapSource::new();
    source.insert(
        "main",
        image(
            vec![
                Newc { kind: ValueKind::String, dst: Mp(0) },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 5 },
                Recv { chan: Mp(0), dst: Mp(2) },
                Ret,
                // a word on a string channel, parked before the recv
                Send { chan: Mp(0), src: Mp(1) },
                Ret,
            ],
            vec![TypeDesc::scalar(1), TypeDesc::scalar(0)],
            vec![DataInit::Nil, DataInit::Word(5), DataInit::Nil],
        ),
    );
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    let stats = vm.run();

    // The receiver faults; the sender stays parked with its source
    // slot untouched (the kind check runs before the move).
    assert_eq!(data(&vm, 2), Value::Nil);
    assert_eq!(data(&vm, 1), Value::Word(5));
    assert_eq!(stats.deadlocked, 1);
    assert_eq!(vm.blocked_threads(), 1);
}

#[test]
fn test_receive_with_no_sender_deadlocks_quietly() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let mut source = MapSource::new();
    source.insert(
        "main",
        image(
            vec![
                Newc { kind: ValueKind::Word, dst: Mp(0) },
                Recv { chan: Mp(0), dst: Fp(0) },
                Ret,
            ],
            vec![TypeDesc::scalar(1)],
            vec![DataInit::Nil],
        ),
    );
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    let stats = vm.run();

    // Deadlock is a quiescent outcome, not a fault.
    assert_eq!(stats.deadlocked, 1);
    assert_eq!(vm.blocked_threads(), 1);
    assert_eq!(vm.live_threads(), 1);
}

// === Alternation ===

fn alt_choice_image() -> ModuleImage {
    use Instruction::*;
    use Operand::*;
    let entries: Arc<[AltEntry]> = vec![recv(Mp(0), Fp(1)), recv(Mp(1), Fp(1))].into();
    image(
        vec![
            Newc { kind: ValueKind::Word, dst: Mp(0) },
            Newc { kind: ValueKind::Word, dst: Mp(1) },
            Frame { desc: 1, dst: Fp(0) },
            Spawn { frame: Fp(0), target: 12 },
            Frame { desc: 1, dst: Fp(0) },
            Spawn { frame: Fp(0), target: 14 },
            Nop,
            Nop,
            Nop,
            Alt { entries, dst: Fp(2) },
            Movw { src: Fp(2), dst: Mp(2) },
            Ret,
            Send { chan: Mp(0), src: Imm(7) },
            Ret,
            Send { chan: Mp(1), src: Imm(9) },
            Ret,
        ],
        vec![TypeDesc::scalar(3), TypeDesc::scalar(0)],
        vec![DataInit::Nil, DataInit::Nil, DataInit::Word(-1)],
    )
}

#[test]
fn test_alt_picks_only_ready_entries() {
    init_logs();
    for seed in 0..16 {
        let mut source = MapSource::new();
        source.insert("main", alt_choice_image());
        let mut vm =
            Vm::with_config(source, VmConfig { alt_seed: Some(seed), ..VmConfig::default() });
        vm.boot("main").unwrap();
        let stats = vm.run();

        let idx = match data(&vm, 2) {
            Value::Word(w) => w,
            v => panic!("expected index, got {v:?}"),
        };
        assert!(idx == 0 || idx == 1, "chosen index {idx}");
        // The unchosen producer is still parked.
        assert_eq!(stats.deadlocked, 1);
    }
}

#[test]
fn test_alt_choice_is_not_biased() {
    init_logs();
    let mut counts = [0u32; 2];
    for seed in 0..64 {
        let mut source = MapSource::new();
        source.insert("main", alt_choice_image());
        let mut vm =
            Vm::with_config(source, VmConfig { alt_seed: Some(seed), ..VmConfig::default() });
        vm.boot("main").unwrap();
        vm.run();
        match data(&vm, 2) {
            Value::Word(w) if w == 0 || w == 1 => counts[w as usize] += 1,
            v => panic!("expected index, got {v:?}"),
        }
    }
    // Uniform over two ready entries: both sides must show up.
    assert!(counts[0] >= 10, "entry 0 chosen {} times", counts[0]);
    assert!(counts[1] >= 10, "entry 1 chosen {} times", counts[1]);
}

#[test]
fn test_parked_alt_commits_one_entry_and_clears_the_rest() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let entries: Arc<[AltEntry]> = vec![recv(Mp(0), Fp(1)), recv(Mp(1), Fp(1))].into();
    let mut source = MapSource::new();
    source.insert(
        "main",
        image(
            vec![
                Newc { kind: ValueKind::Word, dst: Mp(0) },
                Newc { kind: ValueKind::Word, dst: Mp(1) },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 10 },
                Alt { entries, dst: Fp(2) },
                Movw { src: Fp(2), dst: Mp(2) },
                Movw { src: Fp(1), dst: Mp(3) },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 14 },
                Ret,
                // p1: let the alt park first, then send on channel 0
                Nop,
                Nop,
                Send { chan: Mp(0), src: Imm(5) },
                Ret,
                // p2: a later send on channel 1 must find no stale waiter
                Send { chan: Mp(1), src: Imm(6) },
                Ret,
            ],
            vec![TypeDesc::scalar(3), TypeDesc::scalar(0)],
            vec![DataInit::Nil, DataInit::Nil, DataInit::Word(-1), DataInit::Word(-1)],
        ),
    );
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    let stats = vm.run();

    assert_eq!(data(&vm, 2), Value::Word(0));
    assert_eq!(data(&vm, 3), Value::Word(5));
    // p2 is parked on a channel whose alt registration was cleared; it
    // must block, not rendezvous with a ghost.
    assert_eq!(stats.deadlocked, 1);
    assert_eq!(vm.blocked_threads(), 1);
}

#[test]
fn test_nbalt_takes_else_branch_instead_of_blocking() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let entries: Arc<[AltEntry]> = vec![recv(Mp(0), Fp(0))].into();
    let vm = run_main(image(
        vec![
            Newc { kind: ValueKind::Word, dst: Mp(0) },
            Nbalt { entries, dst: Fp(1), else_pc: 3 },
            Movw { src: Imm(111), dst: Mp(1) },
            Movw { src: Imm(222), dst: Mp(1) },
            Ret,
        ],
        vec![TypeDesc::scalar(2)],
        vec![DataInit::Nil, DataInit::Nil],
    ));

    assert_eq!(data(&vm, 1), Value::Word(222));
    assert_eq!(vm.live_threads(), 0);
}

#[test]
fn test_alt_send_entry_committed_by_receiver() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let entries: Arc<[AltEntry]> = vec![send(Mp(0), Imm(7))].into();
    let mut source = MapSource::new();
    source.insert(
        "main",
        image(
            vec![
                Newc { kind: ValueKind::Word, dst: Mp(0) },
                Frame { desc: 1, dst: Fp(0) },
                Spawn { frame: Fp(0), target: 7 },
                Nop,
                Nop,
                Recv { chan: Mp(0), dst: Mp(2) },
                Ret,
                // blocks on the alt, then reports the chosen index
                Alt { entries, dst: Fp(1) },
                Movw { src: Fp(1), dst: Mp(1) },
                Ret,
            ],
            vec![TypeDesc::scalar(1), TypeDesc::scalar(2)],
            vec![DataInit::Nil, DataInit::Word(-1), DataInit::Nil],
        ),
    );
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    let stats = vm.run();

    // The plain receiver commits the parked send entry: it gets the
    // value, the alternation resumes with entry index 0.
    assert_eq!(data(&vm, 2), Value::Word(7));
    assert_eq!(data(&vm, 1), Value::Word(0));
    assert_eq!(stats.deadlocked, 0);
    assert_eq!(vm.live_threads(), 0);
}

// === Frames and calls ===

#[test]
fn test_call_restores_caller_locals_and_pc() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Movw { src: Imm(41), dst: Fp(0) },
            Frame { desc: 1, dst: Fp(1) },
            Call { frame: Fp(1), target: 5 },
            Addw { src: Imm(1), mid: Fp(0), dst: Mp(0) },
            Ret,
            // callee writes its own slot 0, which must not leak back
            Movw { src: Imm(999), dst: Fp(0) },
            Ret,
        ],
        vec![TypeDesc::scalar(2), TypeDesc::scalar(1)],
        vec![DataInit::Nil],
    ));

    assert_eq!(data(&vm, 0), Value::Word(42));
    assert_eq!(vm.pending_frames(), 0);
}

#[test]
fn test_nested_calls_restore_frames_in_order() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Frame { desc: 1, dst: Fp(0) },
            Movw { src: Imm(11), dst: Fp(1) },
            Call { frame: Fp(0), target: 5 },
            Movw { src: Fp(1), dst: Mp(0) },
            Ret,
            // mid: calls one level deeper, its local must survive
            Movw { src: Imm(22), dst: Fp(1) },
            Frame { desc: 1, dst: Fp(0) },
            Call { frame: Fp(0), target: 11 },
            Movw { src: Fp(1), dst: Mp(1) },
            Ret,
            Nop,
            // inner: scribbles on its own slots only
            Movw { src: Imm(999), dst: Fp(1) },
            Movw { src: Imm(33), dst: Mp(2) },
            Ret,
        ],
        vec![TypeDesc::scalar(2), TypeDesc::scalar(2)],
        vec![DataInit::Nil, DataInit::Nil, DataInit::Nil],
    ));

    // Each return restores the most recent caller: mid sees 22 after
    // the inner call, the entry frame sees 11 after mid.
    assert_eq!(data(&vm, 2), Value::Word(33));
    assert_eq!(data(&vm, 1), Value::Word(22));
    assert_eq!(data(&vm, 0), Value::Word(11));
    assert_eq!(vm.pending_frames(), 0);
    assert_eq!(vm.live_threads(), 0);
}

#[test]
fn test_consuming_a_frame_twice_faults() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Frame { desc: 1, dst: Fp(0) },
            // Raw slot copy duplicates the handle, not the frame.
            Movm { src: Fp(0), dst: Fp(1), len: 1 },
            Call { frame: Fp(0), target: 6 },
            Call { frame: Fp(1), target: 6 },
            Movw { src: Imm(1), dst: Mp(0) },
            Ret,
            Ret,
        ],
        vec![TypeDesc::scalar(2), TypeDesc::scalar(0)],
        vec![DataInit::Nil],
    ));

    // The second call faults; the store after it never runs.
    assert_eq!(data(&vm, 0), Value::Nil);
    assert_eq!(vm.live_threads(), 0);
}

#[test]
fn test_spawned_thread_faults_alone() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Frame { desc: 1, dst: Fp(0) },
            Spawn { frame: Fp(0), target: 4 },
            Movw { src: Imm(5), dst: Mp(0) },
            Ret,
            // child divides by zero and dies; parent is unaffected
            Divw { src: Imm(0), mid: Imm(1), dst: Fp(0) },
            Movw { src: Imm(9), dst: Mp(1) },
            Ret,
        ],
        vec![TypeDesc::scalar(1), TypeDesc::scalar(1)],
        vec![DataInit::Nil, DataInit::Nil],
    ));

    assert_eq!(data(&vm, 0), Value::Word(5));
    assert_eq!(data(&vm, 1), Value::Nil);
    assert_eq!(vm.live_threads(), 0);
}

// === Module loading ===

fn lib_image() -> ModuleImage {
    use Instruction::*;
    use Operand::*;
    ModuleImage {
        name: "lib".into(),
        code: vec![Addw { src: Imm(1), mid: Mp(0), dst: Mp(0) }, Ret].into(),
        descs: vec![TypeDesc::scalar(0)],
        data: vec![DataInit::Word(0)],
        exports: vec![Export { name: "f".into(), sig: 0xab, pc: 0, frame_desc: 0 }],
        link_descs: Vec::new(),
        entry: None,
    }
}

#[test]
fn test_load_is_atomic_and_mcall_goes_through_the_table() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let mut main = image(
        vec![
            Load { path: Mp(0), desc: 0, dst: Mp(1) },
            Load { path: Mp(0), desc: 1, dst: Mp(2) },
            Mframe { module: Mp(2), index: Imm(0), dst: Fp(0) },
            Mcall { frame: Fp(0), index: Imm(0), module: Mp(2) },
            Ret,
        ],
        vec![TypeDesc::scalar(1)],
        vec![DataInit::Str("lib".into()), DataInit::Word(-1), DataInit::Nil],
    );
    main.link_descs = vec![
        // One import resolves, one does not: the whole load must fail.
        vec![Import { name: "f".into(), sig: 0xab }, Import { name: "x".into(), sig: 0x33 }],
        vec![Import { name: "f".into(), sig: 0xab }],
    ];
    let mut source = MapSource::new();
    source.insert("main", main);
    source.insert("lib", lib_image());
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    vm.run();

    assert_eq!(data(&vm, 1), Value::Nil);
    assert!(matches!(data(&vm, 2), Value::Module(_)));
    let lib = vm.instance("lib").unwrap();
    assert_eq!(vm.data_slot(lib, 0), Some(&Value::Word(1)));
    assert_eq!(vm.live_threads(), 0);
}

#[test]
fn test_repeated_loads_share_one_instance() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let mut main = image(
        vec![
            Load { path: Mp(0), desc: 0, dst: Mp(1) },
            Load { path: Mp(0), desc: 0, dst: Mp(2) },
            Mframe { module: Mp(1), index: Imm(0), dst: Fp(0) },
            Mcall { frame: Fp(0), index: Imm(0), module: Mp(1) },
            Mframe { module: Mp(2), index: Imm(0), dst: Fp(0) },
            Mcall { frame: Fp(0), index: Imm(0), module: Mp(2) },
            Ret,
        ],
        vec![TypeDesc::scalar(1)],
        vec![DataInit::Str("lib".into()), DataInit::Nil, DataInit::Nil],
    );
    main.link_descs = vec![vec![Import { name: "f".into(), sig: 0xab }]];
    let mut source = MapSource::new();
    source.insert("main", main);
    source.insert("lib", lib_image());
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    vm.run();

    // Both handles address the same data segment.
    let lib = vm.instance("lib").unwrap();
    assert_eq!(vm.data_slot(lib, 0), Some(&Value::Word(2)));
    assert_eq!(vm.registry().cached(), 2);
}

#[test]
fn test_mcall_with_bad_index_faults() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let mut main = image(
        vec![
            Load { path: Mp(0), desc: 0, dst: Mp(1) },
            Mframe { module: Mp(1), index: Imm(7), dst: Fp(0) },
            Movw { src: Imm(1), dst: Mp(2) },
            Ret,
        ],
        vec![TypeDesc::scalar(1)],
        vec![DataInit::Str("lib".into()), DataInit::Nil, DataInit::Nil],
    );
    main.link_descs = vec![vec![Import { name: "f".into(), sig: 0xab }]];
    let mut source = MapSource::new();
    source.insert("main", main);
    source.insert("lib", lib_image());
    let mut vm = Vm::new(source);
    vm.boot("main").unwrap();
    vm.run();

    assert_eq!(data(&vm, 2), Value::Nil);
    assert_eq!(vm.live_threads(), 0);
}

// === Heap data ===

#[test]
fn test_movp_retains_and_overwrite_releases() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Movp { src: Mp(0), dst: Fp(0) },
            Movw { src: Imm(1), dst: Fp(0) },
            Ret,
        ],
        vec![TypeDesc::scalar(1)],
        vec![DataInit::Str("abc".into())],
    ));

    let Value::Str(h) = data(&vm, 0) else { panic!("expected string") };
    assert_eq!(vm.heap().refcount(h), Some(1));
    assert_eq!(vm.heap().live(), 1);
}

#[test]
fn test_list_cons_head_tail() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Cons { kind: ValueKind::Word, src: Imm(1), dst: Mp(0) },
            Cons { kind: ValueKind::Word, src: Imm(2), dst: Mp(0) },
            Cons { kind: ValueKind::Word, src: Imm(3), dst: Mp(0) },
            Lenl { src: Mp(0), dst: Mp(1) },
            Head { kind: ValueKind::Word, src: Mp(0), dst: Mp(2) },
            Tail { src: Mp(0), dst: Mp(0) },
            Lenl { src: Mp(0), dst: Mp(3) },
            Ret,
        ],
        vec![TypeDesc::scalar(0)],
        vec![DataInit::Nil; 4],
    ));

    assert_eq!(data(&vm, 1), Value::Word(3));
    assert_eq!(data(&vm, 2), Value::Word(3));
    assert_eq!(data(&vm, 3), Value::Word(2));
    // Dropping the first cell left the two-cell tail alive.
    assert_eq!(vm.heap().live(), 2);
}

#[test]
fn test_arrays_addresses_and_strings() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Newa { len: Imm(3), dst: Mp(1) },
            Indw { arr: Mp(1), idx: Imm(1), dst: Fp(0) },
            Movw { src: Imm(42), dst: FpInd(0, 0) },
            Lena { src: Mp(1), dst: Mp(2) },
            Lenc { src: Mp(0), dst: Mp(3) },
            Addc { src: Mp(0), mid: Mp(0), dst: Mp(4) },
            Ret,
        ],
        vec![TypeDesc::scalar(1)],
        vec![DataInit::Str("hello".into()), DataInit::Nil, DataInit::Nil, DataInit::Nil, DataInit::Nil],
    ));

    let Value::Ref(arr) = data(&vm, 1) else { panic!("expected array") };
    assert_eq!(vm.heap().slot(arr, 1).unwrap(), &Value::Word(42));
    assert_eq!(vm.heap().slot(arr, 0).unwrap(), &Value::Nil);
    assert_eq!(data(&vm, 2), Value::Word(3));
    assert_eq!(data(&vm, 3), Value::Word(5));
    let Value::Str(h) = data(&vm, 4) else { panic!("expected string") };
    assert_eq!(vm.heap().str(h).unwrap(), "hellohello");
}

#[test]
fn test_out_of_bounds_array_index_faults() {
    init_logs();
    use Instruction::*;
    use Operand::*;
    let vm = run_main(image(
        vec![
            Newa { len: Imm(2), dst: Mp(0) },
            Indw { arr: Mp(0), idx: Imm(2), dst: Fp(0) },
            Movw { src: Imm(1), dst: Mp(1) },
            Ret,
        ],
        vec![TypeDesc::scalar(1)],
        vec![DataInit::Nil, DataInit::Nil],
    ));

    assert_eq!(data(&vm, 1), Value::Nil);
    assert_eq!(vm.live_threads(), 0);
}
