//! Translation loop tests: instruction fetch, page locking, block
//! termination and the retry after a fetch fault.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tcg_core::interp::InterpExit;
use tcg_core::tb::cflags::{CF_COUNT_MASK, CF_SINGLE_STEP};
use tcg_core::{Context, MemRw, Opcode};
use tcg_frontend::{
    translator_ldl, translator_ldq, translator_ldub, translator_lduw, DisasContextBase,
    FetchFault,
};
use tcg_plugin::{CbFlags, InlineOp, PluginGen, Scoreboard};

use crate::toy::{self, count_cb, udata, ToyCode, ToyCpu, ToyMem, OP_ADDI};

const PAGE: u64 = 16;
const BASE: u64 = 0x100;

fn nops(n: usize) -> Vec<Vec<u8>> {
    vec![toy::nop(); n]
}

// ── translator_ld* ────────────────────────────────────────────

#[test]
fn loads_are_little_endian_and_span_pages() {
    let mut code = ToyCode::new(PAGE);
    code.load(0x10C, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let mut db = DisasContextBase::new(0x10C, 0, 0);

    assert_eq!(translator_ldub(&mut db, &code, 0x10C), Ok(1));
    assert_eq!(translator_lduw(&mut db, &code, 0x10C), Ok(0x0201));
    assert_eq!(translator_ldl(&mut db, &code, 0x10E), Ok(0x0605_0403));
    assert_eq!(translator_ldq(&mut db, &code, 0x10C), Ok(0x0807_0605_0403_0201));
    assert_eq!(db.locked_pages(), &[0x100, 0x110]);
    // Each page is locked once per attempt.
    assert_eq!(code.lock_calls(), 2);
    assert_eq!(code.lock_count(0x110), 1);
    // Nothing is recorded unless the block is instrumented.
    assert!(db.record.is_empty());
}

#[test]
fn instrumented_fetches_are_recorded() {
    let mut code = ToyCode::new(PAGE);
    code.load(BASE, &[0xAB, 0xCD, 0xEF]);
    let mut db = DisasContextBase::new(BASE, 0, 0);
    db.plugin_enabled = true;
    translator_ldub(&mut db, &code, BASE).unwrap();
    translator_lduw(&mut db, &code, BASE + 1).unwrap();
    assert_eq!(db.record, [0xAB, 0xCD, 0xEF]);
}

#[test]
fn fetch_on_the_last_page() {
    let top = u64::MAX - (PAGE - 1);
    let mut code = ToyCode::new(PAGE);
    code.load(u64::MAX - 7, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let mut db = DisasContextBase::new(u64::MAX - 7, 0, 0);
    assert_eq!(translator_ldq(&mut db, &code, u64::MAX - 7), Ok(0x0807_0605_0403_0201));
    assert_eq!(translator_ldub(&mut db, &code, u64::MAX), Ok(8));
    assert_eq!(db.locked_pages(), &[top]);

    code.load(top, &toy::program(&[toy::nop(), toy::exit()]));
    let mut ir = Context::new();
    let mut plugin = toy::plugin_gen(|_| {});
    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, top, 0).unwrap();
    assert_eq!((tb.icount, tb.size), (2, 2));
}

#[test]
fn fault_reports_address() {
    let code = ToyCode::new(PAGE);
    let mut db = DisasContextBase::new(0x230, 0, 0);
    let fault = translator_ldub(&mut db, &code, 0x230).unwrap_err();
    assert_eq!(fault, FetchFault::Unmapped { addr: 0x230 });
    assert_eq!(fault.addr(), 0x230);
    assert_eq!(fault.to_string(), "no code mapped at 0x230");
    assert!(db.locked_pages().is_empty());

    let fault = FetchFault::NotExecutable { addr: 0x40 };
    assert_eq!(fault.addr(), 0x40);
    assert_eq!(fault.to_string(), "code at 0x40 is not executable");
}

// ── Whole blocks ──────────────────────────────────────────────

#[test]
fn insn_straddling_pages_is_captured_whole() {
    crate::init_tracing();
    let mut insns = nops(14);
    insns.push(toy::addi(1, 5));
    insns.push(toy::exit());
    let mut code = ToyCode::new(PAGE);
    code.load(BASE, &toy::program(&insns));

    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let mut ir = Context::new();
    let mut plugin = toy::plugin_gen(move |tb| {
        let insn = tb.insn(14);
        assert_eq!(insn.vaddr(), BASE + 14);
        assert_eq!(insn.data(), &[OP_ADDI, 1, 5]);
        assert_eq!(tb.insn(15).data(), &[toy::OP_EXIT]);
        assert_eq!(tb.size(), 18);
        s.fetch_add(1, Ordering::Relaxed);
    });
    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, BASE, 0).unwrap();

    assert_eq!(seen.load(Ordering::Relaxed), 1);
    assert_eq!((tb.icount, tb.size), (16, 18));
    assert_eq!(code.lock_calls(), 2);
    assert!(code.all_unlocked());

    let mut cpu = ToyCpu::new(0);
    assert_eq!(toy::run(&ir, &mut cpu, &mut ToyMem::default()), InterpExit::ExitTb(0));
    assert_eq!(cpu.regs[1], 5);
    assert_eq!(cpu.pc, BASE + 18);
}

#[test]
fn fault_after_first_insn_truncates_block() {
    // The ADDI at 0x10E needs its operands from the unmapped page 0x110.
    let mut insns = nops(14);
    insns.push(vec![OP_ADDI, 1]);
    let mut code = ToyCode::new(PAGE);
    code.load(BASE, &toy::program(&insns));

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let mut ir = Context::new();
    let mut plugin = toy::plugin_gen(move |tb| {
        assert_eq!(tb.n_insns(), 14);
        c.fetch_add(1, Ordering::Relaxed);
    });
    let (tb, out) = toy::translate(&mut ir, &mut plugin, &code, BASE, 0).unwrap();

    assert_eq!((tb.icount, tb.size), (14, 14));
    assert_eq!(out.stats.insns, 14);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    // One lock of page 0x100 per attempt.
    assert_eq!(code.lock_calls(), 2);
    assert!(code.all_unlocked());
    assert!(ir.ops().any(|op| op.opc == Opcode::GotoTb));

    let mut cpu = ToyCpu::new(0);
    assert_eq!(toy::run(&ir, &mut cpu, &mut ToyMem::default()), InterpExit::ExitTb(0));
    assert_eq!(cpu.pc, BASE + 14);
}

#[test]
fn fault_on_first_insn_is_returned() {
    let mut code = ToyCode::new(PAGE);
    code.load(0x10F, &[OP_ADDI]);
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let mut ir = Context::new();
    let mut plugin = toy::plugin_gen(move |_| {
        c.fetch_add(1, Ordering::Relaxed);
    });

    let err = toy::translate(&mut ir, &mut plugin, &code, 0x300, 0).unwrap_err();
    assert_eq!(err, FetchFault::Unmapped { addr: 0x300 });

    let err = toy::translate(&mut ir, &mut plugin, &code, 0x10F, 0).unwrap_err();
    assert_eq!(err, FetchFault::Unmapped { addr: 0x110 });

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert!(!plugin.is_active());
    assert!(code.all_unlocked());

    // The driver is usable again after a failed block.
    code.load(0x400, &toy::exit());
    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, 0x400, 0).unwrap();
    assert_eq!(tb.icount, 1);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn full_op_buffer_ends_block() {
    let mut code = ToyCode::new(4096);
    code.load(BASE, &toy::program(&nops(32)));
    let mut ir = Context::new();
    ir.set_max_ops(5);
    let mut plugin = PluginGen::disabled();
    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, BASE, 0).unwrap();
    assert_eq!(tb.icount, 5);
    assert!(ir.ops().any(|op| op.opc == Opcode::GotoTb));
}

#[test]
fn count_limit_and_single_step() {
    let mut code = ToyCode::new(4096);
    code.load(BASE, &toy::program(&nops(32)));
    let mut ir = Context::new();
    let mut plugin = PluginGen::disabled();

    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, BASE, 3 & CF_COUNT_MASK).unwrap();
    assert_eq!((tb.icount, tb.size), (3, 3));

    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, BASE, CF_SINGLE_STEP).unwrap();
    assert_eq!(tb.icount, 1);
    let mut cpu = ToyCpu::new(0);
    toy::run(&ir, &mut cpu, &mut ToyMem::default());
    assert_eq!(cpu.pc, BASE + 1);
}

#[test]
fn illegal_opcode_exits_at_insn() {
    let mut code = ToyCode::new(4096);
    code.load(BASE, &toy::program(&[toy::nop(), vec![0xFF], toy::nop()]));
    let mut ir = Context::new();
    let mut plugin = toy::plugin_gen(|_| {});
    let (tb, _) = toy::translate(&mut ir, &mut plugin, &code, BASE, 0).unwrap();
    assert_eq!((tb.icount, tb.size), (2, 2));

    let mut cpu = ToyCpu::new(0);
    assert_eq!(toy::run(&ir, &mut cpu, &mut ToyMem::default()), InterpExit::ExitTb(3));
    assert_eq!(cpu.pc, BASE + 1);
}

#[test]
fn instrumentation_preserves_guest_state() {
    let prog = toy::program(&[
        toy::addi(1, 0x20),
        toy::ld(2, 1),
        toy::addi(2, 7),
        toy::st(2, 1),
        toy::helper(2),
        toy::addi(3, -1),
        toy::exit(),
    ]);
    let mut code = ToyCode::new(4096);
    code.load(BASE, &prog);

    let run = |ir: &Context| {
        let mut cpu = ToyCpu::new(0);
        let mut mem = ToyMem::default();
        mem.write_u64(0x20, 100);
        let exit = toy::run(ir, &mut cpu, &mut mem);
        (exit, cpu.regs, cpu.pc, mem.read_u64(0x20))
    };

    let mut plain = Context::new();
    toy::translate(&mut plain, &mut PluginGen::disabled(), &code, BASE, 0).unwrap();
    let expected = run(&plain);
    assert_eq!(expected.1[2], 107);
    assert_eq!(expected.1[0], 108);
    assert_eq!(expected.3, 107);

    let sb = Scoreboard::<u64>::new(1);
    let accesses = sb.u64_field(0).unwrap();
    let count = Arc::new(AtomicU64::new(0));
    let u = udata(&count);
    let mut ir = Context::new();
    let mut plugin = toy::plugin_gen(move |tb| {
        tb.register_exec_cb(count_cb, CbFlags::RwRegs, u);
        for insn in tb.insns_mut() {
            insn.register_exec_cb(count_cb, CbFlags::RRegs, u);
            insn.register_mem_inline(MemRw::RW, InlineOp::AddU64, accesses, 1)
                .unwrap();
        }
    });
    toy::translate(&mut ir, &mut plugin, &code, BASE, 0).unwrap();

    assert_eq!(run(&ir), expected);
    assert_eq!(count.load(Ordering::Relaxed), 1 + 7);
    // ld, st and the helper's reported read.
    assert_eq!(sb.sum_u64(accesses), 3);
}
