use std::collections::HashMap;

use tcg_core::interp::{GuestMemory, Interp, InterpExit};
use tcg_core::{Cond, Context, MemOp, TempIdx, Type};

#[derive(Default)]
struct FlatMem(HashMap<u64, u8>);

impl GuestMemory for FlatMem {
    fn read(&mut self, addr: u64, size: u32) -> u64 {
        (0..size as u64).fold(0, |v, i| {
            v | (*self.0.get(&(addr + i)).unwrap_or(&0) as u64) << (8 * i)
        })
    }

    fn write(&mut self, addr: u64, size: u32, val: u64) {
        for i in 0..size as u64 {
            self.0.insert(addr + i, (val >> (8 * i)) as u8);
        }
    }
}

#[repr(C)]
#[derive(Default)]
struct State {
    a: u64,
    b: u64,
    w: u32,
    pad: u32,
}

struct Fixture {
    ctx: Context,
    env: TempIdx,
    a: TempIdx,
    b: TempIdx,
}

fn fixture() -> Fixture {
    let mut ctx = Context::new();
    let env = ctx.new_fixed(Type::I64, 5, "env");
    ctx.set_env(env);
    let a = ctx.new_global(Type::I64, env, 0, "a");
    let b = ctx.new_global(Type::I64, env, 8, "b");
    Fixture { ctx, env, a, b }
}

fn run(f: &Fixture, st: &mut State, mem: &mut FlatMem) -> InterpExit {
    let mut interp = Interp::new(&f.ctx);
    interp.set(f.env, st as *mut State as u64);
    unsafe { interp.run(mem) }
}

#[test]
fn globals_live_in_cpu_state() {
    let mut f = fixture();
    let (a, b) = (f.a, f.b);
    let t = f.ctx.new_temp(Type::I64);
    f.ctx.gen_addi(Type::I64, t, a, 5);
    f.ctx.gen_muli(Type::I64, b, t, 3);
    f.ctx.gen_exit_tb(9);

    let mut st = State { a: 2, ..State::default() };
    assert_eq!(run(&f, &mut st, &mut FlatMem::default()), InterpExit::ExitTb(9));
    assert_eq!(st.b, 21);
}

#[test]
fn i32_ops_truncate() {
    let mut f = fixture();
    let a = f.a;
    let t = f.ctx.new_temp(Type::I32);
    let one = f.ctx.new_const(Type::I32, 1);
    f.ctx.gen_movi(Type::I32, t, 0xFFFF_FFFF);
    f.ctx.gen_add(Type::I32, t, t, one);
    f.ctx.gen_ext_u32_i64(a, t);

    let mut st = State { a: 77, ..State::default() };
    assert_eq!(run(&f, &mut st, &mut FlatMem::default()), InterpExit::End);
    assert_eq!(st.a, 0);
}

#[test]
fn alu_ops_and_conversions() {
    let mut f = fixture();
    let (a, b) = (f.a, f.b);
    let ctx = &mut f.ctx;
    let i64t = |ctx: &mut Context| ctx.new_temp(Type::I64);

    let sub = i64t(ctx);
    ctx.gen_sub(Type::I64, sub, a, b);
    let and = i64t(ctx);
    ctx.gen_and(Type::I64, and, a, b);
    let or = i64t(ctx);
    ctx.gen_or(Type::I64, or, a, b);
    let xor = i64t(ctx);
    ctx.gen_xor(Type::I64, xor, a, b);
    let shl = i64t(ctx);
    ctx.gen_shl(Type::I64, shl, a, b);
    let neg = i64t(ctx);
    ctx.gen_neg(Type::I64, neg, b);
    let not = i64t(ctx);
    ctx.gen_not(Type::I64, not, a);
    let shr = i64t(ctx);
    ctx.gen_shr(Type::I64, shr, neg, b);
    let sar = i64t(ctx);
    ctx.gen_sar(Type::I64, sar, neg, b);
    let lt = i64t(ctx);
    ctx.gen_setcond(Type::I64, lt, neg, a, Cond::Lt);
    let ltu = i64t(ctx);
    ctx.gen_setcond(Type::I64, ltu, neg, a, Cond::Ltu);

    let n32 = ctx.new_temp(Type::I32);
    ctx.gen_extrl_i64_i32(n32, neg);
    let sar32 = ctx.new_temp(Type::I32);
    ctx.gen_sar(Type::I32, sar32, n32, b);
    let sx = i64t(ctx);
    ctx.gen_ext_i32_i64(sx, n32);
    ctx.gen_discard(Type::I32, n32);

    let mut interp = Interp::new(&f.ctx);
    let mut st = State { a: 0xF0, b: 3, ..State::default() };
    interp.set(f.env, &mut st as *mut State as u64);
    assert_eq!(unsafe { interp.run(&mut FlatMem::default()) }, InterpExit::End);

    assert_eq!(interp.get(sub), 0xED);
    assert_eq!(interp.get(and), 0);
    assert_eq!(interp.get(or), 0xF3);
    assert_eq!(interp.get(xor), 0xF3);
    assert_eq!(interp.get(shl), 0x780);
    assert_eq!(interp.get(neg), (-3i64) as u64);
    assert_eq!(interp.get(not), !0xF0u64);
    assert_eq!(interp.get(shr), ((-3i64) as u64) >> 3);
    assert_eq!(interp.get(sar), u64::MAX);
    assert_eq!(interp.get(lt), 1);
    assert_eq!(interp.get(ltu), 0);
    assert_eq!(interp.get(n32), 0xFFFF_FFFD);
    assert_eq!(interp.get(sar32), 0xFFFF_FFFF);
    assert_eq!(interp.get(sx), (-3i64) as u64);
}

#[test]
fn narrow_host_accesses() {
    let mut f = fixture();
    let (env, a) = (f.env, f.a);
    let t = f.ctx.new_temp(Type::I64);
    f.ctx.gen_movi(Type::I64, t, (-3i64) as u64);
    f.ctx.gen_st16(Type::I64, t, env, 16);
    f.ctx.gen_st8(Type::I64, a, env, 20);
    let s16 = f.ctx.new_temp(Type::I64);
    f.ctx.gen_ld16s(Type::I64, s16, env, 16);
    let u16_ = f.ctx.new_temp(Type::I64);
    f.ctx.gen_ld16u(Type::I64, u16_, env, 16);
    let u8_ = f.ctx.new_temp(Type::I64);
    f.ctx.gen_ld8u(Type::I64, u8_, env, 20);
    let s32 = f.ctx.new_temp(Type::I64);
    f.ctx.gen_ld32s(Type::I64, s32, env, 16);

    let mut interp = Interp::new(&f.ctx);
    let mut st = State { a: 0x1F0, ..State::default() };
    interp.set(env, &mut st as *mut State as u64);
    unsafe { interp.run(&mut FlatMem::default()) };

    assert_eq!((st.w, st.pad), (0xFFFD, 0xF0));
    assert_eq!(interp.get(s16), (-3i64) as u64);
    assert_eq!(interp.get(u16_), 0xFFFD);
    assert_eq!(interp.get(u8_), 0xF0);
    assert_eq!(interp.get(s32), 0xFFFD);
}

#[test]
fn host_loads_and_stores() {
    let mut f = fixture();
    let env = f.env;
    let t = f.ctx.new_temp(Type::I64);
    f.ctx.gen_ld32u(Type::I64, t, env, 16);
    f.ctx.gen_addi(Type::I64, t, t, 1);
    f.ctx.gen_st(Type::I64, t, env, 8);
    f.ctx.gen_ld8s(Type::I64, t, env, 16);
    f.ctx.gen_st(Type::I64, t, env, 0);

    let mut st = State { w: 0xFF, ..State::default() };
    run(&f, &mut st, &mut FlatMem::default());
    assert_eq!(st.b, 0x100);
    assert_eq!(st.a, u64::MAX);
}

#[test]
fn brcond_selects_path() {
    let mut f = fixture();
    let (a, b) = (f.a, f.b);
    let skip = f.ctx.new_label();
    f.ctx.gen_brcondi(Type::I64, a, 10, Cond::Ltu, skip);
    f.ctx.gen_movi(Type::I64, b, 1);
    f.ctx.gen_exit_tb(1);
    f.ctx.gen_set_label(skip);
    f.ctx.gen_movi(Type::I64, b, 2);
    f.ctx.gen_exit_tb(2);

    let mut st = State { a: 3, ..State::default() };
    assert_eq!(run(&f, &mut st, &mut FlatMem::default()), InterpExit::ExitTb(2));
    assert_eq!(st.b, 2);

    let mut st = State { a: 30, ..State::default() };
    assert_eq!(run(&f, &mut st, &mut FlatMem::default()), InterpExit::ExitTb(1));
    assert_eq!(st.b, 1);
}

#[test]
fn backward_branch_loops() {
    let mut f = fixture();
    let (a, b) = (f.a, f.b);
    let top = f.ctx.new_label();
    f.ctx.gen_set_label(top);
    f.ctx.gen_addi(Type::I64, b, b, 2);
    f.ctx.gen_addi(Type::I64, a, a, (-1i64) as u64);
    f.ctx.gen_brcondi(Type::I64, a, 0, Cond::Ne, top);

    let mut st = State { a: 4, ..State::default() };
    run(&f, &mut st, &mut FlatMem::default());
    assert_eq!(st.b, 8);
}

#[test]
fn guest_memory_access() {
    let mut f = fixture();
    let (a, b) = (f.a, f.b);
    f.ctx.gen_qemu_ld(Type::I64, b, a, MemOp::sw());
    let t = f.ctx.new_temp(Type::I64);
    f.ctx.gen_addi(Type::I64, t, a, 8);
    f.ctx.gen_qemu_st(Type::I64, b, t, MemOp::ul());

    let mut mem = FlatMem::default();
    mem.write(0x100, 2, 0x8001);
    let mut st = State { a: 0x100, ..State::default() };
    run(&f, &mut st, &mut mem);
    assert_eq!(st.b, 0xFFFF_FFFF_FFFF_8001);
    assert_eq!(mem.read(0x108, 8), 0xFFFF_8001);
}

extern "C" fn add3(a: u64, b: u64, c: u64, _: u64, _: u64, _: u64) -> u64 {
    a + b + c
}

#[test]
fn helper_call() {
    let mut f = fixture();
    let (a, b) = (f.a, f.b);
    let c = f.ctx.new_const(Type::I64, 100);
    f.ctx.gen_call(b, add3 as usize as u64, &[a, a, c]);

    let mut st = State { a: 7, ..State::default() };
    run(&f, &mut st, &mut FlatMem::default());
    assert_eq!(st.b, 114);
}

#[test]
fn goto_tb_falls_through_to_exit() {
    let mut f = fixture();
    f.ctx.gen_goto_tb(0);
    f.ctx.gen_exit_tb(4);
    let mut st = State::default();
    assert_eq!(run(&f, &mut st, &mut FlatMem::default()), InterpExit::ExitTb(4));
}

#[test]
fn goto_ptr_returns_target() {
    let mut f = fixture();
    let a = f.a;
    f.ctx.gen_goto_ptr(a);
    let mut st = State { a: 0xdead, ..State::default() };
    assert_eq!(run(&f, &mut st, &mut FlatMem::default()), InterpExit::GotoPtr(0xdead));
}

#[test]
#[should_panic(expected = "unresolved instrumentation marker")]
fn unresolved_marker_panics() {
    let mut f = fixture();
    f.ctx.gen_plugin_cb(tcg_core::PluginCbFrom::FromTb);
    let mut st = State::default();
    run(&f, &mut st, &mut FlatMem::default());
}
