//! Per-kind code generators.
//!
//! Each generator emits the IR for one callback descriptor at the
//! current insertion point. Mirrors the `gen_*_cb` family of QEMU's
//! `accel/tcg/plugin-gen.c`.

use tcg_core::{Context, MemInfo, TempIdx, Type};

use crate::callback::{CallbackDescriptor, CbFlags, CondCb, InlineCb, RegularCb};
use crate::scoreboard::ScoreboardRef;
use crate::vcpu::{HelperMemCbs, VcpuLayout};

/// Block-wide parameters shared by all generators.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GenEnv {
    pub layout: VcpuLayout,
    /// Index of the vCPU translating, folded when not parallel.
    pub cpu_index: u32,
    pub parallel: bool,
}

/// Address operand and access info of a memory callback site.
pub(crate) type MemSite = (TempIdx, MemInfo);

fn gen_cpu_index(ir: &mut Context, g: &GenEnv) -> TempIdx {
    if !g.parallel {
        return ir.new_const(Type::I64, g.cpu_index as u64);
    }
    let env = ir.env();
    let t = ir.new_temp(Type::I64);
    ir.gen_ld32u(Type::I64, t, env, g.layout.cpu_index);
    t
}

/// Address of `entry` for the running vCPU.
fn gen_entry_addr(ir: &mut Context, g: &GenEnv, entry: &ScoreboardRef) -> TempIdx {
    if !g.parallel {
        assert!(
            g.cpu_index < entry.n_vcpus,
            "vCPU {} has no scoreboard slot",
            g.cpu_index
        );
    }
    let cpu = gen_cpu_index(ir, g);
    let addr = ir.new_temp(Type::I64);
    ir.gen_muli(Type::I64, addr, cpu, entry.element_size as u64);
    ir.gen_addi(Type::I64, addr, addr, entry.base + entry.offset as u64);
    addr
}

fn gen_cb_flags(ir: &mut Context, g: &GenEnv, flags: CbFlags) {
    let env = ir.env();
    let v = ir.new_const(Type::I32, flags as u64);
    ir.gen_st32(Type::I32, v, env, g.layout.cb_flags);
}

fn gen_udata_cb(ir: &mut Context, g: &GenEnv, cb: &RegularCb, mem: Option<MemSite>) {
    let cpu = gen_cpu_index(ir, g);
    let udata = ir.new_const(Type::I64, cb.user_data);
    let ret = ir.new_temp(Type::I64);

    gen_cb_flags(ir, g, cb.flags);
    let func = cb.target_fn as usize as u64;
    let call_flags = cb.flags.call_flags();
    match mem {
        Some((addr, info)) => {
            let addr = match ir.temp(addr).ty {
                Type::I64 => addr,
                Type::I32 => {
                    let t = ir.new_temp(Type::I64);
                    ir.gen_ext_u32_i64(t, addr)
                }
            };
            let info = ir.new_const(Type::I64, info.raw() as u64);
            ir.gen_call_flags(ret, func, call_flags, &[cpu, info, addr, udata]);
        }
        None => {
            ir.gen_call_flags(ret, func, call_flags, &[cpu, udata]);
        }
    }
    gen_cb_flags(ir, g, CbFlags::NoRegs);
}

fn gen_udata_cond_cb(ir: &mut Context, g: &GenEnv, cb: &CondCb, mem: Option<MemSite>) {
    let addr = gen_entry_addr(ir, g, &cb.entry);
    let val = ir.new_temp(Type::I64);
    ir.gen_ld(Type::I64, val, addr, 0);

    let skip = ir.new_label();
    ir.gen_brcondi(Type::I64, val, cb.imm, cb.cond.to_cond().invert(), skip);
    gen_udata_cb(ir, g, &cb.regular, mem);
    ir.gen_set_label(skip);
}

fn gen_inline_add_u64_cb(ir: &mut Context, g: &GenEnv, cb: &InlineCb) {
    let addr = gen_entry_addr(ir, g, &cb.entry);
    let val = ir.new_temp(Type::I64);
    ir.gen_ld(Type::I64, val, addr, 0);
    ir.gen_addi(Type::I64, val, val, cb.imm);
    ir.gen_st(Type::I64, val, addr, 0);
}

fn gen_inline_store_u64_cb(ir: &mut Context, g: &GenEnv, cb: &InlineCb) {
    let addr = gen_entry_addr(ir, g, &cb.entry);
    let val = ir.new_const(Type::I64, cb.imm);
    ir.gen_st(Type::I64, val, addr, 0);
}

/// Emit the code for one descriptor. Temps it needs are released
/// once it is emitted.
pub(crate) fn gen_callback(
    ir: &mut Context,
    g: &GenEnv,
    cb: &CallbackDescriptor,
    mem: Option<MemSite>,
) {
    ir.temp_scope(|ir| match cb {
        CallbackDescriptor::Regular(cb) => gen_udata_cb(ir, g, cb, mem),
        CallbackDescriptor::Conditional(cb) => gen_udata_cond_cb(ir, g, cb, mem),
        CallbackDescriptor::InlineAdd(cb) => gen_inline_add_u64_cb(ir, g, cb),
        CallbackDescriptor::InlineStore(cb) => gen_inline_store_u64_cb(ir, g, cb),
    });
}

/// Publish `cbs` to helpers called by the current instruction.
pub(crate) fn gen_enable_mem_helper(ir: &mut Context, g: &GenEnv, cbs: &HelperMemCbs) {
    let env = ir.env();
    let ptr = ir.new_const(Type::I64, cbs.as_raw());
    ir.gen_st(Type::I64, ptr, env, g.layout.mem_cbs);
}

pub(crate) fn gen_disable_mem_helper(ir: &mut Context, g: &GenEnv) {
    let env = ir.env();
    let zero = ir.new_const(Type::I64, 0);
    ir.gen_st(Type::I64, zero, env, g.layout.mem_cbs);
}
