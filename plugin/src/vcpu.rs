//! Per-vCPU instrumentation state and the helper-side runtime.
//!
//! Generated code communicates with callbacks through three fields of
//! the CPU state reached from the env pointer: the vCPU index, the
//! register flags of the callback being run, and the memory callback
//! list published to helpers that perform guest accesses themselves.

use std::mem::offset_of;

use tcg_core::{MemInfo, Type};

use crate::callback::{CallbackDescriptor, CbFlags, RegularCb};

/// Instrumentation fields embedded in a CPU state structure.
#[derive(Debug, Default)]
#[repr(C)]
pub struct VcpuPluginState {
    pub cpu_index: u32,
    /// `CbFlags` of the callback currently running.
    pub cb_flags: u32,
    /// `*const HelperMemCbs`, or 0 when no helper tracking is live.
    pub mem_cbs: u64,
}

/// Offsets of the instrumentation fields from the env pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuLayout {
    pub cpu_index: i64,
    pub cb_flags: i64,
    pub mem_cbs: i64,
}

impl VcpuLayout {
    /// Layout of a [`VcpuPluginState`] placed `offset` bytes after env.
    pub const fn embedded_at(offset: i64) -> Self {
        Self {
            cpu_index: offset + offset_of!(VcpuPluginState, cpu_index) as i64,
            cb_flags: offset + offset_of!(VcpuPluginState, cb_flags) as i64,
            mem_cbs: offset + offset_of!(VcpuPluginState, mem_cbs) as i64,
        }
    }
}

impl Default for VcpuLayout {
    fn default() -> Self {
        Self::embedded_at(0)
    }
}

/// Memory callbacks of one instruction, published to helpers while that
/// instruction runs.
///
/// Generated code stores the address of this value in the env, so it
/// must stay alive as long as the block that references it may run.
#[derive(Debug)]
pub struct HelperMemCbs {
    cbs: Box<[CallbackDescriptor]>,
}

impl HelperMemCbs {
    pub fn new(cbs: Vec<CallbackDescriptor>) -> Self {
        Self {
            cbs: cbs.into_boxed_slice(),
        }
    }

    pub fn cbs(&self) -> &[CallbackDescriptor] {
        &self.cbs
    }

    /// Value stored into the env to publish this list.
    pub fn as_raw(&self) -> u64 {
        self as *const Self as u64
    }
}

unsafe fn env_field<T>(env: *mut u8, offset: i64) -> *mut T {
    env.wrapping_offset(offset as isize) as *mut T
}

unsafe fn call_regular(
    env: *mut u8,
    layout: &VcpuLayout,
    cb: &RegularCb,
    cpu_index: u32,
    vaddr: u64,
    info: MemInfo,
) {
    let flags = env_field::<u32>(env, layout.cb_flags);
    flags.write_unaligned(cb.flags as u32);
    (cb.target_fn)(cpu_index as u64, info.raw() as u64, vaddr, cb.user_data, 0, 0);
    flags.write_unaligned(CbFlags::NoRegs as u32);
}

/// Report a guest memory access performed inside a helper.
///
/// Dispatches the callbacks published by the enclosing instruction, if
/// any. Helpers call this after each access they make on the guest's
/// behalf.
///
/// Maps to QEMU's `qemu_plugin_vcpu_mem_cb`.
///
/// # Safety
/// `env` must point to CPU state laid out as `layout` describes, whose
/// `mem_cbs` field is 0 or the address of a live [`HelperMemCbs`]; every
/// scoreboard referenced by that list must be alive.
pub unsafe fn vcpu_mem_cb(env: *mut u8, layout: &VcpuLayout, vaddr: u64, info: MemInfo) {
    let raw = env_field::<u64>(env, layout.mem_cbs).read_unaligned();
    if raw == 0 {
        return;
    }
    let cbs = &*(raw as *const HelperMemCbs);
    let cpu_index = env_field::<u32>(env, layout.cpu_index).read_unaligned();

    for cb in cbs.cbs().iter().filter(|cb| cb.matches(info.rw())) {
        match cb {
            CallbackDescriptor::Regular(cb) => {
                call_regular(env, layout, cb, cpu_index, vaddr, info);
            }
            CallbackDescriptor::Conditional(cb) => {
                let val = cb.entry.read(cpu_index);
                if cb.cond.to_cond().eval(Type::I64, val, cb.imm) {
                    call_regular(env, layout, &cb.regular, cpu_index, vaddr, info);
                }
            }
            CallbackDescriptor::InlineAdd(cb) => {
                let val = cb.entry.read(cpu_index);
                cb.entry.write(cpu_index, val.wrapping_add(cb.imm));
            }
            CallbackDescriptor::InlineStore(cb) => {
                cb.entry.write(cpu_index, cb.imm);
            }
        }
    }
}
