//! Per-block instrumentation state.
//!
//! One [`InstrumentedBlock`] lives in each generation context and is
//! reused for every translation: instruction slots are kept across
//! blocks and only their contents are reset.

use tcg_core::{HelperFn, MemRw};

use crate::callback::{CallbackDescriptor, CbFlags, InlineOp, PluginCond, RegularCb};
use crate::scoreboard::ScoreboardRef;
use crate::PluginError;

/// Instrumentation view of one decoded guest instruction.
///
/// Maps to QEMU's `struct qemu_plugin_insn`.
#[derive(Debug, Default)]
pub struct InstrumentedInsn {
    vaddr: u64,
    len: u32,
    data: Vec<u8>,
    pub(crate) insn_cbs: Vec<CallbackDescriptor>,
    pub(crate) mem_cbs: Vec<CallbackDescriptor>,
    /// A helper with side effects is called by this instruction.
    pub(crate) calls_helpers: bool,
    /// Helper memory callbacks are published while this instruction runs.
    pub(crate) mem_helper: bool,
}

impl InstrumentedInsn {
    fn reset(&mut self, vaddr: u64) {
        self.vaddr = vaddr;
        self.len = 0;
        self.data.clear();
        self.insn_cbs.clear();
        self.mem_cbs.clear();
        self.calls_helpers = false;
        self.mem_helper = false;
    }

    /// Finalize length and raw bytes. `data` receives the previous
    /// capture buffer so its allocation is reused.
    pub(crate) fn finish(&mut self, len: u32, data: &mut Vec<u8>, calls_helpers: bool) {
        self.len = len;
        std::mem::swap(&mut self.data, data);
        data.clear();
        self.calls_helpers = calls_helpers;
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Length of the instruction in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw instruction bytes as fetched during decode.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn calls_helpers(&self) -> bool {
        self.calls_helpers
    }

    pub fn mem_helper(&self) -> bool {
        self.mem_helper
    }

    pub fn insn_cbs(&self) -> &[CallbackDescriptor] {
        &self.insn_cbs
    }

    pub fn mem_cbs(&self) -> &[CallbackDescriptor] {
        &self.mem_cbs
    }

    pub fn register_exec_cb(&mut self, f: HelperFn, flags: CbFlags, user_data: u64) {
        self.insn_cbs.push(CallbackDescriptor::Regular(RegularCb {
            target_fn: f,
            user_data,
            flags,
            rw: MemRw::NONE,
        }));
    }

    pub fn register_exec_cond_cb(
        &mut self,
        f: HelperFn,
        flags: CbFlags,
        cond: PluginCond,
        entry: ScoreboardRef,
        imm: u64,
        user_data: u64,
    ) {
        let regular = RegularCb {
            target_fn: f,
            user_data,
            flags,
            rw: MemRw::NONE,
        };
        self.insn_cbs
            .extend(CallbackDescriptor::conditional(regular, cond, entry, imm));
    }

    pub fn register_exec_inline(&mut self, op: InlineOp, entry: ScoreboardRef, imm: u64) {
        self.insn_cbs
            .push(CallbackDescriptor::inline(op, entry, imm, MemRw::NONE));
    }

    /// Call `f` on every guest memory access of this instruction whose
    /// direction intersects `rw`.
    pub fn register_mem_cb(
        &mut self,
        f: HelperFn,
        flags: CbFlags,
        rw: MemRw,
        user_data: u64,
    ) -> Result<(), PluginError> {
        if rw.is_empty() {
            return Err(PluginError::EmptyRwMask);
        }
        self.mem_cbs.push(CallbackDescriptor::Regular(RegularCb {
            target_fn: f,
            user_data,
            flags,
            rw,
        }));
        Ok(())
    }

    pub fn register_mem_inline(
        &mut self,
        rw: MemRw,
        op: InlineOp,
        entry: ScoreboardRef,
        imm: u64,
    ) -> Result<(), PluginError> {
        if rw.is_empty() {
            return Err(PluginError::EmptyRwMask);
        }
        self.mem_cbs.push(CallbackDescriptor::inline(op, entry, imm, rw));
        Ok(())
    }

    pub fn push_insn_cb(&mut self, cb: CallbackDescriptor) {
        self.insn_cbs.push(cb);
    }

    pub fn push_mem_cb(&mut self, cb: CallbackDescriptor) -> Result<(), PluginError> {
        if cb.rw().is_empty() {
            return Err(PluginError::EmptyRwMask);
        }
        self.mem_cbs.push(cb);
        Ok(())
    }
}

/// Instrumentation view of the block being translated.
///
/// Maps to QEMU's `struct qemu_plugin_tb`.
#[derive(Debug, Default)]
pub struct InstrumentedBlock {
    /// Grow-only slot arena; the first `n` entries are in use.
    insns: Vec<InstrumentedInsn>,
    n: usize,
    pub(crate) cbs: Vec<CallbackDescriptor>,
    pub(crate) mem_helper: bool,
    vaddr: u64,
    flags: u32,
}

impl InstrumentedBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&mut self, vaddr: u64, flags: u32) {
        self.n = 0;
        self.cbs.clear();
        self.mem_helper = false;
        self.vaddr = vaddr;
        self.flags = flags;
    }

    /// Claim the next instruction slot, reusing an old one if present.
    pub(crate) fn push_insn(&mut self, vaddr: u64) -> usize {
        if self.n == self.insns.len() {
            self.insns.push(InstrumentedInsn::default());
        }
        let idx = self.n;
        self.insns[idx].reset(vaddr);
        self.n += 1;
        idx
    }

    pub(crate) fn last_insn_mut(&mut self) -> &mut InstrumentedInsn {
        assert!(self.n > 0, "no instruction open");
        &mut self.insns[self.n - 1]
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn n_insns(&self) -> usize {
        self.n
    }

    /// Total guest bytes covered by the decoded instructions.
    pub fn size(&self) -> u64 {
        self.insns().iter().map(|i| i.len as u64).sum()
    }

    pub fn insn(&self, idx: usize) -> &InstrumentedInsn {
        &self.insns()[idx]
    }

    pub fn insn_mut(&mut self, idx: usize) -> &mut InstrumentedInsn {
        &mut self.insns_mut()[idx]
    }

    pub fn insns(&self) -> &[InstrumentedInsn] {
        &self.insns[..self.n]
    }

    pub fn insns_mut(&mut self) -> &mut [InstrumentedInsn] {
        &mut self.insns[..self.n]
    }

    /// Slots allocated so far, including ones not used by this block.
    pub fn capacity(&self) -> usize {
        self.insns.len()
    }

    /// Some instruction published helper memory callbacks.
    pub fn mem_helper(&self) -> bool {
        self.mem_helper
    }

    pub fn cbs(&self) -> &[CallbackDescriptor] {
        &self.cbs
    }

    pub fn register_exec_cb(&mut self, f: HelperFn, flags: CbFlags, user_data: u64) {
        self.cbs.push(CallbackDescriptor::Regular(RegularCb {
            target_fn: f,
            user_data,
            flags,
            rw: MemRw::NONE,
        }));
    }

    pub fn register_exec_cond_cb(
        &mut self,
        f: HelperFn,
        flags: CbFlags,
        cond: PluginCond,
        entry: ScoreboardRef,
        imm: u64,
        user_data: u64,
    ) {
        let regular = RegularCb {
            target_fn: f,
            user_data,
            flags,
            rw: MemRw::NONE,
        };
        self.cbs
            .extend(CallbackDescriptor::conditional(regular, cond, entry, imm));
    }

    pub fn register_exec_inline(&mut self, op: InlineOp, entry: ScoreboardRef, imm: u64) {
        self.cbs
            .push(CallbackDescriptor::inline(op, entry, imm, MemRw::NONE));
    }

    pub fn push_cb(&mut self, cb: CallbackDescriptor) {
        self.cbs.push(cb);
    }
}
