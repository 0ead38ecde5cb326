//! Marker emission during decode and the injection pass that resolves
//! the markers once the block is complete.
//!
//! Follows QEMU's `accel/tcg/plugin-gen.c`: the translator leaves
//! `plugin_cb` / `plugin_mem_cb` placeholders in the op stream, the
//! collector decides what to instrument after the whole block is known,
//! and a single forward walk replaces each placeholder with generated
//! code.

use std::sync::Arc;

use tcg_core::dump::dump_to_string;
use tcg_core::tb::cflags::{CF_NO_INSTRUMENT, CF_PARALLEL};
use tcg_core::{Context, MemInfo, OpIdx, Opcode, PluginCbFrom, TempIdx};
use tracing::{debug, enabled, trace, Level};

use crate::block::InstrumentedBlock;
use crate::gen::{gen_callback, gen_disable_mem_helper, gen_enable_mem_helper, GenEnv};
use crate::vcpu::{HelperMemCbs, VcpuLayout};

/// Decides what to instrument in each translated block.
///
/// `collect` runs exactly once per successfully decoded block, before
/// any marker is resolved, and fills the callback lists of the block
/// and its instructions.
pub trait RequestCollector: Send + Sync {
    /// Whether blocks at `pc` should carry markers at all.
    fn enabled_for(&self, _pc: u64, _flags: u32) -> bool {
        true
    }

    fn collect(&self, block: &mut InstrumentedBlock);
}

/// Counters describing one injection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectStats {
    pub insns: usize,
    pub tb_cbs: usize,
    pub insn_cbs: usize,
    pub mem_cbs: usize,
    pub helper_enables: usize,
    pub helper_disables: usize,
}

/// Result of an injection pass.
///
/// `helper_cbs` holds the lists the generated code publishes to
/// helpers; keep this value alive while the block can run.
#[derive(Debug, Default)]
pub struct InjectedBlock {
    pub helper_cbs: Vec<Arc<HelperMemCbs>>,
    pub stats: InjectStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Decoding,
    Decoded,
}

/// Instrumentation driver owned by one generation context.
pub struct PluginGen {
    collector: Option<Arc<dyn RequestCollector>>,
    block: InstrumentedBlock,
    layout: VcpuLayout,
    cpu_index: u32,
    parallel: bool,
    active: bool,
    phase: Phase,
}

impl PluginGen {
    pub fn new(collector: Arc<dyn RequestCollector>, layout: VcpuLayout) -> Self {
        Self {
            collector: Some(collector),
            layout,
            ..Self::disabled()
        }
    }

    /// A driver that never instruments.
    pub fn disabled() -> Self {
        Self {
            collector: None,
            block: InstrumentedBlock::new(),
            layout: VcpuLayout::default(),
            cpu_index: 0,
            parallel: false,
            active: false,
            phase: Phase::Idle,
        }
    }

    /// vCPU that will run the blocks generated from now on.
    pub fn set_cpu_index(&mut self, cpu_index: u32) {
        self.cpu_index = cpu_index;
    }

    pub fn layout(&self) -> VcpuLayout {
        self.layout
    }

    /// Whether the current block carries markers.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn block(&self) -> &InstrumentedBlock {
        &self.block
    }

    /// Begin a block. Returns whether it is instrumented; if so the
    /// block state is reset and a `from_tb` marker is emitted.
    pub fn tb_start(&mut self, ir: &mut Context, pc: u64, flags: u32, cflags: u32) -> bool {
        debug_assert_ne!(self.phase, Phase::Decoding, "tb_start inside a block");
        let enabled = cflags & CF_NO_INSTRUMENT == 0
            && self
                .collector
                .as_ref()
                .is_some_and(|c| c.enabled_for(pc, flags));

        self.active = enabled;
        self.parallel = cflags & CF_PARALLEL != 0;
        if !enabled {
            self.phase = Phase::Idle;
            return false;
        }
        self.block.reset(pc, flags);
        ir.gen_plugin_cb(PluginCbFrom::FromTb);
        self.phase = Phase::Decoding;
        true
    }

    /// Open the next instruction. Must follow the `insn_start` op.
    pub fn insn_start(&mut self, ir: &mut Context, pc: u64) {
        if !self.active {
            return;
        }
        debug_assert_eq!(self.phase, Phase::Decoding);
        let idx = self.block.push_insn(pc);
        ir.set_plugin_insn(Some(idx as u32));
        ir.gen_plugin_cb(PluginCbFrom::FromInsn);
    }

    /// Close the current instruction, ending at `pc_next`, and take
    /// its captured bytes from `record`.
    pub fn insn_end(&mut self, ir: &mut Context, pc_next: u64, record: &mut Vec<u8>) {
        if !self.active {
            return;
        }
        debug_assert_eq!(self.phase, Phase::Decoding);
        let calls_helpers = ir.take_plugin_calls_helpers();
        let insn = self.block.last_insn_mut();
        let len = pc_next.wrapping_sub(insn.vaddr()) as u32;
        insn.finish(len, record, calls_helpers);
        ir.gen_plugin_cb(PluginCbFrom::AfterInsn);
    }

    /// End the block with `num_insns` decoded instructions.
    pub fn tb_end(&mut self, ir: &mut Context, num_insns: usize) {
        if !self.active {
            return;
        }
        debug_assert_eq!(self.phase, Phase::Decoding);
        assert_eq!(
            self.block.n_insns(),
            num_insns,
            "instrumented instruction count differs from the translator's"
        );
        ir.set_plugin_insn(None);
        self.phase = Phase::Decoded;
    }

    /// Drop a block attempt that failed during decode.
    pub fn abort(&mut self, ir: &mut Context) {
        ir.set_plugin_insn(None);
        self.active = false;
        self.phase = Phase::Idle;
    }

    /// Collect requests for the decoded block and resolve every marker.
    pub fn inject(&mut self, ir: &mut Context) -> InjectedBlock {
        if !self.active {
            return InjectedBlock::default();
        }
        assert_eq!(self.phase, Phase::Decoded, "inject before tb_end");
        self.active = false;
        self.phase = Phase::Idle;

        if let Some(collector) = &self.collector {
            collector.collect(&mut self.block);
        }
        if enabled!(Level::TRACE) {
            trace!(pc = self.block.vaddr(), "before injection:\n{}", dump_to_string(ir));
        }

        let g = GenEnv {
            layout: self.layout,
            cpu_index: self.cpu_index,
            parallel: self.parallel,
        };
        let block = &mut self.block;
        let out = ir.rewrite_scope(|ir| Injector::new(block, g, ir).run(ir));

        if enabled!(Level::TRACE) {
            trace!(pc = self.block.vaddr(), "after injection:\n{}", dump_to_string(ir));
        }
        debug!(
            pc = self.block.vaddr(),
            insns = out.stats.insns,
            tb_cbs = out.stats.tb_cbs,
            insn_cbs = out.stats.insn_cbs,
            mem_cbs = out.stats.mem_cbs,
            helper_enables = out.stats.helper_enables,
            helper_disables = out.stats.helper_disables,
            "instrumentation injected"
        );
        out
    }
}

/// Whether some branch in the stream targets a label placed before it.
fn has_backward_branch(ir: &Context) -> bool {
    let mut placed = vec![false; ir.labels().len()];
    for op in ir.ops() {
        match op.opc {
            Opcode::SetLabel => placed[op.carg(0) as usize] = true,
            _ => {
                if let Some(id) = op.branch_label() {
                    if placed[id as usize] {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// State of one forward walk over the op stream.
///
/// `live` tracks whether helper memory callbacks may be published on
/// the path reaching the current op, so that a disable is generated
/// exactly where tracking can still be on. Labels reached by a branch
/// taken while live are live on entry. With a backward branch in the
/// stream this ordering no longer holds and every exit point disables.
struct Injector<'a> {
    block: &'a mut InstrumentedBlock,
    g: GenEnv,
    out: InjectedBlock,
    /// Number of `insn_start` ops seen.
    n_insns: usize,
    /// Number of `from_insn` markers seen.
    n_from_insn: usize,
    live: bool,
    live_labels: Vec<bool>,
    /// Disable at every exit point when some instruction enables.
    fallback: Option<bool>,
}

impl<'a> Injector<'a> {
    fn new(block: &'a mut InstrumentedBlock, g: GenEnv, ir: &Context) -> Self {
        let fallback = has_backward_branch(ir).then(|| {
            block
                .insns()
                .iter()
                .any(|i| i.calls_helpers && !i.mem_cbs.is_empty())
        });
        Self {
            block,
            g,
            out: InjectedBlock::default(),
            n_insns: 0,
            n_from_insn: 0,
            live: false,
            live_labels: vec![false; ir.labels().len()],
            fallback,
        }
    }

    fn run(mut self, ir: &mut Context) -> InjectedBlock {
        let mut cur = ir.first_op();
        while let Some(idx) = cur {
            cur = ir.next_op(idx);
            let op = ir.op(idx);
            let opc = op.opc;
            match opc {
                Opcode::InsnStart => self.n_insns += 1,
                Opcode::SetLabel => {
                    let id = op.carg(0) as usize;
                    self.live |= self.live_labels[id];
                }
                Opcode::Br | Opcode::BrCond => {
                    if self.live {
                        if let Some(id) = op.branch_label() {
                            self.live_labels[id as usize] = true;
                        }
                    }
                }
                Opcode::PluginCb => {
                    let raw = op.carg(0);
                    let from = match PluginCbFrom::from_raw(raw) {
                        Some(from) => from,
                        None => panic!("plugin_cb with unknown kind {raw}"),
                    };
                    ir.emit_before(idx, |ir| self.resolve_cb(ir, from));
                    ir.remove_op(idx);
                }
                Opcode::PluginMemCb => {
                    let addr = op.iargs()[0];
                    let info = MemInfo::from_raw(op.carg(0));
                    ir.emit_before(idx, |ir| self.resolve_mem_cb(ir, addr, info, idx));
                    ir.remove_op(idx);
                }
                _ => {}
            }
        }

        assert_eq!(
            self.n_from_insn, self.n_insns,
            "from_insn markers do not match insn_start ops"
        );
        assert_eq!(
            self.n_insns,
            self.block.n_insns(),
            "op stream and instrumented block disagree on instruction count"
        );
        self.out.stats.insns = self.n_insns;
        self.out
    }

    fn current_insn(&self) -> usize {
        assert!(self.n_insns > 0, "instrumentation marker before the first instruction");
        let idx = self.n_insns - 1;
        assert!(idx < self.block.n_insns(), "marker for undecoded instruction {idx}");
        idx
    }

    fn resolve_cb(&mut self, ir: &mut Context, from: PluginCbFrom) {
        match from {
            PluginCbFrom::FromTb => {
                for cb in self.block.cbs() {
                    gen_callback(ir, &self.g, cb, None);
                }
                self.out.stats.tb_cbs += self.block.cbs().len();
                trace!(n = self.block.cbs().len(), "from_tb");
            }
            PluginCbFrom::FromInsn => {
                self.n_from_insn += 1;
                let idx = self.current_insn();
                assert_eq!(self.n_from_insn, self.n_insns, "duplicate from_insn marker");
                let insn = self.block.insn_mut(idx);
                if insn.calls_helpers && !insn.mem_cbs.is_empty() {
                    insn.mem_helper = true;
                    let cbs = Arc::new(HelperMemCbs::new(insn.mem_cbs.clone()));
                    self.block.mem_helper = true;
                    gen_enable_mem_helper(ir, &self.g, &cbs);
                    self.out.helper_cbs.push(cbs);
                    self.out.stats.helper_enables += 1;
                    self.live = true;
                }
                let insn = self.block.insn(idx);
                for cb in insn.insn_cbs() {
                    gen_callback(ir, &self.g, cb, None);
                }
                self.out.stats.insn_cbs += insn.insn_cbs().len();
                trace!(insn = idx, n = insn.insn_cbs().len(), "from_insn");
            }
            PluginCbFrom::AfterInsn => {
                let idx = self.current_insn();
                // Tracking may reach this insn through a label placed by
                // a branch from an earlier one.
                let disable = self.fallback.unwrap_or(self.live);
                self.gen_disable(ir, disable);
                trace!(insn = idx, disable, "after_insn");
            }
            PluginCbFrom::AfterTb => {
                let disable = self.fallback.unwrap_or(self.live);
                self.gen_disable(ir, disable);
                trace!(disable, "after_tb");
            }
        }
    }

    fn gen_disable(&mut self, ir: &mut Context, disable: bool) {
        if disable {
            gen_disable_mem_helper(ir, &self.g);
            self.out.stats.helper_disables += 1;
            self.live = false;
        }
    }

    fn resolve_mem_cb(
        &mut self,
        ir: &mut Context,
        addr: TempIdx,
        info: MemInfo,
        at: OpIdx,
    ) {
        let idx = self.current_insn();
        let insn = self.block.insn(idx);
        let mut n = 0;
        for cb in insn.mem_cbs().iter().filter(|cb| cb.matches(info.rw())) {
            gen_callback(ir, &self.g, cb, Some((addr, info)));
            n += 1;
        }
        self.out.stats.mem_cbs += n;
        trace!(insn = idx, op = at.0, n, "plugin_mem_cb");
    }
}
