//! TCG Frontend: the generic translation framework.
//!
//! Provides the `TranslatorOps` trait implemented by guest decoders,
//! `translator_loop` which drives one block through a decoder while
//! emitting instrumentation markers, and `gen_intermediate_code`, the
//! per-block pipeline up to and including marker injection.

pub mod fetch;

use tcg_core::{Context, TranslationBlock};
use tcg_plugin::{InjectedBlock, PluginGen};
use tracing::{debug, trace};

pub use fetch::{
    translator_ldl, translator_ldq, translator_ldub, translator_lduw, CodeSource,
    FetchFault,
};

// ---------------------------------------------------------------
// Generic translation framework
// ---------------------------------------------------------------

/// TB termination reason set by `translate_insn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisasJumpType {
    /// Continue to the next sequential instruction.
    Next,
    /// Reached the instruction budget or filled the op buffer.
    TooMany,
    /// Unconditional branch / exit: no fall-through.
    NoReturn,
}

/// Base context shared by all guest architectures.
///
/// Mirrors QEMU's `DisasContextBase`.
#[derive(Debug)]
pub struct DisasContextBase {
    /// PC of the first instruction in this TB.
    pub pc_first: u64,
    /// PC of the *next* instruction to decode.
    pub pc_next: u64,
    /// CPU state flags the block is translated for.
    pub flags: u32,
    /// Compile flags of the block.
    pub cflags: u32,
    /// How the current instruction terminates.
    pub is_jmp: DisasJumpType,
    /// Number of guest instructions translated so far.
    pub num_insns: u32,
    /// Maximum instructions allowed in one TB.
    pub max_insns: u32,
    /// Whether instrumentation markers are emitted for this block.
    pub plugin_enabled: bool,
    /// Bytes fetched for the instruction being decoded.
    pub record: Vec<u8>,
    /// Code pages locked by this translation attempt.
    locked_pages: Vec<u64>,
}

impl DisasContextBase {
    pub fn new(pc: u64, flags: u32, cflags: u32) -> Self {
        Self {
            pc_first: pc,
            pc_next: pc,
            flags,
            cflags,
            is_jmp: DisasJumpType::Next,
            num_insns: 0,
            max_insns: TranslationBlock::max_insns(cflags),
            plugin_enabled: false,
            record: Vec::new(),
            locked_pages: Vec::new(),
        }
    }

    /// Pages currently locked by this attempt.
    pub fn locked_pages(&self) -> &[u64] {
        &self.locked_pages
    }
}

/// Per-architecture translation operations.
///
/// Mirrors QEMU's `TranslatorOps` vtable.
pub trait TranslatorOps {
    /// Architecture-specific disassembly context.
    type DisasContext;

    /// One-time setup before the translation loop.
    fn init_disas_context(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Called once at the start of the TB (after init).
    fn tb_start(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Emit `insn_start` marker for the current guest PC.
    fn insn_start(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Decode and translate one guest instruction.
    ///
    /// Must fetch through the `translator_ld*` accessors, advance
    /// `base().pc_next` and set `base().is_jmp` when the instruction
    /// terminates the TB.
    fn translate_insn(
        ctx: &mut Self::DisasContext,
        ir: &mut Context,
        code: &dyn CodeSource,
    ) -> Result<(), FetchFault>;

    /// Emit TB epilogue (exit / goto_tb for fall-through).
    fn tb_stop(ctx: &mut Self::DisasContext, ir: &mut Context);

    /// Access the base context embedded in the arch context.
    fn base(ctx: &Self::DisasContext) -> &DisasContextBase;

    /// Mutable access to the base context.
    fn base_mut(ctx: &mut Self::DisasContext) -> &mut DisasContextBase;
}

/// Generic translation loop: drives the decode → translate
/// cycle.
///
/// Mirrors QEMU's `translator_loop()` in
/// `accel/tcg/translator.c`. Pages locked while fetching are released
/// before returning, whether the block completed or a fetch faulted.
pub fn translator_loop<T: TranslatorOps>(
    ctx: &mut T::DisasContext,
    ir: &mut Context,
    plugin: &mut PluginGen,
    code: &dyn CodeSource,
) -> Result<(), FetchFault> {
    T::init_disas_context(ctx, ir);
    let res = translate_block::<T>(ctx, ir, plugin, code);
    fetch::unlock_pages(T::base_mut(ctx), code);
    if res.is_err() {
        plugin.abort(ir);
    }
    res
}

fn translate_block<T: TranslatorOps>(
    ctx: &mut T::DisasContext,
    ir: &mut Context,
    plugin: &mut PluginGen,
    code: &dyn CodeSource,
) -> Result<(), FetchFault> {
    T::tb_start(ctx, ir);
    let base = T::base_mut(ctx);
    base.plugin_enabled = plugin.tb_start(ir, base.pc_first, base.flags, base.cflags);

    loop {
        let base = T::base_mut(ctx);
        base.num_insns += 1;
        base.record.clear();
        let pc = base.pc_next;

        T::insn_start(ctx, ir);
        plugin.insn_start(ir, pc);
        T::translate_insn(ctx, ir, code)?;

        let base = T::base_mut(ctx);
        plugin.insn_end(ir, base.pc_next, &mut base.record);
        trace!(pc, len = base.pc_next.wrapping_sub(pc), "translated insn");

        if base.is_jmp != DisasJumpType::Next {
            break;
        }
        if ir.op_buf_full() || base.num_insns >= base.max_insns {
            base.is_jmp = DisasJumpType::TooMany;
            break;
        }
    }

    T::tb_stop(ctx, ir);
    let base = T::base(ctx);
    plugin.tb_end(ir, base.num_insns as usize);
    debug!(
        pc = base.pc_first,
        insns = base.num_insns,
        stop = ?base.is_jmp,
        ops = ir.num_ops(),
        "translated block"
    );
    Ok(())
}

/// Translate `tb` and inject its instrumentation.
///
/// `new_ctx` builds the decoder context around a prepared base. When a
/// fetch faults after at least one instruction was decoded, the block
/// is retranslated once, ending just before the faulting instruction;
/// a fault on the first instruction is returned. On success `tb.size`
/// and `tb.icount` describe the block.
pub fn gen_intermediate_code<T: TranslatorOps>(
    ir: &mut Context,
    plugin: &mut PluginGen,
    code: &dyn CodeSource,
    tb: &mut TranslationBlock,
    mut new_ctx: impl FnMut(DisasContextBase) -> T::DisasContext,
) -> Result<InjectedBlock, FetchFault> {
    let mut max_insns = TranslationBlock::max_insns(tb.cflags);
    let mut retried = false;
    loop {
        ir.reset();
        let mut base = DisasContextBase::new(tb.pc, tb.flags, tb.cflags);
        base.max_insns = max_insns;
        let mut ctx = new_ctx(base);

        match translator_loop::<T>(&mut ctx, ir, plugin, code) {
            Ok(()) => {
                let base = T::base(&ctx);
                tb.size = base.pc_next.wrapping_sub(base.pc_first) as u32;
                tb.icount = base.num_insns as u16;
                return Ok(plugin.inject(ir));
            }
            Err(fault) => {
                let completed = T::base(&ctx).num_insns - 1;
                if retried || completed == 0 {
                    debug!(pc = tb.pc, %fault, "block translation failed");
                    return Err(fault);
                }
                debug!(pc = tb.pc, %fault, completed, "retrying block without faulting insn");
                max_insns = completed;
                retried = true;
            }
        }
    }
}
