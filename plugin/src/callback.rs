//! Callback descriptors attached to blocks, instructions and memory
//! accesses.
//!
//! Descriptors are plain values: they name a target function or a
//! scoreboard field and carry their immediates, with no reference back
//! to whoever registered them.

use tcg_core::{CallFlags, Cond, HelperFn, MemRw};

use crate::scoreboard::ScoreboardRef;

/// Guest register access a callback declares.
///
/// Maps to QEMU's `enum qemu_plugin_cb_flags`. The value is published in
/// the vCPU state for the duration of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CbFlags {
    NoRegs = 0,
    RRegs = 1,
    RwRegs = 2,
}

impl CbFlags {
    /// Call-op flags implied by the declared register access.
    pub const fn call_flags(self) -> CallFlags {
        match self {
            CbFlags::NoRegs => CallFlags::NO_RWG,
            CbFlags::RRegs => CallFlags::NO_WRITE_GLOBALS,
            CbFlags::RwRegs => CallFlags::NONE,
        }
    }
}

/// Comparison used by conditional callbacks. All orderings are unsigned.
///
/// Maps to QEMU's `enum qemu_plugin_cond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCond {
    Never,
    Always,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl PluginCond {
    pub const fn to_cond(self) -> Cond {
        match self {
            PluginCond::Never => Cond::Never,
            PluginCond::Always => Cond::Always,
            PluginCond::Eq => Cond::Eq,
            PluginCond::Ne => Cond::Ne,
            PluginCond::Lt => Cond::Ltu,
            PluginCond::Le => Cond::Leu,
            PluginCond::Gt => Cond::Gtu,
            PluginCond::Ge => Cond::Geu,
        }
    }
}

/// Inline operation applied to a scoreboard field.
///
/// Maps to QEMU's `enum qemu_plugin_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InlineOp {
    AddU64,
    StoreU64,
}

/// Direct call to a target function.
///
/// Called as `target_fn(vcpu_index, user_data)`, or
/// `target_fn(vcpu_index, meminfo, vaddr, user_data)` for memory accesses.
#[derive(Debug, Clone, Copy)]
pub struct RegularCb {
    pub target_fn: HelperFn,
    pub user_data: u64,
    pub flags: CbFlags,
    /// Access directions this callback fires on, for memory lists.
    pub rw: MemRw,
}

/// Call guarded by `scoreboard[vcpu] <cond> imm`.
#[derive(Debug, Clone, Copy)]
pub struct CondCb {
    pub regular: RegularCb,
    pub entry: ScoreboardRef,
    pub cond: PluginCond,
    pub imm: u64,
}

/// Inline add or store of `imm` on `scoreboard[vcpu]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineCb {
    pub entry: ScoreboardRef,
    pub imm: u64,
    pub rw: MemRw,
}

/// One instrumentation request.
#[derive(Debug, Clone, Copy)]
pub enum CallbackDescriptor {
    Regular(RegularCb),
    Conditional(CondCb),
    InlineAdd(InlineCb),
    InlineStore(InlineCb),
}

impl CallbackDescriptor {
    /// Build a conditional callback. `Never` yields nothing and
    /// `Always` degrades to a plain call.
    pub fn conditional(
        regular: RegularCb,
        cond: PluginCond,
        entry: ScoreboardRef,
        imm: u64,
    ) -> Option<Self> {
        match cond {
            PluginCond::Never => None,
            PluginCond::Always => Some(Self::Regular(regular)),
            _ => Some(Self::Conditional(CondCb {
                regular,
                entry,
                cond,
                imm,
            })),
        }
    }

    pub fn inline(op: InlineOp, entry: ScoreboardRef, imm: u64, rw: MemRw) -> Self {
        let cb = InlineCb { entry, imm, rw };
        match op {
            InlineOp::AddU64 => Self::InlineAdd(cb),
            InlineOp::StoreU64 => Self::InlineStore(cb),
        }
    }

    /// Access directions the descriptor applies to.
    pub fn rw(&self) -> MemRw {
        match self {
            Self::Regular(cb) => cb.rw,
            Self::Conditional(cb) => cb.regular.rw,
            Self::InlineAdd(cb) | Self::InlineStore(cb) => cb.rw,
        }
    }

    /// Whether the descriptor fires for an access in direction `access`.
    pub fn matches(&self, access: MemRw) -> bool {
        self.rw().intersects(access)
    }
}
