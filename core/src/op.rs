use crate::opcode::Opcode;
use crate::temp::TempIdx;
use crate::types::Type;

/// Maximum number of arguments per IR operation.
pub const MAX_OP_ARGS: usize = 10;

/// Slot of an op in the Context's op arena.
///
/// Slots are stable while the op is linked into the stream; a removed
/// op's slot may be handed to a later op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpIdx(pub u32);

/// A single TCG IR operation.
///
/// Maps to QEMU's `TCGOp`. Each op has an opcode, a type (for polymorphic ops),
/// opcode-specific parameters and up to MAX_OP_ARGS arguments.
#[derive(Debug, Clone)]
pub struct Op {
    pub idx: OpIdx,
    pub opc: Opcode,
    /// Operand type for type-polymorphic ops (I32 or I64).
    pub op_type: Type,
    /// Opcode-specific parameter 1.
    pub param1: u8,
    /// Opcode-specific parameter 2 (call flags for `Call`).
    pub param2: u8,
    /// Arguments: temp indices, label ids, or encoded immediates.
    pub args: [TempIdx; MAX_OP_ARGS],
    pub nargs: u8,
}

impl Op {
    pub fn new(idx: OpIdx, opc: Opcode, op_type: Type) -> Self {
        Self {
            idx,
            opc,
            op_type,
            param1: 0,
            param2: 0,
            args: [TempIdx(0); MAX_OP_ARGS],
            nargs: 0,
        }
    }

    pub fn with_args(idx: OpIdx, opc: Opcode, op_type: Type, args: &[TempIdx]) -> Self {
        let mut op = Self::new(idx, opc, op_type);
        let n = args.len().min(MAX_OP_ARGS);
        op.args[..n].copy_from_slice(&args[..n]);
        op.nargs = n as u8;
        op
    }

    /// Get the output arguments slice (based on opcode definition).
    pub fn oargs(&self) -> &[TempIdx] {
        let n = self.opc.def().nb_oargs as usize;
        &self.args[..n]
    }

    /// Get the input arguments slice.
    pub fn iargs(&self) -> &[TempIdx] {
        let def = self.opc.def();
        let start = def.nb_oargs as usize;
        let end = start + def.nb_iargs as usize;
        &self.args[start..end]
    }

    /// Get the constant arguments slice.
    pub fn cargs(&self) -> &[TempIdx] {
        let def = self.opc.def();
        let start = (def.nb_oargs + def.nb_iargs) as usize;
        let end = start + def.nb_cargs as usize;
        &self.args[start..end]
    }

    /// Raw value of constant argument `n`.
    pub fn carg(&self, n: usize) -> u32 {
        self.cargs()[n].0
    }

    /// Whether this op is an instrumentation placeholder.
    pub fn is_plugin_marker(&self) -> bool {
        matches!(self.opc, Opcode::PluginCb | Opcode::PluginMemCb)
    }

    /// Label targeted by a `br` / `brcond`, if any.
    pub fn branch_label(&self) -> Option<u32> {
        match self.opc {
            Opcode::Br => Some(self.carg(0)),
            Opcode::BrCond => Some(self.carg(1)),
            _ => None,
        }
    }
}
