use crate::types::Type;

/// TCG IR opcodes: unified (type-polymorphic for integer ops).
///
/// Maps to QEMU's `TCGOpcode` defined via DEF() macros in `tcg-opc.h`.
/// Integer ops (marked with `OPF_INT`) work on both I32 and I64;
/// the actual type is carried in `Op::op_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // -- Data movement --
    Mov = 0,
    SetCond,

    // -- Arithmetic --
    Add,
    Sub,
    Mul,
    Neg,

    // -- Logic --
    And,
    Or,
    Xor,
    Not,

    // -- Shift --
    Shl,
    Shr,
    Sar,

    // -- Type conversion --
    ExtI32I64,   // sign-extend i32 -> i64
    ExtUI32I64,  // zero-extend i32 -> i64
    ExtrlI64I32, // truncate i64 -> i32 (low)

    // -- Host memory load/store (direct, for accessing CPU state fields) --
    Ld8U,
    Ld8S,
    Ld16U,
    Ld16S,
    Ld32U,
    Ld32S,
    Ld, // native-width load
    St8,
    St16,
    St32,
    St, // native-width store

    // -- Guest memory access (through software TLB) --
    QemuLd,
    QemuSt,

    // -- Control flow --
    Br,       // unconditional branch to label
    BrCond,   // conditional branch
    SetLabel, // define label position
    GotoTb,   // direct jump to another TB (patchable)
    ExitTb,   // return from TB to execution loop
    GotoPtr,  // indirect jump through register
    Mb,       // memory barrier

    // -- Call --
    Call,

    // -- Instrumentation markers (resolved by the plugin injection pass) --
    PluginCb,    // carg: PluginCbFrom
    PluginMemCb, // iarg: guest address, carg: MemInfo

    // -- Misc --
    Nop,
    Discard,
    InsnStart, // marks guest instruction boundary

    // Sentinel: must be last
    Count,
}

/// Program point recorded by a `plugin_cb` marker.
///
/// Maps to QEMU's `enum plugin_gen_from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PluginCbFrom {
    /// Start of the translation block.
    FromTb = 0,
    /// Start of a guest instruction, after its `insn_start`.
    FromInsn = 1,
    /// End of a guest instruction.
    AfterInsn = 2,
    /// Immediately before an op that leaves the block.
    AfterTb = 3,
}

impl PluginCbFrom {
    pub const fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::FromTb),
            1 => Some(Self::FromInsn),
            2 => Some(Self::AfterInsn),
            3 => Some(Self::AfterTb),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::FromTb => "from_tb",
            Self::FromInsn => "from_insn",
            Self::AfterInsn => "after_insn",
            Self::AfterTb => "after_tb",
        }
    }
}

/// Flags describing properties of an opcode.
///
/// Maps to QEMU's `TCG_OPF_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u16);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Exits the translation block.
    pub const BB_EXIT: OpFlags = OpFlags(0x01);
    /// Ends a basic block (next op starts a new BB).
    pub const BB_END: OpFlags = OpFlags(0x02);
    /// Clobbers caller-saved registers (like a function call).
    pub const CALL_CLOBBER: OpFlags = OpFlags(0x04);
    /// Has side effects: cannot be eliminated by DCE.
    pub const SIDE_EFFECTS: OpFlags = OpFlags(0x08);
    /// Operands may be I32 or I64 (type-polymorphic).
    pub const INT: OpFlags = OpFlags(0x10);
    /// Not directly emitted to host code (lowered earlier).
    pub const NOT_PRESENT: OpFlags = OpFlags(0x20);
    /// Conditional branch (may or may not be taken).
    pub const COND_BRANCH: OpFlags = OpFlags(0x80);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: OpFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// Static definition of an opcode: argument counts and flags.
///
/// Maps to QEMU's `TCGOpDef`.
#[derive(Debug, Clone, Copy)]
pub struct OpDef {
    pub name: &'static str,
    pub nb_oargs: u8,
    pub nb_iargs: u8,
    pub nb_cargs: u8,
    pub flags: OpFlags,
}

impl OpDef {
    pub const fn nb_args(&self) -> u8 {
        self.nb_oargs + self.nb_iargs + self.nb_cargs
    }
}

const fn def(name: &'static str, nb_oargs: u8, nb_iargs: u8, nb_cargs: u8, flags: OpFlags) -> OpDef {
    OpDef {
        name,
        nb_oargs,
        nb_iargs,
        nb_cargs,
        flags,
    }
}

const INT: OpFlags = OpFlags::INT;
const NP: OpFlags = OpFlags::NOT_PRESENT;
const SE: OpFlags = OpFlags::SIDE_EFFECTS;
const CC: OpFlags = OpFlags::CALL_CLOBBER;
const BE: OpFlags = OpFlags::BB_END;
const BX: OpFlags = OpFlags::BB_EXIT;
const CB: OpFlags = OpFlags::COND_BRANCH;
const N: OpFlags = OpFlags::NONE;

/// Static opcode definition table, indexed by `Opcode as usize`.
///
/// Columns: name, outputs, inputs, constants, flags.
pub static OPCODE_DEFS: [OpDef; Opcode::Count as usize] = [
    def("mov", 1, 1, 0, INT.union(NP)),
    def("setcond", 1, 2, 1, INT),
    def("add", 1, 2, 0, INT),
    def("sub", 1, 2, 0, INT),
    def("mul", 1, 2, 0, INT),
    def("neg", 1, 1, 0, INT),
    def("and", 1, 2, 0, INT),
    def("or", 1, 2, 0, INT),
    def("xor", 1, 2, 0, INT),
    def("not", 1, 1, 0, INT),
    def("shl", 1, 2, 0, INT),
    def("shr", 1, 2, 0, INT),
    def("sar", 1, 2, 0, INT),
    def("ext_i32_i64", 1, 1, 0, N),
    def("extu_i32_i64", 1, 1, 0, N),
    def("extrl_i64_i32", 1, 1, 0, N),
    def("ld8u", 1, 1, 1, INT),
    def("ld8s", 1, 1, 1, INT),
    def("ld16u", 1, 1, 1, INT),
    def("ld16s", 1, 1, 1, INT),
    def("ld32u", 1, 1, 1, INT),
    def("ld32s", 1, 1, 1, INT),
    def("ld", 1, 1, 1, INT),
    def("st8", 0, 2, 1, INT),
    def("st16", 0, 2, 1, INT),
    def("st32", 0, 2, 1, INT),
    def("st", 0, 2, 1, INT),
    def("qemu_ld", 1, 1, 1, CC.union(SE).union(INT)),
    def("qemu_st", 0, 2, 1, CC.union(SE).union(INT)),
    def("br", 0, 0, 1, BE.union(NP)),
    def("brcond", 0, 2, 2, BE.union(CB).union(INT)),
    def("set_label", 0, 0, 1, BE.union(NP)),
    def("goto_tb", 0, 0, 1, BX.union(BE).union(NP)),
    def("exit_tb", 0, 0, 1, BX.union(BE).union(NP)),
    def("goto_ptr", 0, 1, 0, BX.union(BE)),
    def("mb", 0, 0, 1, NP),
    def("call", 1, 6, 2, CC.union(NP)),
    def("plugin_cb", 0, 0, 1, SE.union(NP)),
    def("plugin_mem_cb", 0, 1, 1, SE.union(NP)),
    def("nop", 0, 0, 0, NP),
    def("discard", 1, 0, 0, NP),
    def("insn_start", 0, 0, 2, NP),
];

impl Opcode {
    /// Look up the static definition for this opcode.
    pub fn def(self) -> &'static OpDef {
        &OPCODE_DEFS[self as usize]
    }

    /// Return the fixed IR type this opcode operates on, if not type-polymorphic.
    pub fn fixed_type(self) -> Option<Type> {
        match self {
            Opcode::ExtI32I64 | Opcode::ExtUI32I64 => Some(Type::I64),
            Opcode::ExtrlI64I32 => Some(Type::I32),
            _ => None,
        }
    }

    /// Whether this opcode is type-polymorphic (works on I32 or I64).
    pub fn is_int_polymorphic(self) -> bool {
        self.def().flags.contains(OpFlags::INT)
    }

    /// Whether this opcode leaves the translation block.
    pub fn is_block_exit(self) -> bool {
        self.def().flags.contains(OpFlags::BB_EXIT)
    }
}
