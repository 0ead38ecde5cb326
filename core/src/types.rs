/// TCG IR value types.
///
/// Maps to QEMU's `TCGType`: represents the width of IR operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Type {
    I32 = 0,
    I64 = 1,
}

pub const TYPE_COUNT: usize = 2;

impl Type {
    pub const fn size_bits(self) -> u32 {
        match self {
            Type::I32 => 32,
            Type::I64 => 64,
        }
    }

    pub const fn size_bytes(self) -> u32 {
        self.size_bits() / 8
    }

    /// Mask selecting the significant bits of a value of this type.
    pub const fn mask(self) -> u64 {
        match self {
            Type::I32 => 0xFFFF_FFFF,
            Type::I64 => u64::MAX,
        }
    }
}

/// Comparison conditions for branch/setcond operations.
///
/// Maps to QEMU's `TCGCond`. Encoding matches QEMU for direct translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Never = 0,
    Always = 1,
    Eq = 8,
    Ne = 9,
    // Signed
    Lt = 10,
    Ge = 11,
    Le = 12,
    Gt = 13,
    // Unsigned
    Ltu = 14,
    Geu = 15,
    Leu = 16,
    Gtu = 17,
    // Test (AND then compare vs 0)
    TstEq = 18,
    TstNe = 19,
}

impl Cond {
    /// Return the inverted condition.
    pub const fn invert(self) -> Cond {
        match self {
            Cond::Never => Cond::Always,
            Cond::Always => Cond::Never,
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ltu => Cond::Geu,
            Cond::Geu => Cond::Ltu,
            Cond::Leu => Cond::Gtu,
            Cond::Gtu => Cond::Leu,
            Cond::TstEq => Cond::TstNe,
            Cond::TstNe => Cond::TstEq,
        }
    }

    /// Decode a condition stored as an op constant argument.
    pub const fn from_raw(v: u32) -> Option<Cond> {
        Some(match v {
            0 => Cond::Never,
            1 => Cond::Always,
            8 => Cond::Eq,
            9 => Cond::Ne,
            10 => Cond::Lt,
            11 => Cond::Ge,
            12 => Cond::Le,
            13 => Cond::Gt,
            14 => Cond::Ltu,
            15 => Cond::Geu,
            16 => Cond::Leu,
            17 => Cond::Gtu,
            18 => Cond::TstEq,
            19 => Cond::TstNe,
            _ => return None,
        })
    }

    /// Evaluate the condition on two values of type `ty`.
    pub fn eval(self, ty: Type, a: u64, b: u64) -> bool {
        let a = a & ty.mask();
        let b = b & ty.mask();
        let (sa, sb) = match ty {
            Type::I32 => (a as u32 as i32 as i64, b as u32 as i32 as i64),
            Type::I64 => (a as i64, b as i64),
        };
        match self {
            Cond::Never => false,
            Cond::Always => true,
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Ge => sa >= sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
            Cond::Leu => a <= b,
            Cond::Gtu => a > b,
            Cond::TstEq => a & b == 0,
            Cond::TstNe => a & b != 0,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, Cond::Lt | Cond::Ge | Cond::Le | Cond::Gt)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(self, Cond::Ltu | Cond::Geu | Cond::Leu | Cond::Gtu)
    }
}

/// Memory operation descriptor: encodes size, signedness,
/// endianness, alignment.
///
/// Maps to QEMU's `MemOp`. Bit-packed for compact storage in IR ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOp(u16);

impl MemOp {
    pub const SIZE_8: u16 = 0;
    pub const SIZE_16: u16 = 1;
    pub const SIZE_32: u16 = 2;
    pub const SIZE_64: u16 = 3;

    pub const SIGN: u16 = 1 << 2;
    pub const BSWAP: u16 = 1 << 3;
    pub const ALIGN_2: u16 = 1 << 4;
    pub const ALIGN_4: u16 = 2 << 4;
    pub const ALIGN_8: u16 = 3 << 4;

    pub const fn new(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn ub() -> Self {
        Self(Self::SIZE_8)
    }
    pub const fn sb() -> Self {
        Self(Self::SIZE_8 | Self::SIGN)
    }
    pub const fn uw() -> Self {
        Self(Self::SIZE_16)
    }
    pub const fn sw() -> Self {
        Self(Self::SIZE_16 | Self::SIGN)
    }
    pub const fn ul() -> Self {
        Self(Self::SIZE_32)
    }
    pub const fn sl() -> Self {
        Self(Self::SIZE_32 | Self::SIGN)
    }
    pub const fn uq() -> Self {
        Self(Self::SIZE_64)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }
    pub const fn size(self) -> u16 {
        self.0 & 0x3
    }
    pub const fn is_signed(self) -> bool {
        self.0 & Self::SIGN != 0
    }
    pub const fn is_bswap(self) -> bool {
        self.0 & Self::BSWAP != 0
    }
    pub const fn size_bytes(self) -> u32 {
        1 << self.size()
    }
}

/// Direction of a guest memory access, as a bit mask.
///
/// Maps to QEMU's `enum qemu_plugin_mem_rw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRw(u8);

impl MemRw {
    pub const NONE: MemRw = MemRw(0);
    pub const R: MemRw = MemRw(1);
    pub const W: MemRw = MemRw(2);
    pub const RW: MemRw = MemRw(3);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 3)
    }

    /// Whether the two masks share a direction.
    pub const fn intersects(self, other: MemRw) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Access descriptor handed to memory callbacks: the `MemOp` of the
/// access in the low 16 bits, the direction above it.
///
/// Maps to QEMU's `qemu_plugin_meminfo_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemInfo(u32);

impl MemInfo {
    const RW_SHIFT: u32 = 16;

    pub const fn new(memop: MemOp, rw: MemRw) -> Self {
        Self(memop.bits() as u32 | ((rw.bits() as u32) << Self::RW_SHIFT))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn memop(self) -> MemOp {
        MemOp::new(self.0 as u16)
    }

    pub const fn rw(self) -> MemRw {
        MemRw::from_bits((self.0 >> Self::RW_SHIFT) as u8)
    }

    pub const fn is_store(self) -> bool {
        self.rw().intersects(MemRw::W)
    }

    pub const fn size_bytes(self) -> u32 {
        self.memop().size_bytes()
    }

    pub const fn is_signed(self) -> bool {
        self.memop().is_signed()
    }

    pub const fn is_big_endian(self) -> bool {
        self.memop().is_bswap()
    }
}

/// Helper call properties, stored in the call op's `param2`.
///
/// Maps to QEMU's `TCG_CALL_NO_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CallFlags(u8);

impl CallFlags {
    pub const NONE: CallFlags = CallFlags(0);
    /// Helper does not read globals (and so does not need them synced).
    pub const NO_READ_GLOBALS: CallFlags = CallFlags(1 << 0);
    /// Helper does not write globals.
    pub const NO_WRITE_GLOBALS: CallFlags = CallFlags(1 << 1);
    /// Helper has no side effects visible to the guest.
    pub const NO_SIDE_EFFECTS: CallFlags = CallFlags(1 << 2);
    pub const NO_RWG: CallFlags =
        CallFlags(Self::NO_READ_GLOBALS.0 | Self::NO_WRITE_GLOBALS.0);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: CallFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: CallFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// Signature shared by every helper reachable from a `call` op.
///
/// The IR passes six integer arguments; helpers ignore the trailing
/// ones they do not need.
pub type HelperFn = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;
