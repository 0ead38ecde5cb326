use crate::context::MAX_INSNS;

/// Guest code region described by one translation.
///
/// Maps to the guest-side fields of QEMU's `TranslationBlock`. The
/// translator fills `size` and `icount` once the block is decoded.
#[derive(Debug, Clone)]
pub struct TranslationBlock {
    /// Guest virtual PC where this TB starts.
    pub pc: u64,
    /// CPU state flags that affect translation (e.g. privilege level, ISA mode).
    pub flags: u32,
    /// Compile flags (instruction count limit, parallel, no-instrument...).
    pub cflags: u32,
    /// Size of guest code covered by this TB, in bytes.
    pub size: u32,
    /// Number of guest instructions in this TB.
    pub icount: u16,
}

/// Compile flags for TranslationBlock.cflags.
pub mod cflags {
    /// Mask for the instruction count limit (0 = no limit).
    pub const CF_COUNT_MASK: u32 = 0x0000_FFFF;
    /// TB is being single-stepped.
    pub const CF_SINGLE_STEP: u32 = 0x0002_0000;
    /// Other vCPUs may run concurrently; generated code must read the
    /// vCPU index at run time.
    pub const CF_PARALLEL: u32 = 0x0008_0000;
    /// Do not emit instrumentation markers for this TB.
    pub const CF_NO_INSTRUMENT: u32 = 0x0010_0000;
}

impl TranslationBlock {
    pub fn new(pc: u64, flags: u32, cflags: u32) -> Self {
        Self {
            pc,
            flags,
            cflags,
            size: 0,
            icount: 0,
        }
    }

    /// Maximum number of guest instructions per TB.
    pub fn max_insns(cflags: u32) -> u32 {
        if cflags & cflags::CF_SINGLE_STEP != 0 {
            return 1;
        }
        match cflags & cflags::CF_COUNT_MASK {
            0 => MAX_INSNS as u32,
            count => count.min(MAX_INSNS as u32),
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.cflags & cflags::CF_PARALLEL != 0
    }

    pub fn no_instrument(&self) -> bool {
        self.cflags & cflags::CF_NO_INSTRUMENT != 0
    }
}
