//! Reference interpreter for the IR op stream.
//!
//! Executes the ops of a `Context` in stream order, in the manner of
//! QEMU's TCI backend. Values are kept as `u64` and truncated to the op
//! type on write. Host loads/stores (`ld*`/`st*`) and helper calls act on
//! real host memory; guest accesses (`qemu_ld`/`qemu_st`) go through a
//! [`GuestMemory`] implementation. Globals live in the CPU state they
//! are declared over, so every read and write of a global goes to memory.

use crate::context::Context;
use crate::op::{Op, OpIdx};
use crate::opcode::Opcode;
use crate::temp::{TempIdx, TempKind};
use crate::types::{Cond, HelperFn, MemOp, Type};

/// Guest address space seen by `qemu_ld` / `qemu_st`.
pub trait GuestMemory {
    /// Read `size` bytes (1, 2, 4 or 8) at `addr`, zero-extended.
    fn read(&mut self, addr: u64, size: u32) -> u64;
    /// Write the low `size` bytes of `val` at `addr`.
    fn write(&mut self, addr: u64, size: u32, val: u64);
}

/// How execution of the op stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpExit {
    /// `exit_tb` with its constant value.
    ExitTb(u64),
    /// `goto_ptr` with the target value.
    GotoPtr(u64),
    /// Fell off the end of the stream.
    End,
}

/// Per-run interpreter state.
pub struct Interp<'a> {
    ctx: &'a Context,
    vals: Vec<u64>,
    labels: Vec<Option<OpIdx>>,
}

fn sign_extend(val: u64, size: u32) -> u64 {
    let shift = 64 - size * 8;
    (((val << shift) as i64) >> shift) as u64
}

fn bswap(val: u64, size: u32) -> u64 {
    match size {
        2 => (val as u16).swap_bytes() as u64,
        4 => (val as u32).swap_bytes() as u64,
        8 => val.swap_bytes(),
        _ => val,
    }
}

fn eval_binary(opc: Opcode, ty: Type, a: u64, b: u64) -> u64 {
    let bits = ty.size_bits();
    match opc {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a.wrapping_shl((b as u32) % bits),
        Opcode::Shr => (a & ty.mask()).wrapping_shr((b as u32) % bits),
        Opcode::Sar => {
            let sh = (b as u32) % bits;
            match ty {
                Type::I32 => ((a as u32 as i32) >> sh) as u64,
                Type::I64 => ((a as i64) >> sh) as u64,
            }
        }
        _ => unreachable!("{opc:?} is not a binary op"),
    }
}

impl<'a> Interp<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        let mut labels = vec![None; ctx.labels().len()];
        let mut cur = ctx.first_op();
        while let Some(idx) = cur {
            let op = ctx.op(idx);
            if op.opc == Opcode::SetLabel {
                labels[op.carg(0) as usize] = Some(idx);
            }
            cur = ctx.next_op(idx);
        }
        Self {
            ctx,
            vals: vec![0; ctx.nb_temps() as usize],
            labels,
        }
    }

    /// Set the value of a fixed or local temp before running.
    pub fn set(&mut self, idx: TempIdx, val: u64) {
        let ty = self.ctx.temp(idx).ty;
        self.vals[idx.0 as usize] = val & ty.mask();
    }

    /// Current value of a non-global temp.
    pub fn get(&self, idx: TempIdx) -> u64 {
        self.vals[idx.0 as usize]
    }

    fn global_addr(&self, idx: TempIdx) -> *mut u8 {
        let t = self.ctx.temp(idx);
        let base = t.mem_base.map_or(0, |b| self.vals[b.0 as usize]);
        base.wrapping_add(t.mem_offset as u64) as *mut u8
    }

    unsafe fn read(&self, idx: TempIdx) -> u64 {
        let t = self.ctx.temp(idx);
        match t.kind {
            TempKind::Const => t.val,
            TempKind::Global => {
                let p = self.global_addr(idx);
                match t.ty {
                    Type::I32 => (p as *const u32).read_unaligned() as u64,
                    Type::I64 => (p as *const u64).read_unaligned(),
                }
            }
            _ => self.vals[idx.0 as usize],
        }
    }

    unsafe fn write(&mut self, idx: TempIdx, val: u64) {
        let t = self.ctx.temp(idx);
        let val = val & t.ty.mask();
        match t.kind {
            TempKind::Const => panic!("write to constant tmp {}", idx.0),
            TempKind::Global => {
                let p = self.global_addr(idx);
                match t.ty {
                    Type::I32 => (p as *mut u32).write_unaligned(val as u32),
                    Type::I64 => (p as *mut u64).write_unaligned(val),
                }
            }
            _ => self.vals[idx.0 as usize] = val,
        }
    }

    fn host_addr(base: u64, op: &Op) -> *mut u8 {
        let offset = op.carg(0) as i32 as i64;
        base.wrapping_add(offset as u64) as *mut u8
    }

    fn label_target(&self, id: u32) -> OpIdx {
        match self.labels.get(id as usize).copied().flatten() {
            Some(idx) => idx,
            None => panic!("branch to unplaced label L{id}"),
        }
    }

    /// Run the op stream from its first op.
    ///
    /// # Safety
    /// Host loads, stores and globals dereference the values of their
    /// base temps, and `call` jumps to its constant target as a
    /// [`HelperFn`]. The caller must have set the base temps (the env
    /// pointer) to valid memory matching the offsets used, and every
    /// call target must be a live `HelperFn`.
    pub unsafe fn run(&mut self, mem: &mut dyn GuestMemory) -> InterpExit {
        let ctx = self.ctx;
        let mut cur = ctx.first_op();
        while let Some(idx) = cur {
            let op = ctx.op(idx);
            cur = ctx.next_op(idx);
            let ty = op.op_type;
            match op.opc {
                Opcode::Mov
                | Opcode::ExtUI32I64
                | Opcode::ExtrlI64I32 => {
                    let v = self.read(op.args[1]);
                    let v = match op.opc {
                        Opcode::ExtUI32I64 => v & 0xFFFF_FFFF,
                        _ => v,
                    };
                    self.write(op.args[0], v);
                }
                Opcode::ExtI32I64 => {
                    let v = self.read(op.args[1]);
                    self.write(op.args[0], v as u32 as i32 as i64 as u64);
                }
                Opcode::Neg => {
                    let v = self.read(op.args[1]);
                    self.write(op.args[0], v.wrapping_neg());
                }
                Opcode::Not => {
                    let v = self.read(op.args[1]);
                    self.write(op.args[0], !v);
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::Sar => {
                    let a = self.read(op.args[1]);
                    let b = self.read(op.args[2]);
                    self.write(op.args[0], eval_binary(op.opc, ty, a, b));
                }
                Opcode::SetCond => {
                    let a = self.read(op.args[1]);
                    let b = self.read(op.args[2]);
                    let cond = decode_cond(op.carg(0));
                    self.write(op.args[0], cond.eval(ty, a, b) as u64);
                }
                Opcode::Ld8U
                | Opcode::Ld8S
                | Opcode::Ld16U
                | Opcode::Ld16S
                | Opcode::Ld32U
                | Opcode::Ld32S
                | Opcode::Ld => {
                    let p = Self::host_addr(self.read(op.args[1]), op);
                    let v = match op.opc {
                        Opcode::Ld8U => p.read() as u64,
                        Opcode::Ld8S => p.read() as i8 as i64 as u64,
                        Opcode::Ld16U => (p as *const u16).read_unaligned() as u64,
                        Opcode::Ld16S => {
                            (p as *const u16).read_unaligned() as i16 as i64 as u64
                        }
                        Opcode::Ld32U => (p as *const u32).read_unaligned() as u64,
                        Opcode::Ld32S => {
                            (p as *const u32).read_unaligned() as i32 as i64 as u64
                        }
                        _ => match ty {
                            Type::I32 => (p as *const u32).read_unaligned() as u64,
                            Type::I64 => (p as *const u64).read_unaligned(),
                        },
                    };
                    self.write(op.args[0], v);
                }
                Opcode::St8 | Opcode::St16 | Opcode::St32 | Opcode::St => {
                    let v = self.read(op.args[0]);
                    let p = Self::host_addr(self.read(op.args[1]), op);
                    match (op.opc, ty) {
                        (Opcode::St8, _) => p.write(v as u8),
                        (Opcode::St16, _) => (p as *mut u16).write_unaligned(v as u16),
                        (Opcode::St32, _) | (_, Type::I32) => {
                            (p as *mut u32).write_unaligned(v as u32)
                        }
                        (_, Type::I64) => (p as *mut u64).write_unaligned(v),
                    }
                }
                Opcode::QemuLd => {
                    let addr = self.read(op.args[1]);
                    let memop = MemOp::new(op.carg(0) as u16);
                    let size = memop.size_bytes();
                    let mut v = mem.read(addr, size);
                    if memop.is_bswap() {
                        v = bswap(v, size);
                    }
                    if memop.is_signed() && size < 8 {
                        v = sign_extend(v, size);
                    }
                    self.write(op.args[0], v);
                }
                Opcode::QemuSt => {
                    let v = self.read(op.args[0]);
                    let addr = self.read(op.args[1]);
                    let memop = MemOp::new(op.carg(0) as u16);
                    let size = memop.size_bytes();
                    let v = if memop.is_bswap() { bswap(v, size) } else { v };
                    mem.write(addr, size, v);
                }
                Opcode::Br => {
                    cur = Some(self.label_target(op.carg(0)));
                }
                Opcode::BrCond => {
                    let a = self.read(op.args[0]);
                    let b = self.read(op.args[1]);
                    if decode_cond(op.carg(0)).eval(ty, a, b) {
                        cur = Some(self.label_target(op.carg(1)));
                    }
                }
                Opcode::Call => {
                    let lo = op.carg(0) as u64;
                    let hi = op.carg(1) as u64;
                    let addr = (hi << 32) | lo;
                    let f: HelperFn = std::mem::transmute(addr as usize as *const ());
                    let mut a = [0u64; 6];
                    for (slot, &arg) in a.iter_mut().zip(op.iargs()) {
                        *slot = self.read(arg);
                    }
                    let r = f(a[0], a[1], a[2], a[3], a[4], a[5]);
                    self.write(op.args[0], r);
                }
                Opcode::ExitTb => return InterpExit::ExitTb(op.carg(0) as u64),
                Opcode::GotoPtr => return InterpExit::GotoPtr(self.read(op.args[0])),
                // Unchained: execution falls through to the exit_tb
                // that follows.
                Opcode::GotoTb => {}
                Opcode::PluginCb | Opcode::PluginMemCb => {
                    panic!("unresolved instrumentation marker at op {}", idx.0)
                }
                Opcode::SetLabel
                | Opcode::Mb
                | Opcode::Nop
                | Opcode::Discard
                | Opcode::InsnStart => {}
                Opcode::Count => unreachable!(),
            }
        }
        InterpExit::End
    }
}

fn decode_cond(raw: u32) -> Cond {
    match Cond::from_raw(raw) {
        Some(c) => c,
        None => panic!("invalid condition code {raw}"),
    }
}
