//! IR dump: human-readable text output for TCG ops.
//!
//! Mirrors QEMU's `tcg_dump_ops()` in `tcg/tcg.c`, including the
//! `plugin_cb` / `plugin_mem_cb` instrumentation markers.

use std::fmt::Write as FmtWrite;
use std::io::Write;

use crate::context::Context;
use crate::op::Op;
use crate::opcode::{Opcode, PluginCbFrom};
use crate::temp::{TempIdx, TempKind};
use crate::types::{CallFlags, Cond, MemInfo, Type};

/// Format a condition code as a short name.
fn cond_name(c: u32) -> &'static str {
    match Cond::from_raw(c) {
        Some(Cond::Never) => "never",
        Some(Cond::Always) => "always",
        Some(Cond::Eq) => "eq",
        Some(Cond::Ne) => "ne",
        Some(Cond::Lt) => "lt",
        Some(Cond::Ge) => "ge",
        Some(Cond::Le) => "le",
        Some(Cond::Gt) => "gt",
        Some(Cond::Ltu) => "ltu",
        Some(Cond::Geu) => "geu",
        Some(Cond::Leu) => "leu",
        Some(Cond::Gtu) => "gtu",
        Some(Cond::TstEq) => "tsteq",
        Some(Cond::TstNe) => "tstne",
        None => "???",
    }
}

/// Format a temp reference for display.
fn fmt_temp(ctx: &Context, idx: TempIdx, buf: &mut String) {
    let i = idx.0 as usize;
    if i >= ctx.nb_temps() as usize {
        let v = idx.0;
        let _ = write!(buf, "$0x{v:x}");
        return;
    }
    let t = ctx.temp(idx);
    let _ = match t.kind {
        TempKind::Const => write!(buf, "$0x{:x}", t.val),
        TempKind::Global | TempKind::Fixed => match t.name {
            Some(name) => write!(buf, "{name}"),
            None => write!(buf, "g{i}"),
        },
        TempKind::Ebb | TempKind::Tb => {
            let local = i as u32 - ctx.nb_globals();
            write!(buf, "tmp{local}")
        }
    };
}

fn fmt_meminfo(info: MemInfo) -> String {
    let dir = match (info.rw().bits() & 1 != 0, info.is_store()) {
        (true, true) => "rw",
        (false, true) => "w",
        (true, false) => "r",
        (false, false) => "-",
    };
    let sign = if info.is_signed() { "s" } else { "u" };
    let end = if info.is_big_endian() { "be" } else { "le" };
    format!("{dir}:{sign}{}:{end}", info.size_bytes() * 8)
}

/// Build the opcode name with type suffix for polymorphic ops.
fn op_name(op: &Op) -> String {
    let def = op.opc.def();
    if op.opc.is_int_polymorphic() {
        let suffix = match op.op_type {
            Type::I32 => "_i32",
            Type::I64 => "_i64",
        };
        format!("{}{suffix}", def.name)
    } else {
        def.name.to_string()
    }
}

/// Dump all IR ops in `ctx` to the given writer.
///
/// Output format mirrors QEMU's `tcg_dump_ops()`.
pub fn dump_ops(ctx: &Context, w: &mut impl Write) -> std::io::Result<()> {
    dump_ops_with(ctx, w, |_, _| Ok(()))
}

/// Dump the op stream into a `String`, for log output.
pub fn dump_to_string(ctx: &Context) -> String {
    let mut out = Vec::new();
    match dump_ops(ctx, &mut out) {
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(e) => format!("<dump failed: {e}>"),
    }
}

/// Dump IR ops with an annotation callback for `InsnStart`.
///
/// `insn_anno` is called at each guest instruction boundary with
/// `(pc, writer)`: use it to print source instruction bytes or
/// disassembly on the `---- 0x...` header line.
pub fn dump_ops_with(
    ctx: &Context,
    w: &mut impl Write,
    insn_anno: impl Fn(u64, &mut dyn Write) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let mut buf = String::with_capacity(128);

    for op in ctx.ops() {
        match op.opc {
            Opcode::InsnStart => {
                let lo = op.carg(0) as u64;
                let hi = op.carg(1) as u64;
                let pc = (hi << 32) | lo;
                write!(w, " ---- 0x{pc:016x}")?;
                insn_anno(pc, w)?;
                writeln!(w)?;
                writeln!(w, " insn_start $0x{pc:x}")?;
                continue;
            }
            Opcode::SetLabel => {
                writeln!(w, " L{}:", op.carg(0))?;
                continue;
            }
            Opcode::PluginCb => {
                let from = PluginCbFrom::from_raw(op.carg(0))
                    .map_or("???", PluginCbFrom::name);
                writeln!(w, " plugin_cb {from}")?;
                continue;
            }
            _ => {}
        }

        write!(w, " {}", op_name(op))?;

        // Output args
        let oargs = op.oargs();
        for (i, &a) in oargs.iter().enumerate() {
            if i > 0 {
                write!(w, ",")?;
            }
            buf.clear();
            fmt_temp(ctx, a, &mut buf);
            write!(w, " {buf}")?;
        }

        // Input args
        let iargs = op.iargs();
        let has_oargs = !oargs.is_empty();
        for (i, &a) in iargs.iter().enumerate() {
            if has_oargs || i > 0 {
                write!(w, ",")?;
            }
            buf.clear();
            fmt_temp(ctx, a, &mut buf);
            write!(w, " {buf}")?;
        }

        // Constant args: special handling per opcode
        let cargs = op.cargs();
        match op.opc {
            Opcode::BrCond => {
                let cond = cond_name(cargs[0].0);
                write!(w, ", {cond}, L{}", cargs[1].0)?;
            }
            Opcode::SetCond => {
                write!(w, ", {}", cond_name(cargs[0].0))?;
            }
            Opcode::Br => {
                write!(w, " L{}", cargs[0].0)?;
            }
            Opcode::Call => {
                let lo = cargs[0].0 as u64;
                let hi = cargs[1].0 as u64;
                let addr = (hi << 32) | lo;
                write!(w, ", $0x{addr:x}")?;
                let flags = CallFlags::from_bits(op.param2);
                if flags != CallFlags::NONE {
                    write!(w, ", flags=0x{:x}", flags.bits())?;
                }
            }
            Opcode::PluginMemCb => {
                let info = MemInfo::from_raw(cargs[0].0);
                write!(w, ", {}", fmt_meminfo(info))?;
            }
            _ => {
                let has_prev = !oargs.is_empty() || !iargs.is_empty();
                for (i, &c) in cargs.iter().enumerate() {
                    if has_prev || i > 0 {
                        write!(w, ",")?;
                    }
                    write!(w, " $0x{:x}", c.0)?;
                }
            }
        }

        writeln!(w)?;
    }
    Ok(())
}
