use crate::context::Context;
use crate::op::Op;
use crate::opcode::{Opcode, PluginCbFrom};
use crate::temp::TempIdx;
use crate::types::{CallFlags, Cond, MemInfo, MemOp, MemRw, Type};

// Constant args are encoded as TempIdx(raw_value as u32).
fn carg(val: u32) -> TempIdx {
    TempIdx(val)
}

impl Context {
    // -- Internal helpers --

    fn emit_binary(
        &mut self,
        opc: Opcode,
        ty: Type,
        dst: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, opc, ty, &[dst, a, b]);
        self.emit_op(op);
        dst
    }

    fn emit_unary(
        &mut self,
        opc: Opcode,
        ty: Type,
        dst: TempIdx,
        src: TempIdx,
    ) -> TempIdx {
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, opc, ty, &[dst, src]);
        self.emit_op(op);
        dst
    }

    // -- Binary ALU (1 oarg, 2 iargs) --

    pub fn gen_add(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Add, ty, d, a, b)
    }

    pub fn gen_sub(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Sub, ty, d, a, b)
    }

    pub fn gen_mul(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Mul, ty, d, a, b)
    }

    pub fn gen_and(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::And, ty, d, a, b)
    }

    pub fn gen_or(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Or, ty, d, a, b)
    }

    pub fn gen_xor(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Xor, ty, d, a, b)
    }

    pub fn gen_shl(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Shl, ty, d, a, b)
    }

    pub fn gen_shr(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Shr, ty, d, a, b)
    }

    pub fn gen_sar(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
    ) -> TempIdx {
        self.emit_binary(Opcode::Sar, ty, d, a, b)
    }

    /// d = a + imm, with `imm` materialized as a deduplicated constant.
    pub fn gen_addi(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        imm: u64,
    ) -> TempIdx {
        let c = self.new_const(ty, imm);
        self.gen_add(ty, d, a, c)
    }

    /// d = a * imm.
    pub fn gen_muli(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        imm: u64,
    ) -> TempIdx {
        let c = self.new_const(ty, imm);
        self.gen_mul(ty, d, a, c)
    }

    // -- Unary (1 oarg, 1 iarg) --

    pub fn gen_neg(&mut self, ty: Type, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit_unary(Opcode::Neg, ty, d, s)
    }

    pub fn gen_not(&mut self, ty: Type, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit_unary(Opcode::Not, ty, d, s)
    }

    pub fn gen_mov(&mut self, ty: Type, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit_unary(Opcode::Mov, ty, d, s)
    }

    pub fn gen_movi(&mut self, ty: Type, d: TempIdx, val: u64) -> TempIdx {
        let c = self.new_const(ty, val);
        self.gen_mov(ty, d, c)
    }

    // -- Type conversion (1 oarg, 1 iarg) --

    /// Sign-extend i32 → i64.
    pub fn gen_ext_i32_i64(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit_unary(Opcode::ExtI32I64, Type::I64, d, s)
    }

    /// Zero-extend i32 → i64.
    pub fn gen_ext_u32_i64(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit_unary(Opcode::ExtUI32I64, Type::I64, d, s)
    }

    /// Truncate i64 → i32 (low 32 bits).
    pub fn gen_extrl_i64_i32(&mut self, d: TempIdx, s: TempIdx) -> TempIdx {
        self.emit_unary(Opcode::ExtrlI64I32, Type::I32, d, s)
    }

    // -- SetCond (1 oarg, 2 iargs, 1 carg) --

    pub fn gen_setcond(
        &mut self,
        ty: Type,
        d: TempIdx,
        a: TempIdx,
        b: TempIdx,
        cond: Cond,
    ) -> TempIdx {
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::SetCond,
            ty,
            &[d, a, b, carg(cond as u32)],
        );
        self.emit_op(op);
        d
    }

    // -- Host Ld/St (for CPUState access) --

    /// Load: dst = *(base + offset)
    /// Ld: 1 oarg, 1 iarg, 1 carg (offset)
    pub fn gen_ld(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld, ty, dst, base, offset)
    }

    /// Store: *(base + offset) = src
    /// St: 0 oargs, 2 iargs, 1 carg (offset)
    pub fn gen_st(
        &mut self,
        ty: Type,
        src: TempIdx,
        base: TempIdx,
        offset: i64,
    ) {
        self.emit_sized_store(Opcode::St, ty, src, base, offset);
    }

    // -- Sized loads (1 oarg, 1 iarg, 1 carg) --

    fn emit_sized_load(
        &mut self,
        opc: Opcode,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        debug_assert!(i32::try_from(offset).is_ok(), "offset {offset} out of range");
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, opc, ty, &[dst, base, carg(offset as u32)]);
        self.emit_op(op);
        dst
    }

    /// Load unsigned byte: dst = *(u8*)(base + offset)
    pub fn gen_ld8u(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld8U, ty, dst, base, offset)
    }

    /// Load signed byte: dst = *(i8*)(base + offset)
    pub fn gen_ld8s(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld8S, ty, dst, base, offset)
    }

    /// Load unsigned halfword: dst = *(u16*)(base + offset)
    pub fn gen_ld16u(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld16U, ty, dst, base, offset)
    }

    /// Load signed halfword: dst = *(i16*)(base + offset)
    pub fn gen_ld16s(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld16S, ty, dst, base, offset)
    }

    /// Load unsigned word: dst = *(u32*)(base + offset)
    pub fn gen_ld32u(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld32U, ty, dst, base, offset)
    }

    /// Load signed word: dst = *(i32*)(base + offset)
    pub fn gen_ld32s(
        &mut self,
        ty: Type,
        dst: TempIdx,
        base: TempIdx,
        offset: i64,
    ) -> TempIdx {
        self.emit_sized_load(Opcode::Ld32S, ty, dst, base, offset)
    }

    // -- Sized stores (0 oargs, 2 iargs, 1 carg) --

    fn emit_sized_store(
        &mut self,
        opc: Opcode,
        ty: Type,
        src: TempIdx,
        base: TempIdx,
        offset: i64,
    ) {
        debug_assert!(i32::try_from(offset).is_ok(), "offset {offset} out of range");
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, opc, ty, &[src, base, carg(offset as u32)]);
        self.emit_op(op);
    }

    /// Store byte: *(u8*)(base + offset) = src
    pub fn gen_st8(
        &mut self,
        ty: Type,
        src: TempIdx,
        base: TempIdx,
        offset: i64,
    ) {
        self.emit_sized_store(Opcode::St8, ty, src, base, offset);
    }

    /// Store halfword: *(u16*)(base + offset) = src
    pub fn gen_st16(
        &mut self,
        ty: Type,
        src: TempIdx,
        base: TempIdx,
        offset: i64,
    ) {
        self.emit_sized_store(Opcode::St16, ty, src, base, offset);
    }

    /// Store word: *(u32*)(base + offset) = src
    pub fn gen_st32(
        &mut self,
        ty: Type,
        src: TempIdx,
        base: TempIdx,
        offset: i64,
    ) {
        self.emit_sized_store(Opcode::St32, ty, src, base, offset);
    }

    // -- Control flow --

    /// Unconditional branch to label.
    /// Br: 0 oargs, 0 iargs, 1 carg (label_id)
    pub fn gen_br(&mut self, label_id: u32) {
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, Opcode::Br, Type::I64, &[carg(label_id)]);
        self.emit_op(op);
    }

    /// Conditional branch.
    /// BrCond: 0 oargs, 2 iargs, 2 cargs (cond, label_id)
    pub fn gen_brcond(
        &mut self,
        ty: Type,
        a: TempIdx,
        b: TempIdx,
        cond: Cond,
        label_id: u32,
    ) {
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::BrCond,
            ty,
            &[a, b, carg(cond as u32), carg(label_id)],
        );
        self.emit_op(op);
    }

    /// Branch if `a <cond> imm`.
    pub fn gen_brcondi(
        &mut self,
        ty: Type,
        a: TempIdx,
        imm: u64,
        cond: Cond,
        label_id: u32,
    ) {
        let b = self.new_const(ty, imm);
        self.gen_brcond(ty, a, b, cond, label_id);
    }

    /// Define label position.
    /// SetLabel: 0 oargs, 0 iargs, 1 carg (label_id)
    pub fn gen_set_label(&mut self, label_id: u32) {
        let idx = self.next_op_idx();
        let op =
            Op::with_args(idx, Opcode::SetLabel, Type::I64, &[carg(label_id)]);
        self.emit_op(op);
    }

    // -- TB exit --
    //
    // While an instrumented instruction is open, every op that leaves
    // the block is preceded by a plugin_cb(after_tb) marker.

    fn gen_plugin_exit_marker(&mut self) {
        if self.plugin_insn().is_some() {
            self.gen_plugin_cb(PluginCbFrom::AfterTb);
        }
    }

    /// GotoTb: 0 oargs, 0 iargs, 1 carg (tb_idx)
    pub fn gen_goto_tb(&mut self, tb_idx: u32) {
        self.gen_plugin_exit_marker();
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, Opcode::GotoTb, Type::I64, &[carg(tb_idx)]);
        self.emit_op(op);
    }

    /// ExitTb: 0 oargs, 0 iargs, 1 carg (val)
    pub fn gen_exit_tb(&mut self, val: u32) {
        self.gen_plugin_exit_marker();
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, Opcode::ExitTb, Type::I64, &[carg(val)]);
        self.emit_op(op);
    }

    /// GotoPtr: indirect jump through register.
    pub fn gen_goto_ptr(&mut self, ptr: TempIdx) {
        self.gen_plugin_exit_marker();
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, Opcode::GotoPtr, Type::I64, &[ptr]);
        self.emit_op(op);
    }

    // -- Boundary --

    /// InsnStart: 0 oargs, 0 iargs, 2 cargs (pc_lo, pc_hi)
    pub fn gen_insn_start(&mut self, pc: u64) {
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::InsnStart,
            Type::I64,
            &[carg(pc as u32), carg((pc >> 32) as u32)],
        );
        self.emit_op(op);
    }

    /// Mb: memory barrier.
    pub fn gen_mb(&mut self, bar_type: u32) {
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, Opcode::Mb, Type::I64, &[carg(bar_type)]);
        self.emit_op(op);
    }

    /// Call helper: dst = helper(args[0..6])
    /// Call: 1 oarg, 6 iargs, 2 cargs (func_lo, func_hi)
    pub fn gen_call(
        &mut self,
        dst: TempIdx,
        helper: u64,
        args: &[TempIdx],
    ) -> TempIdx {
        self.gen_call_flags(dst, helper, CallFlags::NONE, args)
    }

    /// Call helper with explicit call flags (stored in `param2`).
    pub fn gen_call_flags(
        &mut self,
        dst: TempIdx,
        helper: u64,
        flags: CallFlags,
        args: &[TempIdx],
    ) -> TempIdx {
        assert!(args.len() <= 6, "helpers take at most 6 arguments");
        let mut full_args = Vec::with_capacity(1 + 6 + 2);
        full_args.push(dst);
        let zero = self.new_const(Type::I64, 0);
        for i in 0..6 {
            let arg = args.get(i).copied().unwrap_or(zero);
            full_args.push(arg);
        }
        full_args.push(carg(helper as u32));
        full_args.push(carg((helper >> 32) as u32));
        let idx = self.next_op_idx();
        let mut op = Op::with_args(idx, Opcode::Call, Type::I64, &full_args);
        op.param2 = flags.bits();
        self.emit_op(op);
        self.note_helper_call(flags);
        dst
    }

    pub fn gen_discard(&mut self, ty: Type, t: TempIdx) {
        let idx = self.next_op_idx();
        let op = Op::with_args(idx, Opcode::Discard, ty, &[t]);
        self.emit_op(op);
    }

    // -- Guest memory access --
    //
    // With an instrumented instruction open, each access is preceded
    // by a plugin_mem_cb marker carrying the address and access info.

    pub fn gen_qemu_ld(
        &mut self,
        ty: Type,
        dst: TempIdx,
        addr: TempIdx,
        memop: MemOp,
    ) -> TempIdx {
        if self.plugin_insn().is_some() {
            self.gen_plugin_mem_cb(addr, MemInfo::new(memop, MemRw::R));
        }
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::QemuLd,
            ty,
            &[dst, addr, carg(memop.bits() as u32)],
        );
        self.emit_op(op);
        dst
    }

    pub fn gen_qemu_st(
        &mut self,
        ty: Type,
        val: TempIdx,
        addr: TempIdx,
        memop: MemOp,
    ) {
        if self.plugin_insn().is_some() {
            self.gen_plugin_mem_cb(addr, MemInfo::new(memop, MemRw::W));
        }
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::QemuSt,
            ty,
            &[val, addr, carg(memop.bits() as u32)],
        );
        self.emit_op(op);
    }

    // -- Instrumentation markers --

    /// PluginCb: 0 oargs, 0 iargs, 1 carg (from)
    pub fn gen_plugin_cb(&mut self, from: PluginCbFrom) {
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::PluginCb,
            Type::I64,
            &[carg(from as u32)],
        );
        self.emit_op(op);
    }

    /// PluginMemCb: 0 oargs, 1 iarg (addr), 1 carg (meminfo)
    pub fn gen_plugin_mem_cb(&mut self, addr: TempIdx, info: MemInfo) {
        let idx = self.next_op_idx();
        let op = Op::with_args(
            idx,
            Opcode::PluginMemCb,
            Type::I64,
            &[addr, carg(info.raw())],
        );
        self.emit_op(op);
    }
}
