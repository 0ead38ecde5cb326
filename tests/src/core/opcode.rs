use tcg_core::op::MAX_OP_ARGS;
use tcg_core::opcode::*;
use tcg_core::types::Type;

fn assert_def(
    opc: Opcode,
    nb_oargs: u8,
    nb_iargs: u8,
    nb_cargs: u8,
    flags: OpFlags,
) {
    let def = opc.def();
    assert_eq!(def.nb_oargs, nb_oargs, "{:?} nb_oargs", opc);
    assert_eq!(def.nb_iargs, nb_iargs, "{:?} nb_iargs", opc);
    assert_eq!(def.nb_cargs, nb_cargs, "{:?} nb_cargs", opc);
    assert!(
        def.nb_args() as usize <= MAX_OP_ARGS,
        "{:?} args exceed MAX_OP_ARGS",
        opc
    );
    assert_eq!(def.flags.bits(), flags.bits(), "{:?} flags", opc);
    assert!(!def.name.is_empty(), "{:?} empty name", opc);
}

fn assert_group(
    seen: &mut [bool],
    ops: &[Opcode],
    nb_oargs: u8,
    nb_iargs: u8,
    nb_cargs: u8,
    flags: OpFlags,
) {
    for &opc in ops {
        let idx = opc as usize;
        assert!(!seen[idx], "opcode {:?} duplicated", opc);
        seen[idx] = true;
        assert_def(opc, nb_oargs, nb_iargs, nb_cargs, flags);
    }
}

#[test]
fn opcode_def_table_size() {
    assert_eq!(OPCODE_DEFS.len(), Opcode::Count as usize);
}

#[test]
fn opcode_names_unique() {
    let mut names: Vec<&str> = OPCODE_DEFS.iter().map(|d| d.name).collect();
    let len_before = names.len();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), len_before, "duplicate opcode names found");
}

#[test]
fn opcode_fixed_type() {
    assert_eq!(Opcode::ExtI32I64.fixed_type(), Some(Type::I64));
    assert_eq!(Opcode::ExtrlI64I32.fixed_type(), Some(Type::I32));
    assert_eq!(Opcode::Add.fixed_type(), None);
}

#[test]
fn opcode_block_exits() {
    for opc in [Opcode::ExitTb, Opcode::GotoTb, Opcode::GotoPtr] {
        assert!(opc.is_block_exit(), "{opc:?}");
    }
    for opc in [Opcode::Br, Opcode::BrCond, Opcode::Call, Opcode::PluginCb] {
        assert!(!opc.is_block_exit(), "{opc:?}");
    }
}

#[test]
fn plugin_cb_from_raw() {
    for from in [
        PluginCbFrom::FromTb,
        PluginCbFrom::FromInsn,
        PluginCbFrom::AfterInsn,
        PluginCbFrom::AfterTb,
    ] {
        assert_eq!(PluginCbFrom::from_raw(from as u32), Some(from));
    }
    assert_eq!(PluginCbFrom::from_raw(4), None);
    assert_eq!(PluginCbFrom::AfterTb.name(), "after_tb");
}

#[test]
fn opcode_def_full_coverage() {
    let int = OpFlags::INT;
    let np = OpFlags::NOT_PRESENT;
    let se = OpFlags::SIDE_EFFECTS;
    let cc = OpFlags::CALL_CLOBBER;
    let be = OpFlags::BB_END;
    let bx = OpFlags::BB_EXIT;
    let cb = OpFlags::COND_BRANCH;
    let none = OpFlags::NONE;

    let mut seen = vec![false; Opcode::Count as usize];

    assert_group(&mut seen, &[Opcode::Mov], 1, 1, 0, int.union(np));
    assert_group(&mut seen, &[Opcode::SetCond], 1, 2, 1, int);
    assert_group(
        &mut seen,
        &[
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::And,
            Opcode::Or,
            Opcode::Xor,
            Opcode::Shl,
            Opcode::Shr,
            Opcode::Sar,
        ],
        1,
        2,
        0,
        int,
    );
    assert_group(&mut seen, &[Opcode::Neg, Opcode::Not], 1, 1, 0, int);
    assert_group(
        &mut seen,
        &[Opcode::ExtI32I64, Opcode::ExtUI32I64, Opcode::ExtrlI64I32],
        1,
        1,
        0,
        none,
    );
    assert_group(
        &mut seen,
        &[
            Opcode::Ld8U,
            Opcode::Ld8S,
            Opcode::Ld16U,
            Opcode::Ld16S,
            Opcode::Ld32U,
            Opcode::Ld32S,
            Opcode::Ld,
        ],
        1,
        1,
        1,
        int,
    );
    assert_group(
        &mut seen,
        &[Opcode::St8, Opcode::St16, Opcode::St32, Opcode::St],
        0,
        2,
        1,
        int,
    );
    let guest = cc.union(se).union(int);
    assert_group(&mut seen, &[Opcode::QemuLd], 1, 1, 1, guest);
    assert_group(&mut seen, &[Opcode::QemuSt], 0, 2, 1, guest);
    assert_group(&mut seen, &[Opcode::Br, Opcode::SetLabel], 0, 0, 1, be.union(np));
    assert_group(&mut seen, &[Opcode::BrCond], 0, 2, 2, be.union(cb).union(int));
    assert_group(
        &mut seen,
        &[Opcode::GotoTb, Opcode::ExitTb],
        0,
        0,
        1,
        bx.union(be).union(np),
    );
    assert_group(&mut seen, &[Opcode::GotoPtr], 0, 1, 0, bx.union(be));
    assert_group(&mut seen, &[Opcode::Mb], 0, 0, 1, np);
    assert_group(&mut seen, &[Opcode::Call], 1, 6, 2, cc.union(np));
    assert_group(&mut seen, &[Opcode::PluginCb], 0, 0, 1, se.union(np));
    assert_group(&mut seen, &[Opcode::PluginMemCb], 0, 1, 1, se.union(np));
    assert_group(&mut seen, &[Opcode::Nop], 0, 0, 0, np);
    assert_group(&mut seen, &[Opcode::Discard], 1, 0, 0, np);
    assert_group(&mut seen, &[Opcode::InsnStart], 0, 0, 2, np);

    let missing: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, &s)| !s)
        .map(|(i, _)| i)
        .collect();
    assert!(missing.is_empty(), "opcodes without coverage: {missing:?}");
}
