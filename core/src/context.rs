use rustc_hash::FxHashMap;

use crate::label::Label;
use crate::op::{Op, OpIdx};
use crate::opcode::Opcode;
use crate::temp::{Temp, TempIdx};
use crate::types::{CallFlags, Type, TYPE_COUNT};

/// Maximum number of guest instructions per TB.
pub const MAX_INSNS: usize = 512;
/// Default IR buffer capacity, in live ops.
pub const OP_BUF_DEFAULT: usize = 4000;

const NIL: u32 = u32::MAX;

/// Doubly-linked list node for one op slot.
#[derive(Debug, Clone, Copy)]
struct OpLink {
    prev: u32,
    next: u32,
    linked: bool,
}

impl OpLink {
    const UNLINKED: OpLink = OpLink {
        prev: NIL,
        next: NIL,
        linked: false,
    };
}

/// Per-thread TCG translation context.
///
/// Maps to QEMU's `TCGContext`. Holds all state needed during translation
/// of a single translation block: temporaries, the IR op stream and labels.
///
/// Ops live in an arena and are chained into a doubly-linked stream, so an
/// op can be inserted before any other op or removed in O(1). Removed slots
/// are recycled by later emission.
pub struct Context {
    temps: Vec<Temp>,
    ops: Vec<Op>,
    links: Vec<OpLink>,
    head: u32,
    tail: u32,
    free_ops: Vec<OpIdx>,
    nb_ops: usize,
    max_ops: usize,
    /// When set, emitted ops are linked before this op instead of
    /// appended at the tail.
    emit_before: Option<OpIdx>,
    labels: Vec<Label>,

    /// Number of global temps (always at the front of `temps`).
    nb_globals: u32,
    /// The env pointer temp, once registered by the frontend.
    env: Option<TempIdx>,

    // -- Constant deduplication --
    /// Per-type hash map from constant value to TempIdx,
    /// avoiding duplicate const temps.
    const_table: [FxHashMap<u64, TempIdx>; TYPE_COUNT],

    // -- EBB temp pool --
    free_temps: [Vec<TempIdx>; TYPE_COUNT],
    /// Temps handed out inside each open `temp_scope`, innermost last.
    temp_scopes: Vec<Vec<TempIdx>>,

    // -- Instrumentation --
    /// Index of the guest instruction being instrumented, if any.
    plugin_insn: Option<u32>,
    /// A helper with side effects was called since the flag was taken.
    plugin_calls_helpers: bool,
}

impl Context {
    pub fn new() -> Self {
        Self {
            temps: Vec::with_capacity(256),
            ops: Vec::with_capacity(512),
            links: Vec::with_capacity(512),
            head: NIL,
            tail: NIL,
            free_ops: Vec::new(),
            nb_ops: 0,
            max_ops: OP_BUF_DEFAULT,
            emit_before: None,
            labels: Vec::with_capacity(32),
            nb_globals: 0,
            env: None,
            const_table: Default::default(),
            free_temps: Default::default(),
            temp_scopes: Vec::new(),
            plugin_insn: None,
            plugin_calls_helpers: false,
        }
    }

    /// Reset context for translating a new TB. Preserves globals.
    pub fn reset(&mut self) {
        self.temps.truncate(self.nb_globals as usize);
        self.ops.clear();
        self.links.clear();
        self.head = NIL;
        self.tail = NIL;
        self.free_ops.clear();
        self.nb_ops = 0;
        self.emit_before = None;
        self.labels.clear();
        for table in &mut self.const_table {
            table.clear();
        }
        for pool in &mut self.free_temps {
            pool.clear();
        }
        self.temp_scopes.clear();
        self.plugin_insn = None;
        self.plugin_calls_helpers = false;
    }

    // -- Temp allocation --

    pub fn nb_globals(&self) -> u32 {
        self.nb_globals
    }

    pub fn nb_temps(&self) -> u32 {
        self.temps.len() as u32
    }

    /// Allocate an EBB-scoped temporary, reusing a freed one of the
    /// same type when available.
    pub fn new_temp(&mut self, ty: Type) -> TempIdx {
        let idx = match self.free_temps[ty as usize].pop() {
            Some(idx) => idx,
            None => {
                let idx = TempIdx(self.temps.len() as u32);
                self.temps.push(Temp::new_ebb(idx, ty));
                idx
            }
        };
        if let Some(scope) = self.temp_scopes.last_mut() {
            scope.push(idx);
        }
        idx
    }

    /// Allocate a new TB-scoped temporary.
    pub fn new_temp_tb(&mut self, ty: Type) -> TempIdx {
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(Temp::new_tb(idx, ty));
        idx
    }

    /// Return an EBB temp to the pool. The temp must not be read
    /// again by ops emitted after this point.
    pub fn free_temp(&mut self, idx: TempIdx) {
        let t = self.temp(idx);
        assert!(t.is_ebb(), "only EBB temps can be freed (tmp {})", idx.0);
        let pool = &mut self.free_temps[t.ty as usize];
        debug_assert!(!pool.contains(&idx), "double free of tmp {}", idx.0);
        pool.push(idx);
        for scope in &mut self.temp_scopes {
            scope.retain(|&t| t != idx);
        }
    }

    /// Number of freed EBB temps of `ty` waiting for reuse.
    pub fn nb_free_temps(&self, ty: Type) -> usize {
        self.free_temps[ty as usize].len()
    }

    /// Run `f`; every EBB temp it allocates is freed when it returns.
    pub fn temp_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.temp_scopes.push(Vec::new());
        let r = f(self);
        if let Some(scope) = self.temp_scopes.pop() {
            for idx in scope {
                let ty = self.temps[idx.0 as usize].ty;
                self.free_temps[ty as usize].push(idx);
            }
        }
        r
    }

    /// Run a rewrite of the already-emitted op stream.
    ///
    /// EBB temps freed before the rewrite may still be read by ops that
    /// follow a rewrite point, so the pool is emptied first and `f`
    /// only ever receives fresh temps.
    pub fn rewrite_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        for pool in &mut self.free_temps {
            pool.clear();
        }
        let r = self.temp_scope(f);
        assert!(
            self.emit_before.is_none(),
            "rewrite left an insertion point behind"
        );
        r
    }

    /// Get or create a constant temp (deduplicated per type).
    pub fn new_const(&mut self, ty: Type, val: u64) -> TempIdx {
        let val = val & ty.mask();
        let type_idx = ty as usize;
        if let Some(&existing) = self.const_table[type_idx].get(&val) {
            return existing;
        }
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(Temp::new_const(idx, ty, val));
        self.const_table[type_idx].insert(val, idx);
        idx
    }

    /// Register a global temp (must be called before any
    /// non-global allocation).
    /// The `base` is the TempIdx of the env pointer (a fixed temp).
    pub fn new_global(
        &mut self,
        ty: Type,
        base: TempIdx,
        offset: i64,
        name: &'static str,
    ) -> TempIdx {
        assert_eq!(
            self.temps.len() as u32,
            self.nb_globals,
            "globals must be registered before locals"
        );
        let idx = TempIdx(self.temps.len() as u32);
        self.temps
            .push(Temp::new_global(idx, ty, base, offset, name));
        self.nb_globals += 1;
        idx
    }

    /// Register a fixed-register temp (must be called
    /// before any non-global allocation).
    pub fn new_fixed(
        &mut self,
        ty: Type,
        reg: u8,
        name: &'static str,
    ) -> TempIdx {
        assert_eq!(
            self.temps.len() as u32,
            self.nb_globals,
            "fixed temps must be registered before locals"
        );
        let idx = TempIdx(self.temps.len() as u32);
        self.temps.push(Temp::new_fixed(idx, ty, reg, name));
        self.nb_globals += 1;
        idx
    }

    /// Find a global or fixed temp by name.
    pub fn global_by_name(&self, name: &str) -> Option<TempIdx> {
        self.globals()
            .iter()
            .find(|t| t.name == Some(name))
            .map(|t| t.idx)
    }

    /// Declare `idx` as the env pointer used for CPU state accesses.
    pub fn set_env(&mut self, idx: TempIdx) {
        assert!(self.temp(idx).is_fixed(), "env must be a fixed temp");
        self.env = Some(idx);
    }

    pub fn env(&self) -> TempIdx {
        match self.env {
            Some(env) => env,
            None => panic!("env temp not registered"),
        }
    }

    pub fn temp(&self, idx: TempIdx) -> &Temp {
        &self.temps[idx.0 as usize]
    }

    pub fn temp_mut(&mut self, idx: TempIdx) -> &mut Temp {
        &mut self.temps[idx.0 as usize]
    }

    pub fn temps(&self) -> &[Temp] {
        &self.temps
    }

    /// Iterate over global temps only.
    pub fn globals(&self) -> &[Temp] {
        &self.temps[..self.nb_globals as usize]
    }

    // -- Op stream --

    /// Slot the next emitted op will occupy.
    pub fn next_op_idx(&self) -> OpIdx {
        match self.free_ops.last() {
            Some(&idx) => idx,
            None => OpIdx(self.ops.len() as u32),
        }
    }

    /// Link `op` into the stream, at the tail or before the current
    /// insertion point. `op.idx` must be `next_op_idx()`.
    pub fn emit_op(&mut self, op: Op) -> OpIdx {
        let idx = op.idx;
        assert_eq!(idx, self.next_op_idx(), "op emitted into a stale slot");
        match op.opc {
            Opcode::SetLabel => {
                let label = self.label_mut(op.carg(0));
                assert!(!label.present, "label L{} placed twice", label.id);
                label.present = true;
            }
            _ => {
                if let Some(id) = op.branch_label() {
                    self.label_mut(id).add_ref();
                }
            }
        }
        if self.free_ops.last() == Some(&idx) {
            self.free_ops.pop();
            self.ops[idx.0 as usize] = op;
        } else {
            self.ops.push(op);
            self.links.push(OpLink::UNLINKED);
        }
        match self.emit_before {
            Some(before) => self.link_before(idx, before),
            None => self.link_tail(idx),
        }
        self.nb_ops += 1;
        idx
    }

    /// Run `f` with every emitted op inserted before `at`.
    pub fn emit_before<R>(&mut self, at: OpIdx, f: impl FnOnce(&mut Self) -> R) -> R {
        assert!(self.is_linked(at), "insertion point op {} not in stream", at.0);
        let saved = self.emit_before.replace(at);
        let r = f(self);
        self.emit_before = saved;
        r
    }

    /// Unlink `idx` from the stream; its slot becomes reusable.
    pub fn remove_op(&mut self, idx: OpIdx) {
        assert!(self.is_linked(idx), "op {} removed twice", idx.0);
        let (opc, label) = {
            let op = &self.ops[idx.0 as usize];
            match op.opc {
                Opcode::SetLabel => (op.opc, Some(op.carg(0))),
                _ => (op.opc, op.branch_label()),
            }
        };
        match (opc, label) {
            (Opcode::SetLabel, Some(id)) => self.label_mut(id).present = false,
            (_, Some(id)) => self.label_mut(id).remove_ref(),
            _ => {}
        }
        let OpLink { prev, next, .. } = self.links[idx.0 as usize];
        match prev {
            NIL => self.head = next,
            p => self.links[p as usize].next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.links[n as usize].prev = prev,
        }
        self.links[idx.0 as usize] = OpLink::UNLINKED;
        self.ops[idx.0 as usize].opc = Opcode::Nop;
        self.free_ops.push(idx);
        self.nb_ops -= 1;
    }

    fn link_tail(&mut self, idx: OpIdx) {
        let i = idx.0;
        self.links[i as usize] = OpLink {
            prev: self.tail,
            next: NIL,
            linked: true,
        };
        match self.tail {
            NIL => self.head = i,
            t => self.links[t as usize].next = i,
        }
        self.tail = i;
    }

    fn link_before(&mut self, idx: OpIdx, before: OpIdx) {
        let i = idx.0;
        let b = before.0;
        let prev = self.links[b as usize].prev;
        self.links[i as usize] = OpLink {
            prev,
            next: b,
            linked: true,
        };
        self.links[b as usize].prev = i;
        match prev {
            NIL => self.head = i,
            p => self.links[p as usize].next = i,
        }
    }

    pub fn is_linked(&self, idx: OpIdx) -> bool {
        self.links
            .get(idx.0 as usize)
            .is_some_and(|l| l.linked)
    }

    pub fn first_op(&self) -> Option<OpIdx> {
        (self.head != NIL).then_some(OpIdx(self.head))
    }

    pub fn last_op(&self) -> Option<OpIdx> {
        (self.tail != NIL).then_some(OpIdx(self.tail))
    }

    pub fn next_op(&self, idx: OpIdx) -> Option<OpIdx> {
        let n = self.links[idx.0 as usize].next;
        (n != NIL).then_some(OpIdx(n))
    }

    pub fn prev_op(&self, idx: OpIdx) -> Option<OpIdx> {
        let p = self.links[idx.0 as usize].prev;
        (p != NIL).then_some(OpIdx(p))
    }

    pub fn op(&self, idx: OpIdx) -> &Op {
        &self.ops[idx.0 as usize]
    }

    pub fn op_mut(&mut self, idx: OpIdx) -> &mut Op {
        &mut self.ops[idx.0 as usize]
    }

    /// Iterate over the live ops in stream order.
    pub fn ops(&self) -> Ops<'_> {
        Ops {
            ctx: self,
            cur: self.head,
        }
    }

    /// Number of live ops in the stream.
    pub fn num_ops(&self) -> usize {
        self.nb_ops
    }

    /// Set the IR buffer capacity checked by `op_buf_full`.
    pub fn set_max_ops(&mut self, max_ops: usize) {
        self.max_ops = max_ops;
    }

    /// Whether the op stream has reached its capacity; the translator
    /// stops adding guest instructions once this holds.
    pub fn op_buf_full(&self) -> bool {
        self.nb_ops >= self.max_ops
    }

    // -- Labels --

    pub fn new_label(&mut self) -> u32 {
        let id = self.labels.len() as u32;
        self.labels.push(Label::new(id));
        id
    }

    pub fn label(&self, id: u32) -> &Label {
        &self.labels[id as usize]
    }

    pub fn label_mut(&mut self, id: u32) -> &mut Label {
        &mut self.labels[id as usize]
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    // -- Instrumentation state --

    /// Guest instruction currently open for instrumentation.
    ///
    /// While set, guest memory accesses emit `plugin_mem_cb` markers and
    /// block exits emit `plugin_cb(after_tb)` markers.
    pub fn plugin_insn(&self) -> Option<u32> {
        self.plugin_insn
    }

    pub fn set_plugin_insn(&mut self, insn: Option<u32>) {
        self.plugin_insn = insn;
        self.plugin_calls_helpers = false;
    }

    /// Return and clear whether a helper with side effects was called
    /// since the last `set_plugin_insn`/`take_plugin_calls_helpers`.
    pub fn take_plugin_calls_helpers(&mut self) -> bool {
        std::mem::take(&mut self.plugin_calls_helpers)
    }

    pub(crate) fn note_helper_call(&mut self, flags: CallFlags) {
        if self.plugin_insn.is_some()
            && !flags.contains(CallFlags::NO_SIDE_EFFECTS)
        {
            self.plugin_calls_helpers = true;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the op stream, in order.
pub struct Ops<'a> {
    ctx: &'a Context,
    cur: u32,
}

impl<'a> Iterator for Ops<'a> {
    type Item = &'a Op;

    fn next(&mut self) -> Option<&'a Op> {
        if self.cur == NIL {
            return None;
        }
        let i = self.cur as usize;
        self.cur = self.ctx.links[i].next;
        Some(&self.ctx.ops[i])
    }
}
