/// A branch target label within a translation block.
///
/// Maps to QEMU's `TCGLabel`. Labels support forward references:
/// branches can reference a label before `set_label` places it.
#[derive(Debug, Clone)]
pub struct Label {
    pub id: u32,
    /// Whether this label has been placed (set_label emitted).
    pub present: bool,
    /// Number of live branch ops targeting this label.
    pub refs: u32,
}

impl Label {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            present: false,
            refs: 0,
        }
    }

    /// Record a branch to this label.
    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    /// Drop a branch to this label (the branch op was removed).
    pub fn remove_ref(&mut self) {
        assert!(self.refs > 0, "label L{} has no references", self.id);
        self.refs -= 1;
    }

    /// Whether branches reference this label before it is placed.
    pub fn has_pending_refs(&self) -> bool {
        self.refs > 0 && !self.present
    }
}
