use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};

use crate::PluginError;

/// Per-vCPU array of `T` written by generated code.
///
/// Maps to QEMU's `qemu_plugin_scoreboard`. Slot `i` belongs to vCPU `i`;
/// generated code computes slot addresses from a [`ScoreboardRef`], so the
/// scoreboard must outlive every block that references it.
pub struct Scoreboard<T> {
    slots: Box<[UnsafeCell<T>]>,
}

// Generated code on vCPU `i` only touches slot `i`.
unsafe impl<T: Send> Sync for Scoreboard<T> {}

impl<T: Copy + Default> Scoreboard<T> {
    pub fn new(n_vcpus: usize) -> Self {
        assert!(n_vcpus > 0, "scoreboard needs at least one vCPU");
        Self {
            slots: (0..n_vcpus).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    pub fn n_vcpus(&self) -> usize {
        self.slots.len()
    }

    /// Exclusive access to the slot of `vcpu`.
    pub fn slot(&mut self, vcpu: usize) -> &mut T {
        self.slots[vcpu].get_mut()
    }

    /// Current value of the slot of `vcpu`.
    pub fn get(&self, vcpu: usize) -> T {
        // SAFETY: slots are only written by generated code running on
        // the owning vCPU; this is a plain copy of a `Copy` value.
        unsafe { self.slots[vcpu].get().read_volatile() }
    }

    fn base(&self) -> u64 {
        self.slots.as_ptr() as u64
    }

    /// Reference to the `u64` at byte `offset` inside each slot.
    pub fn u64_field(&self, offset: usize) -> Result<ScoreboardRef, PluginError> {
        let size = size_of::<T>();
        if offset % 8 != 0 || align_of::<T>() < 8 {
            return Err(PluginError::MisalignedField { offset });
        }
        if offset + 8 > size {
            return Err(PluginError::FieldOutOfBounds { offset, size });
        }
        Ok(ScoreboardRef {
            base: self.base(),
            element_size: size as u32,
            offset: offset as u32,
            n_vcpus: self.slots.len() as u32,
        })
    }

    /// Sum of `entry` over all vCPUs.
    pub fn sum_u64(&self, entry: ScoreboardRef) -> u64 {
        assert_eq!(entry.base, self.base(), "entry belongs to another scoreboard");
        (0..self.slots.len())
            // SAFETY: `entry` was validated against this scoreboard.
            .map(|vcpu| unsafe { entry.read(vcpu as u32) })
            .fold(0, u64::wrapping_add)
    }
}

/// Location of a `u64` field inside every slot of a scoreboard.
///
/// Maps to QEMU's `qemu_plugin_u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScoreboardRef {
    pub base: u64,
    pub element_size: u32,
    pub offset: u32,
    pub n_vcpus: u32,
}

impl ScoreboardRef {
    /// Host address of the field for `vcpu`.
    pub fn addr(&self, vcpu: u32) -> u64 {
        self.base + vcpu as u64 * self.element_size as u64 + self.offset as u64
    }

    /// # Safety
    /// The scoreboard this was taken from must still be alive.
    pub unsafe fn read(&self, vcpu: u32) -> u64 {
        assert!(vcpu < self.n_vcpus, "vCPU {vcpu} has no scoreboard slot");
        (self.addr(vcpu) as *const u64).read_volatile()
    }

    /// # Safety
    /// The scoreboard this was taken from must still be alive and not be
    /// accessed concurrently for `vcpu`.
    pub unsafe fn write(&self, vcpu: u32, val: u64) {
        assert!(vcpu < self.n_vcpus, "vCPU {vcpu} has no scoreboard slot");
        (self.addr(vcpu) as *mut u64).write_volatile(val);
    }
}
