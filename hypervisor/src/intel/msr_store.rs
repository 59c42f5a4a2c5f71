//! Per-guest virtual MSR store.
//!
//! The store doubles as the guest's VM-entry MSR-load / VM-exit MSR-store area,
//! so entries follow the hardware layout.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-15. Format of an MSR Entry

use {
    crate::{error::HypervisorError, global_const::MAX_MSR_ENTRIES},
    static_assertions::const_assert_eq,
};

/// One MSR entry as read and written by VM entry/exit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmxMsrEntry {
    pub msr_index: u32,
    pub reserved: u32,
    pub msr_value: u64,
}

const_assert_eq!(core::mem::size_of::<VmxMsrEntry>(), 16);

/// A bounded set of virtual MSRs with unique indices.
#[repr(C, align(16))]
#[derive(Debug, Clone)]
pub struct VirtualMsrStore {
    entries: [VmxMsrEntry; MAX_MSR_ENTRIES],
    count: usize,
}

impl Default for VirtualMsrStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMsrStore {
    pub const fn new() -> Self {
        Self {
            entries: [VmxMsrEntry { msr_index: 0, reserved: 0, msr_value: 0 }; MAX_MSR_ENTRIES],
            count: 0,
        }
    }

    /// Adds `msr_index` with its initial value.
    pub fn insert(&mut self, msr_index: u32, msr_value: u64) -> Result<(), HypervisorError> {
        if self.contains(msr_index) {
            return Err(HypervisorError::DuplicateMsrEntry(msr_index));
        }

        let slot = self.entries.get_mut(self.count).ok_or(HypervisorError::MsrStoreFull)?;
        *slot = VmxMsrEntry { msr_index, reserved: 0, msr_value };
        self.count += 1;

        Ok(())
    }

    pub fn contains(&self, msr_index: u32) -> bool {
        self.as_slice().iter().any(|e| e.msr_index == msr_index)
    }

    /// Looks up `msr_index`. A miss means the guest was set up without an MSR
    /// the emulation relies on, which is reported as an invariant violation.
    pub fn find(&self, msr_index: u32) -> Result<&VmxMsrEntry, HypervisorError> {
        self.as_slice()
            .iter()
            .find(|e| e.msr_index == msr_index)
            .ok_or(HypervisorError::VirtualMsrMissing(msr_index))
    }

    pub fn find_mut(&mut self, msr_index: u32) -> Result<&mut VmxMsrEntry, HypervisorError> {
        let count = self.count;
        self.entries[..count]
            .iter_mut()
            .find(|e| e.msr_index == msr_index)
            .ok_or(HypervisorError::VirtualMsrMissing(msr_index))
    }

    pub fn as_slice(&self) -> &[VmxMsrEntry] {
        &self.entries[..self.count]
    }

    /// Base address of the area, for the VMCS MSR-load/store address fields.
    pub fn area_address(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
