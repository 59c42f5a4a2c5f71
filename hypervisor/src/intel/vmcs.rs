//! Access to the Virtual Machine Control Structure of the current guest.
//!
//! Exit handlers never issue VMREAD/VMWRITE directly; they go through
//! [`VmcsAccess`] so the active VMCS can be swapped for an in-memory one.

use {
    crate::error::HypervisorError,
    log::error,
    x86::vmx::vmcs::{self, control::PrimaryControls},
};

/// VMCS field encodings not provided by the `ro` module in this crate version.
pub const VM_EXIT_INSTRUCTION_LEN: u32 = 0x440C;

/// Reads and writes fields of the current VMCS.
pub trait VmcsAccess {
    fn read(&self, field: u32) -> u64;
    fn write(&mut self, field: u32, value: u64);
}

/// The VMCS currently loaded on this logical processor.
///
/// Only meaningful between VMPTRLD and VMCLEAR, in VMX root operation.
#[derive(Debug, Default)]
pub struct HardwareVmcs;

impl VmcsAccess for HardwareVmcs {
    fn read(&self, field: u32) -> u64 {
        match unsafe { x86::bits64::vmx::vmread(field) } {
            Ok(value) => value,
            Err(e) => {
                error!("VMREAD of field {:#x} failed: {:?}", field, e);
                0
            }
        }
    }

    fn write(&mut self, field: u32, value: u64) {
        if let Err(e) = unsafe { x86::bits64::vmx::vmwrite(field, value) } {
            error!("VMWRITE of field {:#x} <- {:#x} failed: {:?}", field, value, e);
        }
    }
}

/// Longest valid x86 instruction.
pub const MAX_INSTRUCTION_LEN: u64 = 15;

/// Length of the instruction that caused the current exit.
///
/// A length outside 1..=15 means the VMREAD failed or the exit does not report
/// one; skipping by it would either re-trap forever or land mid-instruction.
pub fn instruction_length(vmcs: &dyn VmcsAccess) -> Result<u64, HypervisorError> {
    let len = vmcs.read(VM_EXIT_INSTRUCTION_LEN);

    if len == 0 || len > MAX_INSTRUCTION_LEN {
        error!("Invalid VM-exit instruction length {}", len);
        return Err(HypervisorError::InvalidInstructionLength(len));
    }

    Ok(len)
}

/// Sets or clears bits of the primary processor-based execution controls.
pub fn update_primary_controls(vmcs: &mut dyn VmcsAccess, flags: PrimaryControls, enable: bool) {
    let mut controls = PrimaryControls::from_bits_truncate(vmcs.read(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32);
    controls.set(flags, enable);
    vmcs.write(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, controls.bits() as u64);
}

/// Returns whether every bit of `flags` is set in the primary processor-based controls.
pub fn primary_controls_contain(vmcs: &dyn VmcsAccess, flags: PrimaryControls) -> bool {
    PrimaryControls::from_bits_truncate(vmcs.read(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32).contains(flags)
}
