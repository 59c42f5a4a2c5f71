//! RDMSR/WRMSR VM-exit handlers.
//!
//! Only IA32_EFER is virtualized. Its value lives in the guest's MSR area, and
//! a guest setting EFER.LME is switched to IA-32e mode on its next VM entry.

use {
    crate::{
        error::HypervisorError,
        intel::{vm::Vm, vmexit::ExitType},
    },
    log::*,
    x86::{
        msr::IA32_EFER,
        vmx::vmcs::{self, control::EntryControls},
    },
    x86_64::registers::model_specific::EferFlags,
};

/// Direction of the MSR access being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

/// Handles RDMSR and WRMSR exits. The MSR index is taken from RCX.
pub fn handle_msr_access(vm: &mut Vm, access_type: MsrAccessType) -> Result<ExitType, HypervisorError> {
    let msr = vm.guest_registers.rcx as u32;

    if msr != IA32_EFER {
        warn!("{:?} of non-virtualized MSR {:#x} at RIP {:#x}", access_type, msr, vm.guest_registers.rip);
        return Err(HypervisorError::UnhandledMsr(msr));
    }

    match access_type {
        MsrAccessType::Read => read_efer(vm),
        MsrAccessType::Write => write_efer(vm),
    }
}

fn read_efer(vm: &mut Vm) -> Result<ExitType, HypervisorError> {
    let value = vm.guest_info.msr_guest_area.find(IA32_EFER)?.msr_value;
    trace!("RDMSR EFER -> {:#x}", value);

    vm.guest_registers.set_edx_eax(value);
    Ok(ExitType::IncrementRIP)
}

fn write_efer(vm: &mut Vm) -> Result<ExitType, HypervisorError> {
    let new_value = vm.guest_registers.edx_eax();
    let entry = vm.guest_info.msr_guest_area.find_mut(IA32_EFER)?;

    let old = EferFlags::from_bits_truncate(entry.msr_value);
    let new = EferFlags::from_bits_truncate(new_value);
    trace!("WRMSR EFER {:#x} -> {:#x}", entry.msr_value, new_value);

    if !old.contains(EferFlags::LONG_MODE_ENABLE) && new.contains(EferFlags::LONG_MODE_ENABLE) {
        debug!("Guest enabled long mode, entering as IA-32e guest from now on");
        let mut entry_controls = EntryControls::from_bits_truncate(vm.vmcs.read(vmcs::control::VMENTRY_CONTROLS) as u32);
        entry_controls.insert(EntryControls::IA32E_MODE_GUEST);
        vm.vmcs.write(vmcs::control::VMENTRY_CONTROLS, entry_controls.bits() as u64);
    }

    entry.msr_value = new_value;
    Ok(ExitType::IncrementRIP)
}
