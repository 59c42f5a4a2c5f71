//! CPUID VM-exit handler.
//!
//! Results come straight from the host processor. The only change is on the
//! feature leaf, where the VMX bit is cleared so the guest does not find out it
//! could run a hypervisor of its own.

use {
    crate::{
        error::HypervisorError,
        host::CpuidSource,
        intel::{capture::GuestRegisters, vm::Vm, vmexit::ExitType},
    },
    bit_field::BitField,
    log::*,
    x86::cpuid::CpuIdResult,
};

/// Processor info and feature bits.
const CPUID_LEAF_FEATURES: u32 = 0x1;

/// CPUID.01H:ECX.VMX[bit 5]
const CPUID_FEATURE_ECX_VMX: usize = 5;

/// Handle a CPUID VM-exit.
///
/// Executes CPUID with the guest's leaf (RAX) and sub-leaf (RCX), writes the
/// four results back into the register snapshot and asks for RIP to be advanced.
pub fn handle_cpuid(vm: &mut Vm, cpuid: &dyn CpuidSource) -> Result<ExitType, HypervisorError> {
    emulate_cpuid(&mut vm.guest_registers, cpuid);
    Ok(ExitType::IncrementRIP)
}

fn emulate_cpuid(regs: &mut GuestRegisters, cpuid: &dyn CpuidSource) {
    let leaf = regs.rax as u32;
    let sub_leaf = regs.rcx as u32;

    trace!("CPUID exit: leaf={:#x}, sub_leaf={:#x}, RIP={:#x}", leaf, sub_leaf, regs.rip);

    let CpuIdResult { eax, ebx, mut ecx, edx } = cpuid.cpuid(leaf, sub_leaf);

    if leaf == CPUID_LEAF_FEATURES {
        ecx.set_bit(CPUID_FEATURE_ECX_VMX, false);
    }

    regs.rax = eax as u64;
    regs.rbx = ebx as u64;
    regs.rcx = ecx as u64;
    regs.rdx = edx as u64;
}
