//! EPT violation VM-exit handler: demand paging of guest memory.
//!
//! Guest RAM starts out unmapped. The first touch of a page faults here and the
//! page is backed with a fresh host frame; a pass-through window is mapped onto
//! the hardware behind it. Addresses outside both are fatal for the guest.

use {
    crate::{
        allocator::{AllocFlags, PhysicalMemory},
        error::HypervisorError,
        intel::{
            ept::{align_down, mapping_policy, AccessType, MappingPolicy},
            vm::Vm,
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs,
};

/// Handles an EPT violation by mapping the faulting page.
///
/// RIP is not advanced: the faulting access is retried and now succeeds.
pub fn handle_ept_violation(vm: &mut Vm, memory: &dyn PhysicalMemory) -> Result<ExitType, HypervisorError> {
    let guest_pa = vm.vmcs.read(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);
    let guest_page_pa = align_down(guest_pa);
    trace!("EPT violation at GPA {:#x}, RIP {:#x}", guest_pa, vm.guest_registers.rip);

    match mapping_policy(guest_pa, vm.guest_info.phys_sz) {
        Some(MappingPolicy::DemandAllocate) => {
            map_fresh_frame(vm, memory, guest_page_pa)?;
        }
        Some(MappingPolicy::Passthrough { host_pa }) => {
            debug!("Passing host MMIO {:#x} through at GPA {:#x}", host_pa, guest_page_pa);
            vm.ept
                .map_hva_to_gpa(memory.pa2kva(host_pa), guest_page_pa, AccessType::READ_WRITE_EXECUTE, false)
                .map_err(|_| HypervisorError::EptMappingFailed(guest_page_pa))?;
        }
        None => {
            warn!("EPT violation outside guest memory at GPA {:#x} (guest size {:#x})", guest_pa, vm.guest_info.phys_sz);
            return Err(HypervisorError::GuestMemoryOutOfRange(guest_pa));
        }
    }

    Ok(ExitType::Continue)
}

/// Backs `guest_page_pa` with a new zeroed frame owned by the guest's EPT.
pub(crate) fn map_fresh_frame(vm: &mut Vm, memory: &dyn PhysicalMemory, guest_page_pa: u64) -> Result<u64, HypervisorError> {
    let Some(frame) = memory.page_alloc(AllocFlags::Zero) else {
        error!("Failed to allocate a page for guest at GPA {:#x}: out of memory", guest_page_pa);
        return Err(HypervisorError::OutOfMemory);
    };
    memory.page_incref(frame);

    let kva = memory.page2kva(frame);
    if let Err(e) = vm.ept.map_hva_to_gpa(kva, guest_page_pa, AccessType::READ_WRITE_EXECUTE, false) {
        error!("Mapping frame {:#x} at GPA {:#x} failed: {:?}", frame.start_address(), guest_page_pa, e);
        memory.page_decref(frame);
        return Err(HypervisorError::EptMappingFailed(guest_page_pa));
    }

    trace!("GPA {:#x} backed by frame {:#x}", guest_page_pa, frame.start_address());
    Ok(kva)
}
