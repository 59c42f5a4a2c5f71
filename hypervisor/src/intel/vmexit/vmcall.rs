//! Handle VM exits caused by VMCALL (hypercall) from the guest.
//!
//! The call number is in RAX and arguments in RBX, RCX, RDX and RSI. Results go
//! back in RAX (and RBX/RSI where noted):
//!
//! | RAX | Call            | Arguments                                  | Result                   |
//! |-----|-----------------|--------------------------------------------|--------------------------|
//! | 1   | MBMAP           |                                            | RBX = map GPA            |
//! | 2   | IPCSEND         | RBX = dest type, RCX = value, RDX = GPA, RSI = perm | RAX = send result |
//! | 3   | IPCRECV         | RBX = destination GPA                      | RAX = result, RSI = value |
//! | 4   | LAPICEOI        |                                            |                          |
//! | 5   | BACKTOHOST      |                                            |                          |
//! | 6   | GETDISKIMGNUM   |                                            | RAX = disk image index   |

use {
    crate::{
        allocator::PhysicalMemory,
        error::HypervisorError,
        global_const::*,
        host::{EnvType, HostContext, HostKernel},
        intel::{
            multiboot::SyntheticMemoryMap,
            vm::Vm,
            vmcs::instruction_length,
            vmexit::{ept_violation::map_fresh_frame, ExitType, GuestErrorCode},
        },
    },
    log::*,
};

/// Handles a VMCALL VM exit by executing the hypercall selected by guest RAX.
///
/// # Returns
///
/// * `Ok(ExitType::IncrementRIP)`: the call completed, results are in the guest registers.
/// * `Ok(ExitType::GuestError(_))`: the call was rejected; the code goes to guest RAX.
/// * `Ok(ExitType::Continue)`: IPCRECV, which moved RIP itself before blocking.
/// * `Err(HypervisorError)`: unknown call number or no memory for the map page.
pub fn handle_vmcall(vm: &mut Vm, host: &mut HostContext) -> Result<ExitType, HypervisorError> {
    let vmcall_number = vm.guest_registers.rax;
    trace!("VMCALL {:#x} from env {} at RIP {:#x}", vmcall_number, vm.env_id, vm.guest_registers.rip);

    match vmcall_number {
        VMX_VMCALL_MBMAP => memory_map(vm, host.memory),
        VMX_VMCALL_IPCSEND => ipc_send(vm, &mut *host.kernel),
        VMX_VMCALL_IPCRECV => ipc_recv(vm, &mut *host.kernel),
        VMX_VMCALL_LAPICEOI => {
            host.kernel.lapic_eoi();
            Ok(ExitType::IncrementRIP)
        }
        VMX_VMCALL_BACKTOHOST => {
            info!("Env {} handed control back to the host; the VM is halted in the background", vm.env_id);
            host.kernel.suspend_env(vm.env_id);
            host.kernel.spawn_shell();
            Ok(ExitType::IncrementRIP)
        }
        VMX_VMCALL_GETDISKIMGNUM => {
            vm.guest_registers.rax = vm.disk_image_number as u64;
            Ok(ExitType::IncrementRIP)
        }
        _ => {
            warn!("Unknown VMCALL {:#x} from env {}", vmcall_number, vm.env_id);
            Err(HypervisorError::UnknownHypercall(vmcall_number))
        }
    }
}

/// Writes a fresh memory map to [`MULTIBOOT_MAP_GPA`] and returns its address in RBX.
fn memory_map(vm: &mut Vm, memory: &dyn PhysicalMemory) -> Result<ExitType, HypervisorError> {
    let kva = match vm.ept.gpa_to_hva(MULTIBOOT_MAP_GPA) {
        Some(kva) => kva,
        None => map_fresh_frame(vm, memory, MULTIBOOT_MAP_GPA)?,
    };

    let map = SyntheticMemoryMap::new(vm.guest_info.phys_sz, MULTIBOOT_MAP_GPA);
    // The whole map fits in the page mapped at `kva`.
    unsafe { map.write_to(kva) };

    debug!("Memory map for env {} written at GPA {:#x}", vm.env_id, MULTIBOOT_MAP_GPA);
    vm.guest_registers.rbx = MULTIBOOT_MAP_GPA;
    Ok(ExitType::IncrementRIP)
}

/// Sends a value and a guest page to the file-system environment.
fn ipc_send(vm: &mut Vm, kernel: &mut dyn HostKernel) -> Result<ExitType, HypervisorError> {
    let regs = &vm.guest_registers;

    if EnvType::from_u64(regs.rbx) != Some(EnvType::Fs) {
        warn!("IPCSEND from env {} to unsupported destination type {:#x}", vm.env_id, regs.rbx);
        return Ok(ExitType::GuestError(GuestErrorCode::Invalid));
    }

    let Some(destination) = kernel.find_env_by_type(EnvType::Fs) else {
        warn!("IPCSEND from env {}: no file-system environment", vm.env_id);
        return Ok(ExitType::GuestError(GuestErrorCode::Invalid));
    };

    let Some(page_kva) = vm.ept.gpa_to_hva(regs.rdx) else {
        warn!("IPCSEND from env {}: GPA {:#x} is not mapped", vm.env_id, regs.rdx);
        return Ok(ExitType::GuestError(GuestErrorCode::Invalid));
    };

    let result = kernel.ipc_try_send(destination, regs.rcx as u32, page_kva, regs.rsi as u32);
    trace!("IPCSEND env {} -> env {}: {}", vm.env_id, destination, result);

    vm.guest_registers.rax = result as i64 as u64;
    Ok(ExitType::IncrementRIP)
}

/// Receives a message into the guest page at RBX.
///
/// The host may schedule another environment while this guest waits, which
/// makes the current VMCS unreadable afterwards. RIP is therefore advanced
/// before the receive.
fn ipc_recv(vm: &mut Vm, kernel: &mut dyn HostKernel) -> Result<ExitType, HypervisorError> {
    let len = instruction_length(&*vm.vmcs)?;
    vm.guest_registers.rip = vm.guest_registers.rip.wrapping_add(len);

    match kernel.ipc_recv(vm.env_id, vm.guest_registers.rbx) {
        Ok(message) => {
            trace!("IPCRECV env {} <- env {}: value {:#x}", vm.env_id, message.from, message.value);
            vm.guest_registers.rax = 0;
            vm.guest_registers.rsi = message.value as u64;
        }
        Err(code) => {
            debug!("IPCRECV for env {} failed: {}", vm.env_id, code);
            vm.guest_registers.rax = code as i64 as u64;
        }
    }

    Ok(ExitType::Continue)
}
