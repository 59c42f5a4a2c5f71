//! Guest creation and VM-exit dispatch.
//!
//! [`GuestRegistry`] hands every new guest its disk image index. [`handle_vmexit`]
//! is called by the exit trampoline with the guest's register snapshot already
//! saved in [`Vm::guest_registers`]; it routes the exit to its handler and applies
//! the outcome before the guest is resumed.

use {
    crate::{
        error::HypervisorError,
        host::HostContext,
        intel::{
            ept::EptBridge,
            vm::{GuestConfig, Vm, VmxGuestInfo},
            vmcs::{instruction_length, VmcsAccess},
            vmerror::VmxBasicExitReason,
            vmexit::{
                cpuid::handle_cpuid,
                ept_violation::handle_ept_violation,
                interrupt::{handle_external_interrupt, handle_interrupt_window},
                io::handle_io_instruction,
                msr::{handle_msr_access, MsrAccessType},
                vmcall::handle_vmcall,
                ExitType,
            },
        },
    },
    alloc::boxed::Box,
    core::sync::atomic::{AtomicU32, Ordering},
    log::*,
    x86::vmx::vmcs::{guest, ro},
};

/// Process-wide guest bookkeeping.
#[derive(Debug, Default)]
pub struct GuestRegistry {
    disk_image_counter: AtomicU32,
}

impl GuestRegistry {
    pub const fn new() -> Self {
        Self {
            disk_image_counter: AtomicU32::new(0),
        }
    }

    /// Validates `config` and creates the guest's exit-handling state.
    ///
    /// Every successful registration takes the next disk image index; the first
    /// guest gets 1. A rejected configuration does not consume an index.
    pub fn register_guest(
        &self,
        config: &GuestConfig,
        vmcs: Box<dyn VmcsAccess + Send>,
        ept: Box<dyn EptBridge + Send>,
    ) -> Result<Vm, HypervisorError> {
        let guest_info = VmxGuestInfo::from_config(config).inspect_err(|e| warn!("Rejecting guest env {}: {}", config.env_id, e))?;

        let disk_image_number = self.disk_image_counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Registered guest env {} with {} KiB of memory, disk image {}",
            config.env_id,
            config.phys_size / 1024,
            disk_image_number
        );

        Ok(Vm::new(config.env_id, guest_info, vmcs, ept, disk_image_number))
    }

    /// Number of guests registered so far.
    pub fn guest_count(&self) -> u32 {
        self.disk_image_counter.load(Ordering::SeqCst)
    }
}

/// Handles one VM exit of `vm`.
///
/// `Ok(())` means the guest may be resumed. An error means the exit could not
/// be handled and the caller must terminate the guest.
pub fn handle_vmexit(vm: &mut Vm, host: &mut HostContext) -> Result<(), HypervisorError> {
    let exit_reason = vm.vmcs.read(ro::EXIT_REASON) as u32;
    vm.exit_history.record(exit_reason, vm.guest_registers.rip);

    let result = match VmxBasicExitReason::from_u32(exit_reason) {
        Some(basic_exit_reason) => dispatch(vm, host, basic_exit_reason),
        None => Err(HypervisorError::UnknownVmExitReason(exit_reason)),
    };

    let applied = result.and_then(|exit_type| match exit_type {
        ExitType::IncrementRIP => advance_guest_rip(vm),
        ExitType::Continue => Ok(()),
        ExitType::GuestError(code) => {
            trace!("Returning {:?} to env {}", code, vm.env_id);
            vm.guest_registers.rax = code as i32 as i64 as u64;
            advance_guest_rip(vm)
        }
    });

    if let Err(e) = applied {
        report_unhandled(vm, exit_reason, &e);
    }

    applied
}

fn dispatch(vm: &mut Vm, host: &mut HostContext, basic_exit_reason: VmxBasicExitReason) -> Result<ExitType, HypervisorError> {
    trace!("VM exit {:?} from env {} at RIP {:#x}", basic_exit_reason, vm.env_id, vm.guest_registers.rip);

    match basic_exit_reason {
        VmxBasicExitReason::ExternalInterrupt => handle_external_interrupt(vm),
        VmxBasicExitReason::InterruptWindow => handle_interrupt_window(vm),
        VmxBasicExitReason::Cpuid => handle_cpuid(vm, host.cpuid),
        VmxBasicExitReason::Vmcall => handle_vmcall(vm, host),
        VmxBasicExitReason::IoInstruction => handle_io_instruction(vm),
        VmxBasicExitReason::Rdmsr => handle_msr_access(vm, MsrAccessType::Read),
        VmxBasicExitReason::Wrmsr => handle_msr_access(vm, MsrAccessType::Write),
        VmxBasicExitReason::EptViolation => handle_ept_violation(vm, host.memory),
        _ => Err(HypervisorError::UnhandledVmExit),
    }
}

fn report_unhandled(vm: &Vm, exit_reason: u32, e: &HypervisorError) {
    if e.is_invariant_violation() {
        error!("Internal invariant violated while handling exit {} of env {}: {}", exit_reason, vm.env_id, e);
    } else {
        error!("Unhandled VM exit {} of env {}: {}", exit_reason, vm.env_id, e);
    }

    error!("  Exit qualification: {:#x}", vm.vmcs.read(ro::EXIT_QUALIFICATION));
    error!("  Guest RIP: {:#x}", vm.guest_registers.rip);
    error!("  Guest RSP: {:#x}", vm.vmcs.read(guest::RSP));
    vm.exit_history.dump();
}

/// Skips the instruction that caused the current exit.
pub fn advance_guest_rip(vm: &mut Vm) -> Result<(), HypervisorError> {
    let len = instruction_length(&*vm.vmcs)?;
    vm.guest_registers.rip = vm.guest_registers.rip.wrapping_add(len);
    trace!("Advanced RIP by {} to {:#x}", len, vm.guest_registers.rip);
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            global_const::{IO_RTC, IO_RTC_DATA, VMX_VMCALL_IPCRECV, VMX_VMCALL_IPCSEND},
            host::{EnvType, IpcMessage},
            intel::vmexit::GuestErrorCode,
            testing::{FakeEpt, FakeHost, FakeVmcs, ScriptedCpuid, TestMemory},
        },
        alloc::vec::Vec,
        x86::{cpuid::CpuIdResult, msr::IA32_EFER},
    };

    const PHYS_SIZE: u64 = 16 << 20;

    struct Harness {
        memory: TestMemory,
        kernel: FakeHost,
        cpuid: ScriptedCpuid,
        vm: Vm,
    }

    impl Harness {
        fn new() -> Self {
            let registry = GuestRegistry::new();
            let vm = registry
                .register_guest(&GuestConfig::new(5, PHYS_SIZE), Box::new(FakeVmcs::default()), Box::new(FakeEpt::default()))
                .unwrap();

            Self {
                memory: TestMemory::new(4),
                kernel: FakeHost::default(),
                cpuid: ScriptedCpuid::new(CpuIdResult { eax: 1, ebx: 2, ecx: 0xFFFF_FFFF, edx: 4 }),
                vm,
            }
        }

        fn exit(&mut self, reason: VmxBasicExitReason) -> Result<(), HypervisorError> {
            self.vm.vmcs.write(ro::EXIT_REASON, reason as u64);
            let mut host = HostContext {
                memory: self.memory.pool(),
                kernel: &mut self.kernel,
                cpuid: &self.cpuid,
            };
            handle_vmexit(&mut self.vm, &mut host)
        }
    }

    #[test]
    fn handled_exits_advance_rip_by_the_instruction_length() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;
        h.vm.guest_registers.rax = 1;

        h.exit(VmxBasicExitReason::Cpuid).unwrap();
        assert_eq!(h.vm.guest_registers.rip, 0x1003);
        assert_eq!(h.vm.guest_registers.rcx, 0xFFFF_FFDF);

        h.vm.guest_registers.rcx = IA32_EFER as u64;
        h.exit(VmxBasicExitReason::Rdmsr).unwrap();
        assert_eq!(h.vm.guest_registers.rip, 0x1006);
    }

    #[test]
    fn rip_wraps_at_the_top_of_the_address_space() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = u64::MAX - 1;
        h.vm.guest_registers.rax = 1;

        h.exit(VmxBasicExitReason::Cpuid).unwrap();

        assert_eq!(h.vm.guest_registers.rip, 1);
    }

    #[test]
    fn bad_instruction_length_fails_the_exit_instead_of_looping() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;
        h.vm.guest_registers.rax = 1;
        h.vm.vmcs.write(crate::intel::vmcs::VM_EXIT_INSTRUCTION_LEN, 0);

        assert_eq!(h.exit(VmxBasicExitReason::Cpuid), Err(HypervisorError::InvalidInstructionLength(0)));
        assert_eq!(h.vm.guest_registers.rip, 0x1000);
    }

    #[test]
    fn ept_violation_resumes_at_the_same_rip() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;
        h.vm.vmcs.write(ro::GUEST_PHYSICAL_ADDR_FULL, 0x20_0000);

        h.exit(VmxBasicExitReason::EptViolation).unwrap();

        assert_eq!(h.vm.guest_registers.rip, 0x1000);
        assert!(h.vm.ept.gpa_to_hva(0x20_0000).is_some());
    }

    #[test]
    fn guest_errors_land_in_rax_and_skip_the_call() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;
        h.vm.guest_registers.rax = VMX_VMCALL_IPCSEND;
        h.vm.guest_registers.rbx = EnvType::User as u64;

        h.exit(VmxBasicExitReason::Vmcall).unwrap();

        assert_eq!(h.vm.guest_registers.rax as i64, GuestErrorCode::Invalid as i64);
        assert_eq!(h.vm.guest_registers.rip, 0x1003);
        assert!(h.kernel.sends.is_empty());
    }

    #[test]
    fn receive_is_not_advanced_twice() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;
        h.vm.guest_registers.rax = VMX_VMCALL_IPCRECV;
        h.kernel.recv_result = Ok(IpcMessage { from: 1, value: 9, perm: 0 });

        h.exit(VmxBasicExitReason::Vmcall).unwrap();

        assert_eq!(h.vm.guest_registers.rip, 0x1003);
        assert_eq!(h.vm.guest_registers.rsi, 9);
    }

    #[test]
    fn cmos_round_trip_through_the_dispatcher() {
        let mut h = Harness::new();

        h.vm.guest_registers.rax = 0x30;
        h.vm.vmcs.write(ro::EXIT_QUALIFICATION, (IO_RTC as u64) << 16);
        h.exit(VmxBasicExitReason::IoInstruction).unwrap();

        h.vm.guest_registers.rax = 0xAAAA_AAAA;
        h.vm.vmcs.write(ro::EXIT_QUALIFICATION, ((IO_RTC_DATA as u64) << 16) | (1 << 3));
        h.exit(VmxBasicExitReason::IoInstruction).unwrap();

        // (16 MiB / 1 KiB) - 1024 = 15360 = 0x3C00
        assert_eq!(h.vm.guest_registers.rax, 0xAAAA_AA00);
    }

    #[test]
    fn unhandled_exits_are_reported_and_leave_rip_alone() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;

        assert_eq!(h.exit(VmxBasicExitReason::Hlt), Err(HypervisorError::UnhandledVmExit));
        assert_eq!(h.vm.guest_registers.rip, 0x1000);

        h.vm.vmcs.write(ro::EXIT_REASON, 0xFFFF);
        let mut host = HostContext {
            memory: h.memory.pool(),
            kernel: &mut h.kernel,
            cpuid: &h.cpuid,
        };
        assert_eq!(handle_vmexit(&mut h.vm, &mut host), Err(HypervisorError::UnknownVmExitReason(0xFFFF)));
    }

    #[test]
    fn every_exit_is_recorded() {
        let mut h = Harness::new();
        h.vm.guest_registers.rip = 0x1000;

        h.exit(VmxBasicExitReason::Cpuid).unwrap();
        let _ = h.exit(VmxBasicExitReason::Hlt);

        let history: Vec<_> = h.vm.exit_history.entries().collect();
        assert_eq!(history, [(VmxBasicExitReason::Cpuid as u32, 0x1000), (VmxBasicExitReason::Hlt as u32, 0x1003)]);
    }

    #[test]
    fn first_guest_gets_disk_one() {
        let registry = GuestRegistry::new();
        let config = GuestConfig::new(1, PHYS_SIZE);

        let first = registry.register_guest(&config, Box::new(FakeVmcs::default()), Box::new(FakeEpt::default())).unwrap();
        let second = registry.register_guest(&config, Box::new(FakeVmcs::default()), Box::new(FakeEpt::default())).unwrap();

        assert_eq!(first.disk_image_number, 1);
        assert_eq!(second.disk_image_number, 2);
    }

    #[test]
    fn rejected_config_does_not_take_an_index() {
        let registry = GuestRegistry::new();

        let bad = GuestConfig::new(1, 0x1000);
        assert_eq!(
            registry.register_guest(&bad, Box::new(FakeVmcs::default()), Box::new(FakeEpt::default())).err(),
            Some(HypervisorError::InvalidGuestConfig)
        );
        assert_eq!(registry.guest_count(), 0);
    }

    #[test]
    fn concurrent_registration_hands_out_unique_indices() {
        let registry = GuestRegistry::new();
        let config = GuestConfig::new(1, PHYS_SIZE);

        let mut numbers: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..16)
                            .map(|_| {
                                registry
                                    .register_guest(&config, Box::new(FakeVmcs::default()), Box::new(FakeEpt::default()))
                                    .unwrap()
                                    .disk_image_number
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        numbers.sort_unstable();
        assert_eq!(numbers, (1..=128).collect::<Vec<_>>());
        assert_eq!(registry.guest_count(), 128);
    }
}
