//! Per-guest state consulted and updated by the exit handlers.

use {
    crate::{
        error::HypervisorError,
        global_const::{EXTENDED_MEMORY_START, PAGE_SIZE},
        host::EnvId,
        intel::{
            capture::GuestRegisters, ept::EptBridge, msr_store::VirtualMsrStore, rtc::CmosRtc, vmcs::VmcsAccess,
            vmexit::diagnostics::ExitHistory,
        },
    },
    alloc::{boxed::Box, vec::Vec},
    log::trace,
    x86::msr::IA32_EFER,
};

/// Guest configuration fixed at guest creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    /// Host environment id of the guest.
    pub env_id: EnvId,
    /// Guest physical memory size in bytes.
    pub phys_size: u64,
    /// Initial virtual MSRs (index, value).
    pub msr_entries: Vec<(u32, u64)>,
}

impl GuestConfig {
    /// A guest with `phys_size` bytes of memory and EFER cleared.
    pub fn new(env_id: EnvId, phys_size: u64) -> Self {
        Self {
            env_id,
            phys_size,
            msr_entries: alloc::vec![(IA32_EFER, 0)],
        }
    }
}

/// Guest info the handlers read: the virtual MSR area and the memory size.
#[derive(Debug, Clone)]
pub struct VmxGuestInfo {
    pub msr_guest_area: VirtualMsrStore,
    pub phys_sz: u64,
}

impl VmxGuestInfo {
    /// Validates `config` and builds the guest info from it.
    pub fn from_config(config: &GuestConfig) -> Result<Self, HypervisorError> {
        if config.phys_size < EXTENDED_MEMORY_START || config.phys_size % PAGE_SIZE as u64 != 0 {
            return Err(HypervisorError::InvalidGuestConfig);
        }

        let mut msr_guest_area = VirtualMsrStore::new();
        for &(index, value) in &config.msr_entries {
            msr_guest_area.insert(index, value)?;
        }

        // MSR emulation depends on EFER being present.
        if !msr_guest_area.contains(IA32_EFER) {
            return Err(HypervisorError::InvalidGuestConfig);
        }

        Ok(Self {
            msr_guest_area,
            phys_sz: config.phys_size,
        })
    }
}

/// One guest as seen by its exit handlers.
pub struct Vm {
    /// Host environment id of the guest.
    pub env_id: EnvId,

    /// Registers saved by the exit trampoline.
    pub guest_registers: GuestRegisters,

    /// Virtual MSRs and memory size.
    pub guest_info: VmxGuestInfo,

    /// The guest's VMCS.
    pub vmcs: Box<dyn VmcsAccess + Send>,

    /// The guest's EPT.
    pub ept: Box<dyn EptBridge + Send>,

    /// CMOS index latch.
    pub rtc: CmosRtc,

    /// Disk image index assigned at creation.
    pub disk_image_number: u32,

    /// Interrupt vector waiting for the guest to open its interrupt window.
    pub pending_interrupt: Option<u8>,

    /// Recent exits, for post-mortem dumps.
    pub exit_history: ExitHistory,
}

impl Vm {
    pub fn new(
        env_id: EnvId,
        guest_info: VmxGuestInfo,
        vmcs: Box<dyn VmcsAccess + Send>,
        ept: Box<dyn EptBridge + Send>,
        disk_image_number: u32,
    ) -> Self {
        trace!("Creating VM for env {} with {:#x} bytes of memory", env_id, guest_info.phys_sz);

        Self {
            env_id,
            guest_registers: GuestRegisters::default(),
            guest_info,
            vmcs,
            ept,
            rtc: CmosRtc::default(),
            disk_image_number,
            pending_interrupt: None,
            exit_history: ExitHistory::new(),
        }
    }
}
