//! Error types shared by every VM-exit handler.

use thiserror::Error;

/// Reasons a VM exit could not be handled.
///
/// Any `Err` returned by a handler means "not handled": the dispatcher reports
/// it and the guest is torn down by the caller. Failures that the guest should
/// see instead are carried by [`crate::intel::vmexit::ExitType::GuestError`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("unhandled VM exit")]
    UnhandledVmExit,

    #[error("unknown VM exit reason {0}")]
    UnknownVmExitReason(u32),

    #[error("MSR {0:#x} is not virtualized")]
    UnhandledMsr(u32),

    /// The guest configuration promised this MSR but the store does not hold it.
    #[error("internal invariant broken: virtual MSR {0:#x} missing from the guest MSR area")]
    VirtualMsrMissing(u32),

    #[error("virtual MSR store is full")]
    MsrStoreFull,

    #[error("duplicate virtual MSR entry {0:#x}")]
    DuplicateMsrEntry(u32),

    #[error("unhandled I/O {direction} on port {port:#x} (CMOS index {latch:#x})")]
    UnhandledIoPort { port: u16, direction: &'static str, latch: u8 },

    #[error("unknown hypercall {0:#x}")]
    UnknownHypercall(u64),

    #[error("guest physical address {0:#x} is outside guest memory")]
    GuestMemoryOutOfRange(u64),

    #[error("out of physical memory")]
    OutOfMemory,

    #[error("failed to map guest physical address {0:#x} in the EPT")]
    EptMappingFailed(u64),

    #[error("invalid guest configuration")]
    InvalidGuestConfig,

    #[error("invalid VM-exit instruction length {0}")]
    InvalidInstructionLength(u64),
}

impl HypervisorError {
    /// Returns `true` when the error reports a broken internal invariant rather
    /// than a guest request that is simply not emulated.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, HypervisorError::VirtualMsrMissing(_))
    }
}
