//! Decoding of VM-exit information fields.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Appendix C VMX Basic Exit Reasons

use bitfield::bitfield;

/// Basic exit reasons the dispatcher distinguishes.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdtsc = 16,
    Vmcall = 18,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    MonitorTrapFlag = 37,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Xsetbv = 55,
}

impl VmxBasicExitReason {
    /// Decodes the low 16 bits of the VMCS exit-reason field.
    pub fn from_u32(exit_reason: u32) -> Option<Self> {
        use VmxBasicExitReason::*;

        Some(match exit_reason & 0xFFFF {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => InitSignal,
            4 => StartupIpi,
            7 => InterruptWindow,
            8 => NmiWindow,
            9 => TaskSwitch,
            10 => Cpuid,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            16 => Rdtsc,
            18 => Vmcall,
            28 => ControlRegisterAccesses,
            29 => MovDr,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            33 => VmEntryFailureInvalidGuestState,
            34 => VmEntryFailureMsrLoading,
            37 => MonitorTrapFlag,
            48 => EptViolation,
            49 => EptMisconfiguration,
            55 => Xsetbv,
            _ => return None,
        })
    }
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
    pub struct IoExitQualification(u64);

    impl Debug;

    /// Size of access minus one (0 = 1 byte, 1 = 2 bytes, 3 = 4 bytes)
    pub size, _: 2, 0;

    /// Direction of the attempted access (0 = OUT, 1 = IN)
    pub is_in, _: 3;

    /// String instruction (INS/OUTS)
    pub is_string, _: 4;

    /// REP prefixed
    pub is_rep, _: 5;

    /// Operand encoding (0 = DX, 1 = immediate)
    pub is_immediate, _: 6;

    /// Port number
    pub port, _: 31, 16;
}

impl IoExitQualification {
    pub fn direction(&self) -> &'static str {
        if self.is_in() {
            "IN"
        } else {
            "OUT"
        }
    }
}

bitfield! {
    /// VM-exit interruption-information field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-19. Format of the VM-Exit Interruption-Information Field
    pub struct VmExitInterruptionInformation(u32);

    impl Debug;

    pub vector, _: 7, 0;
    pub interruption_type, _: 10, 8;
    pub error_code_valid, _: 11;
    pub valid, _: 31;
}

/// Interruption types used in the interruption-information fields.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}
