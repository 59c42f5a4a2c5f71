//! Guest register snapshot exchanged with the VM entry/exit trampoline.

/// Register layout saved by the exit trampoline and restored on the next entry.
///
/// Handlers read hypercall arguments from here and write results (and the
/// advanced RIP) back in place; the trampoline copies RIP into the VMCS before
/// resuming the guest.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 18 * 8);

impl GuestRegisters {
    /// EDX:EAX as one 64-bit value, as consumed by WRMSR.
    pub fn edx_eax(&self) -> u64 {
        (self.rdx << 32) | (self.rax & 0xFFFF_FFFF)
    }

    /// Splits `value` into EDX:EAX, as produced by RDMSR. The upper halves are cleared.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value & 0xFFFF_FFFF;
        self.rdx = value >> 32;
    }

    /// Replaces AL, leaving the rest of RAX intact.
    pub fn set_al(&mut self, value: u8) {
        self.rax = (self.rax & !0xFF) | value as u64;
    }
}
