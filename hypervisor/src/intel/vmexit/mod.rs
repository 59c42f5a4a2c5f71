//! VM-exit handlers, one module per exit class.

pub mod cpuid;
pub mod diagnostics;
pub mod ept_violation;
pub mod interrupt;
pub mod io;
pub mod msr;
pub mod vmcall;

/// Error codes returned to the guest in RAX, using the host kernel's numbering.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestErrorCode {
    /// Bad environment (`-E_BAD_ENV`).
    BadEnvironment = -2,
    /// Invalid parameter (`-E_INVAL`).
    Invalid = -3,
    /// Out of memory (`-E_NO_MEM`).
    NoMemory = -4,
}

/// What the dispatcher does after a handler returns successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Handled; skip the exiting instruction.
    IncrementRIP,
    /// Handled; resume at the current RIP (retry the access, or RIP already moved).
    Continue,
    /// Handled, but the request failed: the code goes to guest RAX and RIP is advanced.
    GuestError(GuestErrorCode),
}
