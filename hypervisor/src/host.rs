//! Host kernel services the exit handlers call into.
//!
//! The scheduler, the environment table and the IPC primitives belong to the
//! host kernel. The hypercall service only needs the narrow surface below.

use x86::cpuid::CpuIdResult;

/// Identifier of a host environment (process or guest).
pub type EnvId = i32;

/// Kind of a host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvType {
    User = 0,
    Fs = 1,
    Guest = 2,
}

impl EnvType {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(EnvType::User),
            1 => Some(EnvType::Fs),
            2 => Some(EnvType::Guest),
            _ => None,
        }
    }
}

/// A message delivered by the host IPC primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMessage {
    pub from: EnvId,
    pub value: u32,
    pub perm: u32,
}

/// Host kernel operations used by the hypercall service.
pub trait HostKernel {
    /// Finds the first live environment of the given type.
    ///
    /// Whether this lookup is consistent with concurrent environment creation
    /// is up to the implementation.
    fn find_env_by_type(&self, env_type: EnvType) -> Option<EnvId>;

    /// Non-blocking IPC send of `value` and the page at host address `page_kva`.
    /// Returns the host result code (0 or a negative error).
    fn ipc_try_send(&mut self, to: EnvId, value: u32, page_kva: u64, perm: u32) -> i32;

    /// Blocking IPC receive on behalf of `guest` into guest physical `dst_gpa`.
    ///
    /// May reschedule; every VMCS value read before this call is stale afterwards.
    fn ipc_recv(&mut self, guest: EnvId, dst_gpa: u64) -> Result<IpcMessage, i32>;

    /// Signals end-of-interrupt to the local APIC.
    fn lapic_eoi(&mut self);

    /// Marks `guest` not runnable.
    fn suspend_env(&mut self, guest: EnvId);

    /// Starts a new interactive host shell.
    fn spawn_shell(&mut self);
}

/// Executes CPUID on the host processor.
pub trait CpuidSource {
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult;
}

/// The real CPUID instruction.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCpuid;

impl CpuidSource for HostCpuid {
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        x86::cpuid::cpuid!(leaf, sub_leaf)
    }
}

/// Process-wide collaborators handed to the exit handlers that need them.
pub struct HostContext<'a> {
    pub memory: &'a dyn crate::allocator::PhysicalMemory,
    pub kernel: &'a mut dyn HostKernel,
    pub cpuid: &'a dyn CpuidSource,
}
