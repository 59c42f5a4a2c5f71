//! This crate provides the VM-exit handling layer of a VMX hypervisor.
//!
//! Every time a guest performs an operation the CPU cannot complete on its own
//! (an EPT violation, MSR access, port I/O, CPUID or an explicit VMCALL), the
//! dispatcher in [`vmm`] routes the exit to one of the handlers under
//! [`intel::vmexit`]. The hardware control structure, the EPT primitives and the
//! host kernel services are consumed through traits so the same handlers run on
//! real hardware and under the unit tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod allocator;
pub mod error;
pub mod global_const;
pub mod host;
pub mod intel;
pub mod logger;
pub mod vmm;

#[cfg(test)]
pub(crate) mod testing;
