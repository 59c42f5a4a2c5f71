//! Intel VMX specific pieces: control-structure access, EPT bridge, event
//! injection and the per-reason VM-exit handlers.

pub mod capture;
pub mod ept;
pub mod events;
pub mod msr_store;
pub mod multiboot;
pub mod rtc;
pub mod vm;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
