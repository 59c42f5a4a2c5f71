//! Virtual interrupt injection.
//!
//! A pending interrupt can only be delivered while the guest has RFLAGS.IF set.
//! Otherwise interrupt-window exiting is armed so the host regains control the
//! moment the guest re-enables interrupts, and delivery happens from that exit.

use {
    crate::intel::{
        vmcs::{primary_controls_contain, update_primary_controls, VmcsAccess},
        vmerror::InterruptionType,
    },
    bitfield::bitfield,
    log::trace,
    x86::vmx::vmcs::{self, control::PrimaryControls},
    x86_64::registers::rflags::RFlags,
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11, 11;

    /// Valid
    pub get_valid, set_valid: 31, 31;
}

const VALID: u32 = 1;

impl EventInjection {
    /// Interruption information for an external interrupt on `vector`.
    pub fn external_interrupt(vector: u8) -> Self {
        let mut event = EventInjection(0);

        event.set_vector(vector as u32);
        event.set_type(InterruptionType::ExternalInterrupt as u32);
        event.set_valid(VALID);

        event
    }
}

/// Outcome of [`deliver_or_defer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The vector is queued for the next VM entry.
    Injected,
    /// The guest has interrupts masked; interrupt-window exiting is armed.
    Deferred,
}

/// Arms interrupt-window exiting.
pub fn request_interrupt_window(vmcs: &mut dyn VmcsAccess) {
    trace!("Arming interrupt-window exiting");
    update_primary_controls(vmcs, PrimaryControls::INTERRUPT_WINDOW_EXITING, true);
}

/// Returns whether the guest currently accepts maskable interrupts.
pub fn guest_interrupts_enabled(vmcs: &dyn VmcsAccess) -> bool {
    RFlags::from_bits_truncate(vmcs.read(vmcs::guest::RFLAGS)).contains(RFlags::INTERRUPT_FLAG)
}

/// Injects `vector` on the next VM entry if the guest can take it, otherwise
/// arms the interrupt window and leaves the vector for the caller to retry.
pub fn deliver_or_defer(vmcs: &mut dyn VmcsAccess, vector: u8) -> Delivery {
    if !guest_interrupts_enabled(vmcs) {
        request_interrupt_window(vmcs);
        return Delivery::Deferred;
    }

    let event = EventInjection::external_interrupt(vector);
    trace!("Injecting external interrupt vector={:#x}: info={:#x}", vector, event.0);
    vmcs.write(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64);

    if primary_controls_contain(vmcs, PrimaryControls::INTERRUPT_WINDOW_EXITING) {
        update_primary_controls(vmcs, PrimaryControls::INTERRUPT_WINDOW_EXITING, false);
    }

    Delivery::Injected
}
