//! External-interrupt and interrupt-window VM-exit handlers.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{deliver_or_defer, Delivery},
            vm::Vm,
            vmcs::update_primary_controls,
            vmerror::VmExitInterruptionInformation,
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs::{self, control::PrimaryControls},
};

/// Handles an external-interrupt exit by forwarding the vector to the guest.
pub fn handle_external_interrupt(vm: &mut Vm) -> Result<ExitType, HypervisorError> {
    let info = VmExitInterruptionInformation(vm.vmcs.read(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32);
    trace!("External interrupt exit: {:?}", info);

    if info.valid() {
        queue_interrupt(vm, info.vector() as u8);
    }

    Ok(ExitType::Continue)
}

/// Handles an interrupt-window exit: the guest just re-enabled interrupts.
pub fn handle_interrupt_window(vm: &mut Vm) -> Result<ExitType, HypervisorError> {
    match vm.pending_interrupt {
        Some(vector) => queue_interrupt(vm, vector),
        None => {
            // Nothing left to deliver, stop exiting on every open window.
            debug!("Interrupt window opened with nothing pending");
            update_primary_controls(&mut *vm.vmcs, PrimaryControls::INTERRUPT_WINDOW_EXITING, false);
        }
    }

    Ok(ExitType::Continue)
}

/// Makes `vector` pending for the guest and delivers it as soon as the guest allows.
pub fn queue_interrupt(vm: &mut Vm, vector: u8) {
    if let Some(previous) = vm.pending_interrupt.replace(vector) {
        if previous != vector {
            warn!("Interrupt vector {:#x} dropped in favour of {:#x}", previous, vector);
        }
    }

    if deliver_or_defer(&mut *vm.vmcs, vector) == Delivery::Injected {
        vm.pending_interrupt = None;
    }
}
