//! I/O instruction VM-exit handler.
//!
//! Only the CMOS/RTC pair is emulated, enough for a guest to read its base and
//! extended memory sizes. Everything else is left unhandled.

use {
    crate::{
        error::HypervisorError,
        global_const::{IO_RTC, IO_RTC_DATA},
        intel::{vm::Vm, vmerror::IoExitQualification, vmexit::ExitType},
    },
    log::*,
    x86::vmx::vmcs,
};

/// Handles an I/O instruction exit using the exit qualification to find port and direction.
pub fn handle_io_instruction(vm: &mut Vm) -> Result<ExitType, HypervisorError> {
    let qualification = IoExitQualification(vm.vmcs.read(vmcs::ro::EXIT_QUALIFICATION));
    let port = qualification.port() as u16;

    trace!("I/O exit: {:?}", qualification);

    let handled = !qualification.is_string()
        && match (port, qualification.is_in()) {
            (IO_RTC, false) => {
                vm.rtc.select(vm.guest_registers.rax as u8);
                true
            }
            (IO_RTC_DATA, true) => match vm.rtc.read_data(vm.guest_info.phys_sz) {
                Some(byte) => {
                    vm.guest_registers.set_al(byte);
                    true
                }
                None => false,
            },
            _ => false,
        };

    if handled {
        Ok(ExitType::IncrementRIP)
    } else {
        let latch = vm.rtc.latched().unwrap_or(0);
        warn!("Unhandled I/O: qualification {:#x}, CMOS index {:#x}", qualification.0, latch);
        Err(HypervisorError::UnhandledIoPort {
            port,
            direction: qualification.direction(),
            latch,
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            global_const::{NVRAM_BASEHI, NVRAM_BASELO, NVRAM_EXTHI, NVRAM_EXTLO},
            testing::test_vm,
        },
    };

    const IN: u64 = 1 << 3;
    const STRING: u64 = 1 << 4;

    fn io_exit(vm: &mut Vm, port: u16, flags: u64, rax: u64) -> Result<ExitType, HypervisorError> {
        vm.vmcs.write(vmcs::ro::EXIT_QUALIFICATION, ((port as u64) << 16) | flags);
        vm.guest_registers.rax = rax;
        handle_io_instruction(vm)
    }

    fn read_cmos(vm: &mut Vm, index: u8) -> Result<u8, HypervisorError> {
        assert_eq!(io_exit(vm, IO_RTC, 0, index as u64)?, ExitType::IncrementRIP);
        assert_eq!(io_exit(vm, IO_RTC_DATA, IN, 0xFFFF_FF00)?, ExitType::IncrementRIP);
        assert_eq!(vm.guest_registers.rax & !0xFF, 0xFFFF_FF00);
        Ok(vm.guest_registers.rax as u8)
    }

    #[test]
    fn base_memory_bytes_spell_640() {
        let mut vm = test_vm(32 << 20);
        let lo = read_cmos(&mut vm, NVRAM_BASELO).unwrap();
        let hi = read_cmos(&mut vm, NVRAM_BASEHI).unwrap();
        assert_eq!(u16::from_le_bytes([lo, hi]), 640);
    }

    #[test]
    fn extended_memory_bytes_spell_size_above_one_meg() {
        let mut vm = test_vm(32 << 20);
        let lo = read_cmos(&mut vm, NVRAM_EXTLO).unwrap();
        let hi = read_cmos(&mut vm, NVRAM_EXTHI).unwrap();
        assert_eq!(u16::from_le_bytes([lo, hi]) as u64, (32 << 10) - 1024);
    }

    #[test]
    fn index_write_is_always_handled() {
        let mut vm = test_vm(32 << 20);
        assert_eq!(io_exit(&mut vm, IO_RTC, 0, 0x7F).unwrap(), ExitType::IncrementRIP);
        assert_eq!(vm.rtc.latched(), Some(0x7F));
    }

    #[test]
    fn data_read_of_unmodeled_register_is_unhandled() {
        let mut vm = test_vm(32 << 20);
        io_exit(&mut vm, IO_RTC, 0, 0x0A).unwrap();

        let err = io_exit(&mut vm, IO_RTC_DATA, IN, 0).unwrap_err();
        assert_eq!(err, HypervisorError::UnhandledIoPort { port: IO_RTC_DATA, direction: "IN", latch: 0x0A });
    }

    #[test]
    fn data_read_without_prior_index_is_unhandled() {
        let mut vm = test_vm(32 << 20);
        assert!(io_exit(&mut vm, IO_RTC_DATA, IN, 0).is_err());
    }

    #[test]
    fn other_ports_directions_and_string_io_are_unhandled() {
        let mut vm = test_vm(32 << 20);
        assert!(io_exit(&mut vm, IO_RTC, IN, 0).is_err());
        assert!(io_exit(&mut vm, IO_RTC_DATA, 0, 0).is_err());
        assert!(io_exit(&mut vm, 0x3F8, 0, b'A' as u64).is_err());
        assert!(io_exit(&mut vm, IO_RTC, STRING, NVRAM_BASELO as u64).is_err());
    }

    #[test]
    fn latch_is_per_guest() {
        let mut first = test_vm(32 << 20);
        let mut second = test_vm(32 << 20);

        io_exit(&mut first, IO_RTC, 0, NVRAM_BASELO as u64).unwrap();
        io_exit(&mut second, IO_RTC, 0, 0x0A).unwrap();

        assert_eq!(io_exit(&mut first, IO_RTC_DATA, IN, 0).unwrap(), ExitType::IncrementRIP);
        assert_eq!(first.guest_registers.rax, 640 & 0xFF);
    }
}
