//! Minimal CMOS/RTC device model.
//!
//! Guests probe their memory size the way a BIOS-era kernel does: write a
//! register index to port 0x70, read the byte from port 0x71. Only the four
//! memory-size registers are backed.

use crate::global_const::{BASE_MEMORY_KB, EXTENDED_MEMORY_START, NVRAM_BASEHI, NVRAM_BASELO, NVRAM_EXTHI, NVRAM_EXTLO};

/// Per-guest CMOS state: the register index last written to the index port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmosRtc {
    latch: Option<u8>,
}

impl CmosRtc {
    /// Index port write.
    pub fn select(&mut self, index: u8) {
        self.latch = Some(index);
    }

    /// The register currently selected, if any.
    pub fn latched(&self) -> Option<u8> {
        self.latch
    }

    /// Data port read for a guest with `phys_size` bytes of memory.
    ///
    /// Returns `None` if no register is selected or the selected one is not modeled.
    pub fn read_data(&self, phys_size: u64) -> Option<u8> {
        let extended_kb = (phys_size / 1024).saturating_sub(EXTENDED_MEMORY_START / 1024);

        let byte = match self.latch? {
            NVRAM_BASELO => BASE_MEMORY_KB & 0xFF,
            NVRAM_BASEHI => (BASE_MEMORY_KB >> 8) & 0xFF,
            NVRAM_EXTLO => extended_kb & 0xFF,
            NVRAM_EXTHI => (extended_kb >> 8) & 0xFF,
            _ => return None,
        };

        Some(byte as u8)
    }
}
