//! Guest-physical address space: the bridge to the EPT primitives and the
//! policy deciding how each guest-physical page gets backed.
//!
//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use {
    crate::{
        error::HypervisorError,
        global_const::{CONVENTIONAL_MEMORY_END, EXTENDED_MEMORY_START},
    },
    core::ops::Range,
};

bitflags::bitflags! {
    /// Permissions of an EPT leaf entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Operations on one guest's EPT hierarchy.
///
/// Implemented by the EPT code of the host kernel; an instance is owned by a
/// single guest and only touched from that guest's exit path.
pub trait EptBridge {
    /// Maps the host page at kernel virtual address `hva` at guest physical `gpa`.
    ///
    /// Both addresses are page-aligned. Fails if `gpa` is already mapped and
    /// `overwrite` is false, or if an intermediate table cannot be allocated.
    fn map_hva_to_gpa(&mut self, hva: u64, gpa: u64, access: AccessType, overwrite: bool) -> Result<(), HypervisorError>;

    /// Returns the host kernel virtual address backing `gpa` (page offset included),
    /// or `None` if nothing is mapped there.
    fn gpa_to_hva(&self, gpa: u64) -> Option<u64>;
}

/// How a faulting guest-physical page is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingPolicy {
    /// Guest RAM: back with a fresh host frame on first touch.
    DemandAllocate,
    /// Hardware MMIO: map the host physical page at the same address.
    Passthrough { host_pa: u64 },
}

/// A guest-physical window handed straight through to the hardware behind it.
#[derive(Debug, Clone)]
pub struct MmioWindow {
    pub name: &'static str,
    pub range: Range<u64>,
}

/// Hardware windows passed through to every guest, consulted before guest RAM.
#[cfg(feature = "vga-passthrough")]
pub const MMIO_PASSTHROUGH_WINDOWS: &[MmioWindow] = &[MmioWindow {
    name: "vga-text",
    range: crate::global_const::VGA_TEXT_BUFFER..crate::global_const::VGA_TEXT_BUFFER + crate::global_const::VGA_TEXT_BUFFER_SIZE,
}];

#[cfg(not(feature = "vga-passthrough"))]
pub const MMIO_PASSTHROUGH_WINDOWS: &[MmioWindow] = &[];

/// Returns `true` if `gpa` is guest RAM for a guest of `phys_size` bytes.
pub fn is_guest_ram(gpa: u64, phys_size: u64) -> bool {
    gpa < CONVENTIONAL_MEMORY_END || (EXTENDED_MEMORY_START..phys_size).contains(&gpa)
}

/// Picks the backing for the page containing `gpa`, or `None` if the address is
/// neither guest RAM nor a pass-through window.
pub fn mapping_policy(gpa: u64, phys_size: u64) -> Option<MappingPolicy> {
    let page = align_down(gpa);

    if let Some(window) = MMIO_PASSTHROUGH_WINDOWS.iter().find(|w| w.range.contains(&gpa)) {
        log::trace!("GPA {:#x} falls in pass-through window {}", gpa, window.name);
        return Some(MappingPolicy::Passthrough { host_pa: page });
    }

    is_guest_ram(gpa, phys_size).then_some(MappingPolicy::DemandAllocate)
}

/// Rounds `addr` down to its page boundary.
pub fn align_down(addr: u64) -> u64 {
    addr & !(crate::global_const::PAGE_SIZE as u64 - 1)
}
