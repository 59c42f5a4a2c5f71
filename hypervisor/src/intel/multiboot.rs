//! Synthetic multiboot (e820-style) memory map handed to guests.
//!
//! The guest sees three regions: conventional memory below 640 KiB, the
//! reserved I/O hole up to 1 MiB, and everything from 1 MiB to the configured
//! memory size.

use {
    crate::global_const::{CONVENTIONAL_MEMORY_END, EXTENDED_MEMORY_START},
    core::mem::size_of,
    static_assertions::const_assert_eq,
};

/// `flags` bit announcing that `mmap_length`/`mmap_addr` are valid.
pub const MB_FLAG_MMAP: u32 = 0x40;

/// Region types.
pub const MB_TYPE_USABLE: u32 = 1;
pub const MB_TYPE_RESERVED: u32 = 2;

/// Number of entries in the synthetic map.
pub const MEMORY_MAP_ENTRIES: usize = 3;

/// Multiboot information header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

const_assert_eq!(size_of::<MultibootInfo>(), 52);

/// One memory map region. 64-bit fields are split into low/high halves.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub size: u32,
    pub base_addr_low: u32,
    pub base_addr_high: u32,
    pub length_low: u32,
    pub length_high: u32,
    pub r#type: u32,
}

const_assert_eq!(size_of::<MemoryMapEntry>(), 24);

impl MemoryMapEntry {
    pub fn new(base: u64, length: u64, r#type: u32) -> Self {
        Self {
            size: size_of::<MemoryMapEntry>() as u32,
            base_addr_low: base as u32,
            base_addr_high: (base >> 32) as u32,
            length_low: length as u32,
            length_high: (length >> 32) as u32,
            r#type,
        }
    }

    pub fn base(&self) -> u64 {
        (self.base_addr_high as u64) << 32 | self.base_addr_low as u64
    }

    pub fn length(&self) -> u64 {
        (self.length_high as u64) << 32 | self.length_low as u64
    }
}

/// The header plus its three regions, laid out back to back in guest memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticMemoryMap {
    pub info: MultibootInfo,
    pub entries: [MemoryMapEntry; MEMORY_MAP_ENTRIES],
}

const_assert_eq!(size_of::<SyntheticMemoryMap>(), 52 + 3 * 24);

impl SyntheticMemoryMap {
    /// Builds the map for a guest of `phys_size` bytes placed at guest physical `map_gpa`.
    pub fn new(phys_size: u64, map_gpa: u64) -> Self {
        let info = MultibootInfo {
            flags: MB_FLAG_MMAP,
            mmap_length: (MEMORY_MAP_ENTRIES * size_of::<MemoryMapEntry>()) as u32,
            mmap_addr: (map_gpa + size_of::<MultibootInfo>() as u64) as u32,
            ..Default::default()
        };

        let entries = [
            MemoryMapEntry::new(0, CONVENTIONAL_MEMORY_END, MB_TYPE_USABLE),
            MemoryMapEntry::new(CONVENTIONAL_MEMORY_END, EXTENDED_MEMORY_START - CONVENTIONAL_MEMORY_END, MB_TYPE_RESERVED),
            MemoryMapEntry::new(EXTENDED_MEMORY_START, phys_size.saturating_sub(EXTENDED_MEMORY_START), MB_TYPE_USABLE),
        ];

        Self { info, entries }
    }

    /// Copies the map to host kernel virtual address `kva`.
    ///
    /// # Safety
    ///
    /// `kva` must be valid for writes of `size_of::<SyntheticMemoryMap>()` bytes.
    pub unsafe fn write_to(&self, kva: u64) {
        core::ptr::write_unaligned(kva as *mut SyntheticMemoryMap, *self);
    }

    /// Reads a map back from host kernel virtual address `kva`.
    ///
    /// # Safety
    ///
    /// `kva` must be valid for reads of `size_of::<SyntheticMemoryMap>()` bytes.
    pub unsafe fn read_from(kva: u64) -> Self {
        core::ptr::read_unaligned(kva as *const SyntheticMemoryMap)
    }
}
