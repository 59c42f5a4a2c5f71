//! Guest platform layout and ABI constants.

use x86::bits64::paging::BASE_PAGE_SIZE;

/// Size of a guest page and of a host physical frame.
pub const PAGE_SIZE: usize = BASE_PAGE_SIZE;

/// End of conventional ("low") memory: 640 KiB.
pub const CONVENTIONAL_MEMORY_END: u64 = 0xA0000;

/// Start of extended memory: 1 MiB. Everything between 640 KiB and here is the I/O hole.
pub const EXTENDED_MEMORY_START: u64 = 0x10_0000;

/// Legacy CGA/VGA text framebuffer.
pub const VGA_TEXT_BUFFER: u64 = 0xB8000;

/// Size of the pass-through VGA window.
pub const VGA_TEXT_BUFFER_SIZE: u64 = PAGE_SIZE as u64;

/// Guest physical address the synthetic multiboot memory map is written to.
pub const MULTIBOOT_MAP_GPA: u64 = 0x6000;

/// Base memory reported through CMOS, in KiB.
pub const BASE_MEMORY_KB: u64 = 640;

/// Upper bound on the number of virtual MSRs a guest may carry.
pub const MAX_MSR_ENTRIES: usize = 16;

/// CMOS/RTC index port.
pub const IO_RTC: u16 = 0x70;

/// CMOS/RTC data port.
pub const IO_RTC_DATA: u16 = IO_RTC + 1;

/// CMOS register: base memory size in KiB, low byte.
pub const NVRAM_BASELO: u8 = 0x0F;
/// CMOS register: base memory size in KiB, high byte.
pub const NVRAM_BASEHI: u8 = 0x10;
/// CMOS register: extended memory size in KiB, low byte.
pub const NVRAM_EXTLO: u8 = 0x30;
/// CMOS register: extended memory size in KiB, high byte.
pub const NVRAM_EXTHI: u8 = 0x31;

/// VMCALL numbers understood by the hypercall service (guest RAX).
pub const VMX_VMCALL_MBMAP: u64 = 0x1;
pub const VMX_VMCALL_IPCSEND: u64 = 0x2;
pub const VMX_VMCALL_IPCRECV: u64 = 0x3;
pub const VMX_VMCALL_LAPICEOI: u64 = 0x4;
pub const VMX_VMCALL_BACKTOHOST: u64 = 0x5;
pub const VMX_VMCALL_GETDISKIMGNUM: u64 = 0x6;
