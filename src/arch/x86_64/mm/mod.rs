pub mod paging;

use memory_addresses::{PhysAddr, VirtAddr};

/// Symbols placed by the linker script. `BOOT_PAGING` is the page-table
/// hierarchy the boot shim runs on; it identity-maps the low gigabytes
/// and carries the recursive window slot (see `paging`).
#[cfg(target_os = "none")]
unsafe extern "C" {
	static _KERNEL_LMA: u8;
	static _KERNEL_LMA_END: u8;
	static _KERNEL_VMA: u8;
	static _KERNEL_VMA_END: u8;
	static _code: u8;
	static _code_end: u8;
	static _rodata: u8;
	static _rodata_end: u8;
	static _data: u8;
	static _data_end: u8;
	static _bss: u8;
	static _bss_end: u8;
	static BOOT_PAGING: u8;
	static BOOT_PAGING_END: u8;
}

macro_rules! symbol_addr {
	($sym:ident) => {{
		#[cfg(target_os = "none")]
		{
			unsafe { core::ptr::addr_of!($sym) as u64 }
		}
		#[cfg(not(target_os = "none"))]
		{
			0
		}
	}};
}

pub fn kernel_load_addr() -> PhysAddr {
	PhysAddr::new(symbol_addr!(_KERNEL_LMA))
}

pub fn kernel_load_end() -> PhysAddr {
	PhysAddr::new(symbol_addr!(_KERNEL_LMA_END))
}

pub fn kernel_image_len() -> u64 {
	symbol_addr!(_KERNEL_LMA_END) - symbol_addr!(_KERNEL_LMA)
}

pub fn kernel_start_address() -> VirtAddr {
	VirtAddr::new(symbol_addr!(_KERNEL_VMA))
}

pub fn kernel_end_address() -> VirtAddr {
	VirtAddr::new(symbol_addr!(_KERNEL_VMA_END))
}

pub(crate) struct KernelSection {
	pub virt_start: u64,
	pub virt_end: u64,
	pub writable: bool,
	pub executable: bool,
}

/// The kernel image sections in mapping order.
pub(crate) fn kernel_sections() -> [KernelSection; 4] {
	[
		KernelSection {
			virt_start: symbol_addr!(_code),
			virt_end: symbol_addr!(_code_end),
			writable: false,
			executable: true,
		},
		KernelSection {
			virt_start: symbol_addr!(_rodata),
			virt_end: symbol_addr!(_rodata_end),
			writable: false,
			executable: false,
		},
		KernelSection {
			virt_start: symbol_addr!(_data),
			virt_end: symbol_addr!(_data_end),
			writable: true,
			executable: false,
		},
		KernelSection {
			virt_start: symbol_addr!(_bss),
			virt_end: symbol_addr!(_bss_end),
			writable: true,
			executable: false,
		},
	]
}

pub fn boot_paging_range() -> (PhysAddr, PhysAddr) {
	(
		PhysAddr::new(symbol_addr!(BOOT_PAGING)),
		PhysAddr::new(symbol_addr!(BOOT_PAGING_END)),
	)
}

/// Translate a kernel-image virtual address to its load address.
pub fn image_virt_to_phys(virt: VirtAddr) -> PhysAddr {
	let offset = virt.as_u64() - kernel_start_address().as_u64();
	PhysAddr::new(kernel_load_addr().as_u64() + offset)
}
