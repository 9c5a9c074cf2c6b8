pub mod allocator;
pub mod extent;
pub mod physicalmem;
pub mod virtualmem;

use memory_addresses::{PhysAddr, VirtAddr};

use crate::arch::mm::paging::{MemAttr, PAGE_SIZE};
use crate::mm::virtualmem::{VmError, VmFlags};

/// Bring up the whole memory subsystem on the boot processor.
///
/// The three managers bootstrap each other in a fixed order: the frame
/// manager first runs against the boot page tables through the remap
/// window, then the kernel's own paging tree and address space come up,
/// and finally the frame manager maps its tracking data permanently and
/// swaps to its steady-state routines.
#[cfg(target_os = "none")]
pub fn init() {
	crate::arch::mm::paging::early_init();
	physicalmem::early_init();
	crate::arch::mm::paging::init();
	virtualmem::init();
	physicalmem::init();

	let heap_size = crate::config::HEAP_INITIAL_SIZE;
	let heap_start = virtualmem::kernel_context()
		.alloc(
			None,
			heap_size as u64,
			VmFlags::HIGH_MEM | VmFlags::PERMANENT,
			MemAttr::WRITABLE,
		)
		.expect("cannot allocate the kernel heap");
	allocator::init(heap_start, heap_size);

	crate::arch::mm::paging::install_invalidation_handler();
}

/// Page-granular kernel allocation, writable, optionally non-executable.
pub fn allocate(size: usize, execute_disable: bool) -> Result<VirtAddr, VmError> {
	let mut prot = MemAttr::WRITABLE;
	if !execute_disable {
		prot |= MemAttr::EXECUTABLE;
	}

	virtualmem::kernel_context().alloc(
		None,
		size.next_multiple_of(PAGE_SIZE) as u64,
		VmFlags::HIGH_MEM,
		prot,
	)
}

pub fn deallocate(addr: VirtAddr, size: usize) -> Result<(), VmError> {
	virtualmem::kernel_context().free(addr, size.next_multiple_of(PAGE_SIZE) as u64)
}

/// Map one device page (uncached) and return its virtual address.
pub fn map_device_page(phys: PhysAddr) -> Result<VirtAddr, VmError> {
	virtualmem::kernel_context().map(
		None,
		PAGE_SIZE as u64,
		phys,
		VmFlags::HIGH_MEM | VmFlags::PERMANENT,
		MemAttr::WRITABLE | MemAttr::STRONG_UNCACHED,
	)
}

pub fn print_information() {
	physicalmem::print_free_memory();
	#[cfg(target_os = "none")]
	physicalmem::print_reserved_memory();
	virtualmem::kernel_context().print_information();
}
