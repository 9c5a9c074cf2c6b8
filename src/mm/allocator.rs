//! Kernel heap: a talc arena inside a kernel-space allocation.

use memory_addresses::VirtAddr;
use talc::{ErrOnOom, Span, Talc, Talck};

use hermit_sync::RawInterruptTicketMutex;

#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: Talck<RawInterruptTicketMutex, ErrOnOom> = Talc::new(ErrOnOom).lock();

/// Hand the initial arena to the allocator.
pub fn init(heap_start: VirtAddr, size: usize) {
	unsafe {
		ALLOCATOR
			.lock()
			.claim(Span::from_base_size(heap_start.as_mut_ptr(), size))
			.expect("cannot claim the kernel heap arena");
	}
	info!(
		"Kernel heap spans {:p}..{:p}",
		heap_start,
		VirtAddr::new(heap_start.as_u64() + size as u64)
	);
}
