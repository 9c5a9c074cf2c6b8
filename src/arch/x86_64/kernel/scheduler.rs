//! Architecture-dependent thread setup: stacks and the initial frame.

use core::{mem, ptr};

use memory_addresses::VirtAddr;

use crate::arch::mm::paging::{BasePageSize, MemAttr, PageSize};
use crate::config::{KERNEL_STACK_SIZE, STACK_GUARD_PAGES};
use crate::mm::virtualmem::{self, VmFlags};

/// Register frame consumed by `switch_to_task`. The field order mirrors
/// the push sequence in the switch routine.
#[repr(C, packed)]
struct State {
	r15: u64,
	r14: u64,
	r13: u64,
	r12: u64,
	r11: u64,
	r10: u64,
	r9: u64,
	r8: u64,
	rdi: u64,
	rsi: u64,
	rbp: u64,
	rbx: u64,
	rdx: u64,
	rcx: u64,
	rax: u64,
	rflags: u64,
	rip: u64,
}

pub(crate) enum ThreadStacks {
	/// The boot stack the CPU is already running on; never deallocated.
	Boot { top: VirtAddr },
	/// A stack allocated from the kernel address space, fenced by one
	/// read-only guard page on each side.
	Common { base: VirtAddr, usable: usize },
}

impl ThreadStacks {
	/// Marker written to the top of every stack for overrun diagnostics.
	pub const MARKER: u64 = 0xDEAD_BEEF;
	pub const MARKER_SIZE: usize = 0x10;

	pub fn new(size: usize) -> Result<Self, crate::mm::virtualmem::VmError> {
		let usable = align_up(size.max(KERNEL_STACK_SIZE), BasePageSize::SIZE);
		let guard_bytes = STACK_GUARD_PAGES * BasePageSize::SIZE;
		let total = usable + 2 * guard_bytes;

		let kernel_vas = virtualmem::kernel_context();
		let base = kernel_vas.alloc(
			None,
			total as u64,
			VmFlags::HIGH_MEM | VmFlags::GUARD_PAGES,
			MemAttr::WRITABLE,
		)?;

		// Turn the fence pages read-only so an overrun faults immediately.
		for guard in [base, VirtAddr::new(base.as_u64() + (guard_bytes + usable) as u64)] {
			kernel_vas.change_attr(
				guard,
				guard_bytes as u64,
				MemAttr::empty(),
				MemAttr::WRITABLE,
				None,
			)?;
		}

		debug!("Created stack at {base:p} ({} KiB usable)", usable >> 10);

		unsafe {
			let top = base.as_u64() + (guard_bytes + usable) as u64 - Self::MARKER_SIZE as u64;
			ptr::write(top as *mut u64, Self::MARKER);
		}

		Ok(Self::Common { base, usable })
	}

	pub fn from_boot_stack(top: VirtAddr) -> Self {
		Self::Boot { top }
	}

	/// Highest usable address, below the marker.
	pub fn top(&self) -> VirtAddr {
		match self {
			Self::Boot { top } => *top,
			Self::Common { base, usable } => {
				let guard_bytes = (STACK_GUARD_PAGES * BasePageSize::SIZE) as u64;
				VirtAddr::new(
					base.as_u64() + guard_bytes + *usable as u64 - Self::MARKER_SIZE as u64,
				)
			}
		}
	}

	/// Lowest writable address of the stack.
	pub fn origin(&self) -> VirtAddr {
		match self {
			Self::Boot { top } => VirtAddr::new(top.as_u64() - KERNEL_STACK_SIZE as u64),
			Self::Common { base, .. } => {
				VirtAddr::new(base.as_u64() + (STACK_GUARD_PAGES * BasePageSize::SIZE) as u64)
			}
		}
	}

	pub fn usable_size(&self) -> usize {
		match self {
			Self::Boot { .. } => KERNEL_STACK_SIZE,
			Self::Common { usable, .. } => *usable,
		}
	}
}

impl Drop for ThreadStacks {
	fn drop(&mut self) {
		if let Self::Common { base, usable } = self {
			let guard_bytes = STACK_GUARD_PAGES * BasePageSize::SIZE;
			let total = (*usable + 2 * guard_bytes) as u64;
			debug!("Deallocating stack at {base:p}");
			// Guard pages were only re-protected, the extent is one piece.
			let kernel_vas = virtualmem::kernel_context();
			if let Err(err) = kernel_vas.change_attr(
				*base,
				guard_bytes as u64,
				MemAttr::WRITABLE,
				MemAttr::empty(),
				None,
			) {
				warn!("Cannot unprotect stack guard at {base:p}: {err:?}");
			}
			let upper = VirtAddr::new(base.as_u64() + (guard_bytes + *usable) as u64);
			if let Err(err) = kernel_vas.change_attr(
				upper,
				guard_bytes as u64,
				MemAttr::WRITABLE,
				MemAttr::empty(),
				None,
			) {
				warn!("Cannot unprotect stack guard at {upper:p}: {err:?}");
			}
			if let Err(err) = kernel_vas.free(*base, total) {
				warn!("Cannot free stack at {base:p}: {err:?}");
			}
		}
	}
}

fn align_up(value: usize, alignment: usize) -> usize {
	(value + alignment - 1) & !(alignment - 1)
}

/// First code every new thread runs, entered from the crafted frame with
/// interrupts still disabled and the unit lock still held.
extern "C" fn thread_start(func: extern "C" fn(usize), arg: usize) -> ! {
	crate::scheduler::finish_thread_launch();

	func(arg);

	crate::scheduler::exit_current(0);
}

/// Craft the initial register frame of a thread onto its stack and return
/// the stack-pointer value a context switch resumes from.
pub(crate) fn create_initial_frame(
	stacks: &ThreadStacks,
	func: extern "C" fn(usize),
	arg: usize,
) -> VirtAddr {
	unsafe {
		let mut stack = stacks.top().as_u64();
		stack -= mem::size_of::<State>() as u64;

		let state = stack as *mut State;
		ptr::write_bytes(state.cast::<u8>(), 0, mem::size_of::<State>());

		(*state).rip = thread_start as usize as u64;
		(*state).rdi = func as usize as u64;
		(*state).rsi = arg as u64;
		// Interrupts stay off until the thread released the unit lock;
		// only the always-one bit is set.
		(*state).rflags = 0x2;

		VirtAddr::new(stack)
	}
}
