use alloc::boxed::Box;
use core::ptr;

use memory_addresses::VirtAddr;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{CS, SS, Segment};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

use super::core_local::CoreLocal;
use crate::config::KERNEL_STACK_SIZE;

/// Build and load a GDT and TSS for the calling CPU.
///
/// The layout is shared between cores, the TSS is not. IST0 gets its own
/// stack so the double-fault path always runs on known-good memory.
pub fn add_current_core() {
	let tss = Box::leak(Box::new(TaskStateSegment::new()));

	let ist = crate::mm::allocate(KERNEL_STACK_SIZE, true).expect("no memory for the IST stack");
	tss.interrupt_stack_table[0] = x86_64::VirtAddr::new(ist.as_u64() + KERNEL_STACK_SIZE as u64 - 0x10);

	CoreLocal::get().tss.set(ptr::from_mut(tss));

	let gdt = Box::leak(Box::new(GlobalDescriptorTable::new()));
	let code_selector = gdt.append(Descriptor::kernel_code_segment());
	let data_selector = gdt.append(Descriptor::kernel_data_segment());
	let tss_selector = gdt.append(Descriptor::tss_segment(tss));

	gdt.load();
	unsafe {
		CS::set_reg(code_selector);
		SS::set_reg(data_selector);
		load_tss(tss_selector);
	}
}

/// Point the privilege-0 stack of this core's TSS at the given stack top.
pub fn set_current_kernel_stack(stack_top: VirtAddr) {
	let tss = unsafe { &mut *CoreLocal::get().tss.get() };
	tss.privilege_stack_table[0] = x86_64::VirtAddr::new(stack_top.as_u64());
}
