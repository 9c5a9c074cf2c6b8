//! Application-processor bring-up.
//!
//! The BSP copies a real-mode trampoline to a fixed low-memory frame,
//! patches its variables, and kicks every startable CPU with the
//! INIT/SIPI sequence. Each AP climbs to long mode inside the trampoline
//! and continues in [`ap_entry`].

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use memory_addresses::PhysAddr;
use thiserror::Error;

use super::apic;
use super::core_local::CoreLocal;
use super::processor;
use crate::config::{AP_START_ATTEMPTS, AP_START_TIMEOUT_MS, KERNEL_STACK_SIZE, TICK_PERIOD_MS};
use crate::devmgr::{self, CpuInfo, Device, DeviceApi};
use crate::drivers::intc::{InterruptController, IpiKind, IpiLevel, IpiPacket, IpiTrigger};

/// Physical frame the trampoline is copied to. Startup IPIs address code
/// by page number, so this must stay below 1 MiB and page-aligned.
const TRAMPOLINE_ADDRESS: u64 = 0x8000;

const OFFSET_ENTRY: u64 = 0x08;
const OFFSET_PAGE_TABLE: u64 = 0x10;
const OFFSET_STACK: u64 = 0x18;
const OFFSET_FEATURE_FLAGS: u64 = 0x20;

const FEATURE_5_LEVEL_PAGING: u64 = 1 << 0;
const FEATURE_NX: u64 = 1 << 1;

/// Written by an AP once it reaches [`ap_entry`]; the BSP spins on it.
static CPU_ON: AtomicU32 = AtomicU32::new(u32::MAX);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CpuStartError {
	#[error("application processor did not signal within the timeout")]
	StartTimeout,
}

#[cfg(target_os = "none")]
core::arch::global_asm!(
	r#"
	.section .text
	.balign 4096
	.global _ap_trampoline_start
	.global _ap_trampoline_end
	.code16
_ap_trampoline_start:
	jmp 3f
	.org 0x08
4:	.quad 0                     // entry point
	.org 0x10
5:	.quad 0                     // page-table root
	.org 0x18
6:	.quad 0                     // stack pointer
	.org 0x20
7:	.quad 0                     // feature flags
	.org 0x28
8:	.quad 0                     // null descriptor
	.quad 0x00CF9A000000FFFF    // 32-bit code
	.quad 0x00CF92000000FFFF    // data
	.quad 0x00AF9A000000FFFF    // 64-bit code
9:	.word 9b - 8b - 1
	.long 0x8000 + (8b - _ap_trampoline_start)

3:	cli
	xorw %ax, %ax
	movw %ax, %ds
	lgdtl 0x8000 + (9b - _ap_trampoline_start)
	movl %cr0, %eax
	orl $1, %eax
	movl %eax, %cr0
	ljmpl $0x08, $(0x8000 + (30f - _ap_trampoline_start))

	.code32
30:	movw $0x10, %ax
	movw %ax, %ds
	movw %ax, %es
	movw %ax, %ss
	movl %cr4, %eax
	orl $0x20, %eax             // PAE
	movl 0x8000 + (7b - _ap_trampoline_start), %ebx
	testl $1, %ebx
	jz 31f
	orl $0x1000, %eax           // LA57
31:	movl %eax, %cr4
	movl 0x8000 + (5b - _ap_trampoline_start), %eax
	movl %eax, %cr3
	movl $0xC0000080, %ecx      // EFER
	rdmsr
	orl $0x100, %eax            // LME
	movl 0x8000 + (7b - _ap_trampoline_start), %ebx
	testl $2, %ebx
	jz 32f
	orl $0x800, %eax            // NXE
32:	wrmsr
	movl %cr0, %eax
	orl $0x80010001, %eax       // PG | WP | PE
	movl %eax, %cr0
	ljmpl $0x18, $(0x8000 + (33f - _ap_trampoline_start))

	.code64
33:	movq 0x8000 + (6b - _ap_trampoline_start), %rsp
	movq 0x8000 + (4b - _ap_trampoline_start), %rax
	xorq %rbp, %rbp
	jmpq *%rax
_ap_trampoline_end:
	"#,
	options(att_syntax)
);

#[cfg(target_os = "none")]
unsafe extern "C" {
	static _ap_trampoline_start: u8;
	static _ap_trampoline_end: u8;
}

#[cfg(target_os = "none")]
fn trampoline_image() -> &'static [u8] {
	unsafe {
		let start = core::ptr::addr_of!(_ap_trampoline_start);
		let end = core::ptr::addr_of!(_ap_trampoline_end);
		core::slice::from_raw_parts(start, end.offset_from(start) as usize)
	}
}

#[cfg(target_os = "none")]
fn patch(field: u64, value: u64) {
	unsafe {
		((TRAMPOLINE_ADDRESS + field) as *mut u64).write_volatile(value);
	}
}

/// Copy the trampoline into its low-memory frame and fill in everything
/// that is identical for all APs.
#[cfg(target_os = "none")]
fn prepare_trampoline() {
	let image = trampoline_image();
	assert!(image.len() < 4096, "AP trampoline does not fit a page");

	crate::arch::mm::paging::identity_map_page(PhysAddr::new(TRAMPOLINE_ADDRESS));

	unsafe {
		core::ptr::copy_nonoverlapping(
			image.as_ptr(),
			TRAMPOLINE_ADDRESS as *mut u8,
			image.len(),
		);
	}

	let root = crate::arch::mm::paging::kernel_root_table();
	assert!(root.as_u64() < u64::from(u32::MAX), "kernel page root must be 32-bit reachable");
	patch(OFFSET_PAGE_TABLE, root.as_u64());

	let mut features = 0;
	if crate::arch::mm::paging::uses_5_levels() {
		features |= FEATURE_5_LEVEL_PAGING;
	}
	if processor::supports_nx() {
		features |= FEATURE_NX;
	}
	patch(OFFSET_FEATURE_FLAGS, features);
	patch(OFFSET_ENTRY, ap_entry as usize as u64);
}

#[cfg(target_os = "none")]
fn cleanup_trampoline() {
	unsafe {
		core::ptr::write_bytes(TRAMPOLINE_ADDRESS as *mut u8, 0, trampoline_image().len());
	}
	crate::arch::mm::paging::identity_unmap_page(PhysAddr::new(TRAMPOLINE_ADDRESS));
}

fn send_init(intc: &dyn InterruptController, apic_id: u32) {
	let mut init = IpiPacket {
		kind: IpiKind::Init,
		level: IpiLevel::Assert,
		trigger: IpiTrigger::Level,
		dest_cpu: apic_id,
		..IpiPacket::default()
	};
	intc.send_ipi(&init);
	processor::udelay(200);

	init.level = IpiLevel::Deassert;
	intc.send_ipi(&init);
	processor::udelay(10_000);
}

fn send_sipi(intc: &dyn InterruptController, apic_id: u32) {
	let sipi = IpiPacket {
		kind: IpiKind::Startup,
		level: IpiLevel::Assert,
		vector: (TRAMPOLINE_ADDRESS >> 12) as u8,
		dest_cpu: apic_id,
		..IpiPacket::default()
	};
	intc.send_ipi(&sipi);
	processor::udelay(200);
}

fn wait_for_signal(core_id: u32, timeout_ms: u64) -> bool {
	let deadline = processor::get_timer_ticks() + timeout_ms * 1000;
	while processor::get_timer_ticks() < deadline {
		if CPU_ON.load(Ordering::Acquire) == core_id {
			return true;
		}
		core::hint::spin_loop();
	}
	false
}

/// Bring up every startable application processor.
///
/// A core that never signals is skipped; the kernel keeps running on the
/// cores it has. Returns the number of running CPUs.
#[cfg(target_os = "none")]
pub fn boot_application_processors() -> Result<u32, CpuStartError> {
	use super::CPU_ONLINE;

	let intc = apic::controller();
	let core_count = {
		let mut count = 1;
		while apic::local_apic_id_for_core(count).is_some() {
			count += 1;
		}
		count
	};

	if core_count == 1 {
		info!("No application processors reported");
		return Ok(1);
	}

	prepare_trampoline();

	for core_id in 1..core_count {
		let apic_id = apic::local_apic_id_for_core(core_id).unwrap();
		debug!("Waking up CPU {core_id} with local APIC id {apic_id}");

		// A fresh stack per AP; the trampoline switches to it before
		// entering Rust.
		let stack = crate::mm::allocate(KERNEL_STACK_SIZE, false)
			.expect("no memory for an AP boot stack");
		patch(OFFSET_STACK, stack.as_u64() + KERNEL_STACK_SIZE as u64 - 0x10);

		CPU_ON.store(u32::MAX, Ordering::Release);

		let mut started = false;
		for attempt in 0..AP_START_ATTEMPTS {
			send_init(&*intc, apic_id);
			send_sipi(&*intc, apic_id);

			if wait_for_signal(core_id, AP_START_TIMEOUT_MS / AP_START_ATTEMPTS as u64) {
				started = true;
				break;
			}
			debug!("CPU {core_id} did not respond to SIPI attempt {attempt}");
		}

		if started {
			// Let the AP finish its init before reusing the trampoline.
			while CPU_ONLINE.load(Ordering::Acquire) <= core_id {
				core::hint::spin_loop();
			}
		} else {
			warn!("CPU {core_id} failed to start, skipping");
		}
	}

	cleanup_trampoline();

	Ok(CPU_ONLINE.load(Ordering::Acquire))
}

/// Rust-side entry of every application processor.
#[cfg(target_os = "none")]
extern "C" fn ap_entry() -> ! {
	use super::CPU_ONLINE;

	// Per-CPU paging state: control registers, PAT, and a CR3 reload.
	processor::configure();
	crate::arch::mm::paging::reload_root_table();

	CoreLocal::install();
	let core_id = super::core_local::core_id();

	super::gdt::add_current_core();
	super::interrupts::load_idt();
	apic::init_local_ap();

	let apic_id = apic::local_apic_id_for_core(core_id).unwrap_or(0);
	let cpu_dev = devmgr::dev_add(
		Device::new("cpu", core_id).with_api(DeviceApi::Cpu(Arc::new(CpuInfo {
			core_id,
			apic_id,
			proximity_domain: 0,
		}))),
	);

	// Find a local tick source; a unit without one runs tickless and is
	// driven by reschedule IPIs alone.
	let timer = Arc::new(super::apic_timer::ApicTimer::new(TICK_PERIOD_MS));
	let timer_dev = if timer.calibrate() {
		devmgr::dev_add(
			Device::new("apic-timer", core_id)
				.with_api(DeviceApi::Timer(timer))
				.with_parent(cpu_dev),
		);
		devmgr::dev_get_by_name("apic-timer", core_id)
	} else {
		warn!("CPU {core_id} has no usable local timer, running tickless");
		None
	};

	// Signal the BSP that this core is alive; it keeps waiting on the
	// online count until the execution unit exists, so threads can be
	// placed here the moment the next AP starts.
	CPU_ON.store(core_id, Ordering::Release);

	info!("CPU {core_id} STARTED");

	crate::scheduler::add_current_core(timer_dev);
	CPU_ONLINE.fetch_add(1, Ordering::AcqRel);

	crate::scheduler::run_idle_loop()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn trampoline_layout_constants() {
		// Startup IPI vectors address 4 KiB pages below 1 MiB.
		assert_eq!(TRAMPOLINE_ADDRESS % 4096, 0);
		assert!(TRAMPOLINE_ADDRESS < 0x10_0000);
		assert_eq!(TRAMPOLINE_ADDRESS >> 12, 0x08);

		// The patch slots must not overlap.
		let offsets = [OFFSET_ENTRY, OFFSET_PAGE_TABLE, OFFSET_STACK, OFFSET_FEATURE_FLAGS];
		for pair in offsets.windows(2) {
			assert!(pair[1] - pair[0] >= 8);
		}
	}
}
