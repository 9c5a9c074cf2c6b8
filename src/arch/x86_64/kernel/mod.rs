use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

pub mod apic;
pub mod apic_timer;
pub mod core_local;
pub mod gdt;
pub mod interrupts;
pub mod isr;
pub mod pic;
pub mod pit;
pub mod processor;
pub mod scheduler;
pub mod serial;
#[cfg(feature = "smp")]
pub mod smp_boot;
pub mod switch;

use crate::drivers::intc::{InterruptController, IpiPacket, IpiShorthand};
use crate::scheduler::CoreId;

/// Number of cores that finished their bring-up.
pub(crate) static CPU_ONLINE: AtomicU32 = AtomicU32::new(0);

pub fn get_processor_count() -> u32 {
	CPU_ONLINE.load(Ordering::Acquire).max(1)
}

pub fn message_output_init() {
	serial::init();
}

pub fn output_message_buf(buf: &[u8]) {
	serial::output(buf);
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallError {
	#[error("the deferred-call pool of the target core is full")]
	PoolFull,
	#[error("no such core")]
	NoSuchCore,
}

/// Queue `func(arg)` on the target core and nudge it with a `SCHED` IPI.
///
/// The target drains its pool with interrupts disabled before it
/// reschedules.
pub fn enqueue_call(target: CoreId, func: fn(usize), arg: usize) -> Result<(), CallError> {
	let target_local = core_local::CoreLocal::by_core_id(target).ok_or(CallError::NoSuchCore)?;

	target_local
		.deferred_calls
		.lock()
		.push_back(core_local::DeferredCall { func, arg })
		.map_err(|_| CallError::PoolFull)?;

	send_reschedule_ipi(target);
	Ok(())
}

/// Drain this core's deferred-call pool. Runs in the `SCHED` vector with
/// interrupts disabled.
pub(crate) fn drain_deferred_calls() {
	loop {
		let call = core_local::CoreLocal::get().deferred_calls.lock().pop_front();
		let Some(call) = call else { break };
		(call.func)(call.arg);
	}
}

/// Ask another core to run through its scheduler.
pub fn send_reschedule_ipi(target: CoreId) {
	if target == core_local::core_id() {
		return;
	}
	let Some(apic_id) = apic::local_apic_id_for_core(target) else {
		return;
	};

	let packet = IpiPacket {
		vector: interrupts::SCHED_VECTOR,
		dest_cpu: apic_id,
		..IpiPacket::default()
	};
	apic::controller().send_ipi(&packet);
}

/// Broadcast a TLB shootdown to every other core.
pub(crate) fn send_tlb_invalidate_broadcast() {
	if get_processor_count() <= 1 {
		return;
	}

	let packet = IpiPacket {
		vector: interrupts::PAGE_INVALIDATE_VECTOR,
		shorthand: IpiShorthand::AllExcludingSelf,
		..IpiPacket::default()
	};
	apic::controller().send_ipi(&packet);
}

/// Early boot-processor initialization: everything that must run before
/// the memory subsystem comes up.
#[cfg(target_os = "none")]
pub fn boot_processor_init() {
	core_local::CoreLocal::install();
	processor::configure();
	pic::init();
	interrupts::install();
	interrupts::load_idt();
}

/// Boot-processor initialization that needs the allocator: APIC, per-CPU
/// descriptors, device registration.
#[cfg(target_os = "none")]
pub fn boot_processor_init_late() {
	use alloc::sync::Arc;

	use crate::config::TICK_PERIOD_MS;
	use crate::devmgr::{self, CpuInfo, Device, DeviceApi};

	core_local::CoreLocal::get().add_irq_counter();
	gdt::add_current_core();
	apic::init();

	let apic_id = apic::local_apic_id_for_core(0).unwrap_or(0);
	let cpu_dev = devmgr::dev_add(
		Device::new("cpu", 0).with_api(DeviceApi::Cpu(Arc::new(CpuInfo {
			core_id: 0,
			apic_id,
			proximity_domain: 0,
		}))),
	);

	let timer = Arc::new(apic_timer::ApicTimer::new(TICK_PERIOD_MS));
	if timer.calibrate() {
		devmgr::dev_add(
			Device::new("apic-timer", 0)
				.with_api(DeviceApi::Timer(timer))
				.with_parent(cpu_dev),
		);
	} else {
		// The boot processor can still tick through the 8254, which
		// arrives on the remapped legacy line and is acknowledged at
		// the PIC instead of the APIC.
		info!("Falling back to the 8254 as the boot tick source");
		let pit = Arc::new(pit::Pit::new(TICK_PERIOD_MS));
		devmgr::dev_add(
			Device::new("pit", 0)
				.with_api(DeviceApi::Timer(pit))
				.with_parent(cpu_dev),
		);
		isr::install(pit_eoi, 0, 0, true);
	}

	CPU_ONLINE.store(1, Ordering::Release);
}

/// Claims the legacy-timer line in the end-of-interrupt chain when the
/// 8254 fallback is active.
#[cfg(target_os = "none")]
fn pit_eoi(_cookie: usize, info: &isr::IsrInfo) -> isr::IsrStatus {
	if info.vector == pic::PIC1_INTERRUPT_OFFSET {
		pic::eoi(info.vector);
		isr::IsrStatus::Handled
	} else {
		isr::IsrStatus::NotHandled
	}
}

pub fn print_information() {
	infoheader!(" MULTIPROCESSOR INFORMATION ");
	infoentry!(
		"APIC in use",
		if processor::supports_x2apic() {
			"x2APIC"
		} else {
			"xAPIC"
		}
	);
	infoentry!("Initialized CPUs", get_processor_count());
	infofooter!();

	if log_enabled!(log::Level::Debug) {
		interrupts::print_statistics();
	}
}
