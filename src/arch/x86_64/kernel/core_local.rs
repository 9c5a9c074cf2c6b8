use alloc::boxed::Box;
use core::arch::asm;
use core::cell::Cell;
use core::sync::atomic::Ordering;
use core::{mem, ptr};

use hermit_sync::InterruptSpinMutex;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::GsBase;
use x86_64::structures::tss::TaskStateSegment;

use super::CPU_ONLINE;
use super::interrupts::{IRQ_COUNTERS, IrqStatistics};
use crate::config::{DEFERRED_CALL_SLOTS, MAX_CORES};
use crate::scheduler::timer_queue::TimerQueue;
use crate::scheduler::{CoreId, ExecutionUnit};

/// A cross-CPU deferred function call (see `kernel::enqueue_call`).
#[derive(Clone, Copy)]
pub(crate) struct DeferredCall {
	pub func: fn(usize),
	pub arg: usize,
}

pub(crate) struct CoreLocal {
	this: *const Self,
	/// Sequential ID of this CPU core.
	core_id: CoreId,
	/// Scheduler execution unit of this core.
	scheduler: Cell<*mut ExecutionUnit>,
	/// Task State Segment (TSS) allocated for this core.
	pub tss: Cell<*mut TaskStateSegment>,
	/// Interface to the interrupt counters.
	irq_statistics: &'static IrqStatistics,
	/// Bounded pool of deferred calls sent by other cores.
	pub deferred_calls: InterruptSpinMutex<heapless::Deque<DeferredCall, DEFERRED_CALL_SLOTS>>,
	/// One-shot timer callbacks of this core.
	pub timer_queue: InterruptSpinMutex<TimerQueue>,
}

// SAFETY: `this`, `scheduler`, and `tss` are only ever read or mutated by
// the owning core (reached exclusively through `CoreLocal::get()`, which
// resolves via the per-core `gs` base). `deferred_calls` and `timer_queue`
// are the only fields genuinely shared across cores, and both are guarded
// by `InterruptSpinMutex`.
unsafe impl Sync for CoreLocal {}

/// All installed core-local blocks, indexed by core id. Needed to reach
/// another core's deferred-call pool.
static CORE_LOCALS: InterruptSpinMutex<heapless::Vec<&'static CoreLocal, MAX_CORES>> =
	InterruptSpinMutex::new(heapless::Vec::new());

impl CoreLocal {
	pub fn install() {
		assert_eq!(VirtAddr::zero(), GsBase::read());

		let core_id = CPU_ONLINE.load(Ordering::Relaxed);

		let irq_statistics = if core_id == 0 {
			static FIRST_IRQ_STATISTICS: IrqStatistics = IrqStatistics::new();
			&FIRST_IRQ_STATISTICS
		} else {
			&*Box::leak(Box::new(IrqStatistics::new()))
		};

		let this = Self {
			this: ptr::null(),
			core_id,
			scheduler: Cell::new(ptr::null_mut()),
			tss: Cell::new(ptr::null_mut()),
			irq_statistics,
			deferred_calls: InterruptSpinMutex::new(heapless::Deque::new()),
			timer_queue: InterruptSpinMutex::new(TimerQueue::new()),
		};
		// The boot core runs before the allocator exists and gets a static
		// block; every other core is heap-backed.
		let this: &'static mut Self = if core_id == 0 {
			static mut FIRST_CORE_LOCAL: Option<CoreLocal> = None;
			unsafe { (*ptr::addr_of_mut!(FIRST_CORE_LOCAL)).insert(this) }
		} else {
			this.add_irq_counter();
			Box::leak(Box::new(this))
		};
		this.this = ptr::from_ref(this);

		CORE_LOCALS
			.lock()
			.push(this)
			.unwrap_or_else(|_| panic!("too many cores"));

		GsBase::write(VirtAddr::from_ptr(this));
	}

	#[inline]
	pub fn get() -> &'static Self {
		debug_assert_ne!(VirtAddr::zero(), GsBase::read());
		unsafe {
			let raw: *const Self;
			asm!("mov {}, gs:{}", out(reg) raw, const mem::offset_of!(Self, this), options(nomem, nostack, preserves_flags));
			&*raw
		}
	}

	pub fn by_core_id(core_id: CoreId) -> Option<&'static Self> {
		CORE_LOCALS.lock().get(core_id as usize).copied()
	}

	pub fn add_irq_counter(&self) {
		IRQ_COUNTERS.lock().insert(self.core_id, self.irq_statistics);
	}
}

pub(crate) fn core_id() -> CoreId {
	if cfg!(target_os = "none") {
		if GsBase::read() == VirtAddr::zero() {
			// Early boot, before the core-local block exists.
			0
		} else {
			CoreLocal::get().core_id
		}
	} else {
		0
	}
}

pub(crate) fn core_unit() -> &'static ExecutionUnit {
	unsafe {
		CoreLocal::get()
			.scheduler
			.get()
			.as_ref()
			.expect("execution unit is not initialized")
	}
}

pub(crate) fn try_core_unit() -> Option<&'static ExecutionUnit> {
	if cfg!(target_os = "none") && GsBase::read() != VirtAddr::zero() {
		unsafe { CoreLocal::get().scheduler.get().as_ref() }
	} else {
		None
	}
}

pub(crate) fn set_core_unit(unit: *mut ExecutionUnit) {
	CoreLocal::get().scheduler.set(unit);
}

pub(crate) fn with_irq_statistics<R>(f: impl FnOnce(&IrqStatistics) -> R) -> R {
	static EARLY_IRQ_STATISTICS: IrqStatistics = IrqStatistics::new();

	if cfg!(target_os = "none") && GsBase::read() != VirtAddr::zero() {
		f(CoreLocal::get().irq_statistics)
	} else {
		f(&EARLY_IRQ_STATISTICS)
	}
}
