//! Per-CPU preemptive scheduling.
//!
//! Every core owns one execution unit: the current thread, an idle
//! thread running on the boot stack, a dead queue and a runqueue policy.
//! All state transitions happen under the unit lock; the lock is carried
//! across the context switch and released on the new thread's stack.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "none")]
use hermit_sync::without_interrupts;
use hermit_sync::{InterruptSpinMutex, OnceCell, SpinMutex};
use memory_addresses::VirtAddr;

use crate::arch::kernel::core_local::{self, CoreLocal, core_unit, try_core_unit};
use crate::arch::kernel::interrupts::{LOCAL_TIMER_VECTOR, SCHED_VECTOR};
use crate::arch::kernel::isr::{self, IsrInfo, IsrStatus};
use crate::arch::kernel::processor;
use crate::arch::kernel::scheduler::ThreadStacks;
use crate::config::MAX_CORES;
use crate::devmgr::{Device, DeviceApi};
use crate::drivers::timer::{TimeSpec, TimerDevice};
use crate::mm::virtualmem::VmError;
use crate::scheduler::policy::default_policy;
use crate::scheduler::task::*;
use crate::scheduler::timer_queue::TimerHandle;

pub mod policy;
pub mod task;
pub mod timer_queue;

/// Unique identifier for a core.
pub type CoreId = u32;

/// Sleep without a deadline.
pub const WAIT_FOREVER: u64 = u64::MAX;

bitflags::bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub(crate) struct UnitFlags: u32 {
		/// Woken threads are waiting to migrate out of the sleep queue.
		const THREADS_WAKE = 1 << 0;
		/// Preemption is disabled on this unit.
		const NO_PREEMPT = 1 << 1;
		/// The unit has not run its first reschedule yet.
		const START = 1 << 2;
	}
}

pub(crate) struct UnitInner {
	current: Option<Arc<Thread>>,
	idle: Arc<Thread>,
	dead: VecDeque<Arc<Thread>>,
	policy: Box<dyn policy::SchedPolicy>,
}

/// Per-CPU scheduler state.
pub(crate) struct ExecutionUnit {
	pub core_id: CoreId,
	flags: AtomicU32,
	inner: SpinMutex<UnitInner>,
	timer: Option<Arc<dyn TimerDevice>>,
}

/// All execution units, indexed by core id.
static UNITS: InterruptSpinMutex<heapless::Vec<&'static ExecutionUnit, MAX_CORES>> =
	InterruptSpinMutex::new(heapless::Vec::new());

pub(crate) fn unit_by_core(core_id: CoreId) -> Option<&'static ExecutionUnit> {
	UNITS.lock().get(core_id as usize).copied()
}

impl ExecutionUnit {
	fn set_flag(&self, flag: UnitFlags) {
		self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
	}

	fn clear_flag(&self, flag: UnitFlags) {
		self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
	}

	fn has_flag(&self, flag: UnitFlags) -> bool {
		self.flags.load(Ordering::SeqCst) & flag.bits() != 0
	}

	/// Take the wake hint, if set.
	fn take_wake_hint(&self) -> bool {
		self.flags.fetch_and(!UnitFlags::THREADS_WAKE.bits(), Ordering::SeqCst)
			& UnitFlags::THREADS_WAKE.bits()
			!= 0
	}

	pub fn current_needs_reschedule(&self) -> bool {
		let inner = self.inner.lock();
		inner
			.current
			.as_ref()
			.is_some_and(|current| current.flags().contains(ThreadFlags::NEED_RESCHEDULE))
	}
}

/// The per-unit reschedule sequence.
///
/// Entered from the `SCHED` IPI, the local tick, an explicit yield, or a
/// blocking primitive. Interrupts must be disabled.
#[cfg(target_os = "none")]
unsafe fn schedule() {
	let unit = core_unit();
	if unit.has_flag(UnitFlags::NO_PREEMPT) {
		return;
	}
	unit.clear_flag(UnitFlags::START);

	let mut inner = unit.inner.lock();

	// Hand the current thread back to the policy (or the dead queue).
	let prev = inner.current.take().unwrap_or_else(|| inner.idle.clone());
	prev.clear_flags(ThreadFlags::RUNNING | ThreadFlags::NEED_RESCHEDULE);

	let prev_is_idle = Arc::ptr_eq(&prev, &inner.idle);
	if !prev_is_idle {
		if prev.is_dead() {
			inner.dead.push_back(prev.clone());
		} else {
			if !prev.flags().contains(ThreadFlags::SLEEPING) {
				prev.set_flags(ThreadFlags::READY);
			}
			inner.policy.enqueue(prev.clone());
		}
	}

	// Ask the policy for a successor; the idle thread is the fallback.
	let wake_pending = unit.take_wake_hint();
	let next = inner
		.policy
		.dequeue(unit.core_id, wake_pending)
		.unwrap_or_else(|| inner.idle.clone());

	if Arc::ptr_eq(&prev, &next) {
		// Nothing to switch; restore and leave.
		next.set_flags(ThreadFlags::RUNNING);
		next.clear_flags(ThreadFlags::READY);
		inner.current = Some(next);
		return;
	}

	next.clear_flags(ThreadFlags::READY);
	next.set_flags(ThreadFlags::RUNNING);
	next.unit_core.store(unit.core_id, Ordering::Relaxed);
	next.context_switches.fetch_add(1, Ordering::Relaxed);

	let prev_sp_slot = unsafe { prev.stack_pointer_slot() };
	let next_sp = unsafe { *next.stack_pointer_slot() };
	let switch_root = next.root_table != prev.root_table;
	let next_root = next.root_table;

	inner.current = Some(next);

	// The unit lock travels across the switch and is released by the
	// resumed side (or by a fresh thread's launch code).
	core::mem::forget(inner);

	if switch_root && next_root.as_u64() != 0 {
		unsafe {
			let frame = x86_64::structures::paging::PhysFrame::containing_address(
				x86_64::PhysAddr::new(next_root.as_u64()),
			);
			x86_64::registers::control::Cr3::write(
				frame,
				x86_64::registers::control::Cr3Flags::empty(),
			);
		}
	}

	unsafe {
		crate::arch::kernel::switch::switch_to_task(prev_sp_slot, next_sp);
	}

	// Back on this stack: some other reschedule switched to us and left
	// its unit lock held.
	unsafe {
		core_unit().inner.force_unlock();
	}
}

/// Yield or preempt: run the scheduler with interrupts disabled.
pub fn reschedule() {
	#[cfg(target_os = "none")]
	without_interrupts(|| unsafe { schedule() });
}

pub fn yield_now() {
	reschedule();
}

/// Called by every fresh thread before its entry function: drop the unit
/// lock the scheduler carried across the first switch.
pub(crate) fn finish_thread_launch() {
	#[cfg(target_os = "none")]
	unsafe {
		core_unit().inner.force_unlock();
	}
	crate::arch::kernel::interrupts::enable();
}

/// Refresh the TSS stack entry; called from the switch path while the
/// unit lock is held by this CPU.
pub(crate) extern "C" fn set_current_kernel_stack() {
	#[cfg(target_os = "none")]
	{
		let unit = core_unit();
		let inner = unsafe { &*unit.inner.data_ptr() };
		if let Some(current) = &inner.current {
			let top = current.stacks.top();
			if top.as_u64() != 0 {
				crate::arch::kernel::gdt::set_current_kernel_stack(top);
			}
		}
	}
}

pub fn disable_preemption() {
	if let Some(unit) = try_core_unit() {
		unit.set_flag(UnitFlags::NO_PREEMPT);
	}
}

pub fn enable_preemption() {
	if let Some(unit) = try_core_unit() {
		unit.clear_flag(UnitFlags::NO_PREEMPT);
	}
}

// --- thread lifecycle ----------------------------------------------------

/// Create and start a kernel thread.
pub fn spawn(
	entry: extern "C" fn(usize),
	arg: usize,
	stack_size: usize,
	prio: u8,
	affinity: u64,
) -> Result<ThreadId, VmError> {
	let stacks = ThreadStacks::new(stack_size)?;
	let id = next_thread_id();
	let root = crate::arch::mm::paging::kernel_root_table();
	let thread = Arc::new(Thread::new(id, prio, affinity, stacks, entry, arg, root));

	owner_insert(thread.clone());
	start_thread(thread);
	Ok(id)
}

/// Move a fresh thread onto a unit's runqueue.
pub(crate) fn start_thread(thread: Arc<Thread>) {
	static NEXT_CORE: AtomicU32 = AtomicU32::new(0);

	let count = crate::arch::kernel::get_processor_count();
	let mut core_id = NEXT_CORE.fetch_add(1, Ordering::Relaxed) % count;
	for _ in 0..count {
		if thread.may_run_on(core_id) {
			break;
		}
		core_id = (core_id + 1) % count;
	}

	// A core whose unit is still coming up cannot take threads; fall
	// back to the boot core.
	let unit = unit_by_core(core_id).or_else(|| unit_by_core(0)).unwrap();

	thread.unit_core.store(unit.core_id, Ordering::Relaxed);
	thread.set_flags(ThreadFlags::READY);

	unit.inner.lock().policy.enqueue(thread);
	crate::arch::kernel::send_reschedule_ipi(unit.core_id);
}

pub(crate) fn current_thread() -> Arc<Thread> {
	core_unit()
		.inner
		.lock()
		.current
		.clone()
		.expect("no current thread")
}

pub(crate) fn current_thread_handle() -> ThreadHandle {
	let thread = current_thread();
	ThreadHandle {
		id: thread.id,
		prio: thread.prio,
		core_id: thread.unit_core.load(Ordering::Relaxed),
	}
}

/// Put the calling thread to sleep for `ms` milliseconds (or forever).
///
/// A thread woken early (semaphore, mutex) disarms its wake timer on the
/// way out; `WOKE_BY_TIMER` disambiguates the two wake sources.
pub fn sleep(ms: u64) {
	if ms == 0 {
		return;
	}

	let thread = current_thread();
	{
		let _guard = thread.lock.lock();
		thread.set_flags(ThreadFlags::SLEEPING);
		thread.clear_flags(ThreadFlags::RUNNING | ThreadFlags::READY);
	}

	let handle = (ms != WAIT_FOREVER).then(|| {
		let deadline = processor::get_timer_ticks() + ms * 1000;
		CoreLocal::get().timer_queue.lock().enqueue(
			deadline,
			sleep_timer_callback,
			thread.id.into() as usize,
		)
	});

	reschedule();

	finish_timed_block(handle);
}

fn sleep_timer_callback(cookie: usize) -> u32 {
	let id = ThreadId::from(cookie as u32);
	if let Some(thread) = owner_get(id) {
		thread.set_flags(ThreadFlags::WOKE_BY_TIMER);
		wake_thread(&thread);
	}
	0
}

/// Make a sleeping thread runnable again.
pub(crate) fn wake_thread(thread: &Arc<Thread>) {
	let core_id = {
		let _guard = thread.lock.lock();
		thread.clear_flags(ThreadFlags::SLEEPING);
		thread.set_flags(ThreadFlags::READY);
		thread.unit_core.load(Ordering::Relaxed)
	};

	if let Some(unit) = unit_by_core(core_id) {
		unit.set_flag(UnitFlags::THREADS_WAKE);
	}
	// Nudge the unit; tickless cores depend on it.
	crate::arch::kernel::send_reschedule_ipi(core_id);
}

pub(crate) fn wake_by_handle(handle: ThreadHandle) {
	if let Some(thread) = owner_get(handle.id) {
		wake_thread(&thread);
	}
}

/// Block the calling thread, optionally arming a wake at the absolute
/// time `deadline_us`. The caller passes the returned handle to
/// [`finish_timed_block`] once it is awake again, so an early wake
/// disarms the timer before it can fire into an unrelated wait.
pub(crate) fn block_current(deadline_us: Option<u64>) -> Option<TimerHandle> {
	let thread = current_thread();
	let _guard = thread.lock.lock();
	thread.set_flags(ThreadFlags::SLEEPING);
	thread.clear_flags(ThreadFlags::READY);

	deadline_us.map(|deadline| {
		CoreLocal::get().timer_queue.lock().enqueue(
			deadline,
			sleep_timer_callback,
			thread.id.into() as usize,
		)
	})
}

/// Settle a timed block after waking: a wake timer that did not fire is
/// disarmed, and the timer-wake mark is consumed either way.
pub(crate) fn finish_timed_block(timer: Option<TimerHandle>) {
	let Some(handle) = timer else { return };

	let thread = current_thread();
	if !thread.flags().contains(ThreadFlags::WOKE_BY_TIMER) {
		// Woken by someone else; the timer is still armed.
		CoreLocal::get().timer_queue.lock().dequeue(handle);
	}
	thread.clear_flags(ThreadFlags::WOKE_BY_TIMER);
}

/// Terminate the calling thread.
pub fn exit_current(code: usize) -> ! {
	let thread = current_thread();
	debug!("Thread {} exits with {code}", thread.id);
	{
		let _guard = thread.lock.lock();
		if !thread.is_dead() {
			thread.set_flags(ThreadFlags::DEAD);
			*thread.return_value.lock() = Some(code);
		}
	}

	reschedule();

	// A dead thread is never scheduled again.
	unreachable!("a dead thread came back to life");
}

/// Kill the current thread from an exception context. Faults hitting the
/// idle thread, or anything before the scheduler is up, are fatal.
pub(crate) fn abort_current() -> ! {
	if let Some(unit) = try_core_unit() {
		let is_idle = {
			let inner = unit.inner.lock();
			match &inner.current {
				Some(current) => Arc::ptr_eq(current, &inner.idle),
				None => true,
			}
		};
		if !is_idle {
			exit_current(usize::MAX);
		}
	}
	panic!("fatal exception outside a kernel thread");
}

/// Free everything the dead threads of this unit left behind.
fn reap_dead(unit: &ExecutionUnit) {
	loop {
		let dead = unit.inner.lock().dead.pop_front();
		let Some(thread) = dead else { break };

		debug!("Reaping thread {}", thread.id);
		owner_remove(thread.id);
		// Dropping the last reference frees stack and control block.
		drop(thread);
	}
}

// --- interrupt plumbing --------------------------------------------------

/// The tick handler registered with the unit's timer device.
///
/// Expires due one-shot timers, charges the quantum, and requests a
/// reschedule once it is used up.
fn sched_tick(ctx: usize, _step: &TimeSpec) -> u32 {
	let unit = unsafe { &*(ctx as *const ExecutionUnit) };

	let now = processor::get_timer_ticks();
	let due = CoreLocal::get().timer_queue.lock().take_due(now);
	for entry in due {
		entry.fire();
	}

	let current = {
		let mut inner = unit.inner.lock();
		let current = inner.current.clone();
		inner.policy.tick(current.as_deref());
		current
	};

	if let Some(current) = current
		&& current.cpu_left.load(Ordering::Relaxed) == 0
	{
		current.set_flags(ThreadFlags::NEED_RESCHEDULE);
		current.reset_quantum();
	}

	0
}

/// Vector handler of the local tick: route into the unit's timer device.
fn local_timer_isr(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
	let Some(unit) = try_core_unit() else {
		return IsrStatus::NotHandled;
	};
	let Some(timer) = &unit.timer else {
		return IsrStatus::NotHandled;
	};

	if let Some((handler, ctx)) = timer.get_handler() {
		let step = timer
			.resolution()
			.unwrap_or(TimeSpec::from_ms(crate::config::TICK_PERIOD_MS));
		let reserved = handler(ctx, &step);
		debug_assert_eq!(reserved, 0);
	}
	IsrStatus::Handled
}

/// Vector handler of the `SCHED` IPI: drain deferred calls, then let the
/// interrupt epilogue reschedule.
fn sched_ipi_isr(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
	crate::arch::kernel::drain_deferred_calls();

	if let Some(unit) = try_core_unit() {
		let inner = unit.inner.lock();
		if let Some(current) = &inner.current {
			current.set_flags(ThreadFlags::NEED_RESCHEDULE);
		}
	}
	IsrStatus::Handled
}

/// Whether the interrupt epilogue should run the scheduler.
pub(crate) fn needs_reschedule() -> bool {
	try_core_unit().is_some_and(ExecutionUnit::current_needs_reschedule)
}

fn install_handlers() {
	isr::install(local_timer_isr, 0, LOCAL_TIMER_VECTOR, false);
	isr::install(sched_ipi_isr, 0, SCHED_VECTOR, false);
	// The 8254 fallback ticks through the remapped legacy line.
	isr::install(local_timer_isr, 0, crate::arch::kernel::pic::PIC1_INTERRUPT_OFFSET, false);
}

// --- bring-up ------------------------------------------------------------

#[cfg(target_os = "none")]
fn current_stack_top() -> VirtAddr {
	let rsp: u64;
	unsafe {
		core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
	}
	VirtAddr::new(rsp & !0xF)
}

/// Create the execution unit of the calling core. The caller's context
/// becomes the unit's idle thread.
pub fn add_current_core(timer_dev: Option<Arc<Device>>) {
	static HANDLERS: OnceCell<()> = OnceCell::new();

	let core_id = core_local::core_id();
	let idle_id = next_thread_id();

	#[cfg(target_os = "none")]
	let boot_top = current_stack_top();
	#[cfg(not(target_os = "none"))]
	let boot_top = VirtAddr::zero();

	let root = crate::arch::mm::paging::kernel_root_table();
	let idle = Arc::new(Thread::new_idle(idle_id, core_id, boot_top, root));
	owner_insert(idle.clone());

	let timer = timer_dev.and_then(|dev| match dev.api() {
		DeviceApi::Timer(timer) => Some(timer),
		_ => None,
	});

	debug!("Initializing execution unit for core {core_id} (idle thread {idle_id})");
	let unit: &'static ExecutionUnit = Box::leak(Box::new(ExecutionUnit {
		core_id,
		flags: AtomicU32::new(UnitFlags::START.bits()),
		inner: SpinMutex::new(UnitInner {
			current: Some(idle.clone()),
			idle,
			dead: VecDeque::new(),
			policy: default_policy(),
		}),
		timer: timer.clone(),
	}));

	UNITS
		.lock()
		.push(unit)
		.unwrap_or_else(|_| panic!("too many cores"));
	core_local::set_core_unit(core::ptr::from_ref(unit).cast_mut());

	if HANDLERS.set(()).is_ok() {
		install_handlers();
	}

	match &timer {
		Some(timer) => {
			timer
				.set_handler(sched_tick, core::ptr::from_ref(unit) as usize)
				.expect("the tick source rejects handlers");
			timer.enable();
		}
		None => info!("Core {core_id} runs tickless, relying on reschedule IPIs"),
	}
}

/// The idle loop every core parks in: reap, reschedule, halt.
pub fn run_idle_loop() -> ! {
	let unit = core_unit();
	info!("Core {} entered its idle loop", unit.core_id);

	loop {
		reap_dead(unit);
		reschedule();

		cfg_if::cfg_if! {
			if #[cfg(feature = "idle-poll")] {
				core::hint::spin_loop();
			} else {
				crate::arch::kernel::interrupts::enable_and_wait();
			}
		}
	}
}

pub fn active_thread_count() -> usize {
	owner_thread_count()
}
