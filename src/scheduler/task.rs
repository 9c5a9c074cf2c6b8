//! Thread control blocks and the kernel owner registry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hermit_sync::{InterruptTicketMutex, SpinMutex};
use memory_addresses::{PhysAddr, VirtAddr};

use crate::arch::kernel::scheduler::{ThreadStacks, create_initial_frame};
use crate::scheduler::CoreId;

/// Unique identifier of a kernel thread.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
	pub const fn into(self) -> u32 {
		self.0
	}

	pub const fn from(x: u32) -> Self {
		ThreadId(x)
	}
}

impl fmt::Display for ThreadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

bitflags::bitflags! {
	/// Thread state and transient hints. `READY`, `RUNNING`, `SLEEPING`
	/// and `DEAD` form the state machine; a fresh thread carries no
	/// state bits at all.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ThreadFlags: u32 {
		const RUNNING = 1 << 0;
		const READY = 1 << 1;
		const SLEEPING = 1 << 2;
		const DEAD = 1 << 3;
		/// Transient hint on running threads.
		const NEED_RESCHEDULE = 1 << 4;
		/// The sleep timer fired before anything else woke the thread.
		const WOKE_BY_TIMER = 1 << 5;
	}
}

pub const HIGHEST_PRIO: u8 = 0;
pub const NORMAL_PRIO: u8 = 128;
pub const IDLE_PRIO: u8 = 255;

/// A kernel thread.
///
/// The owner registry holds the authoritative reference; queues and
/// execution units only keep `Arc` clones and a thread never references
/// its unit other than by core id, so no cycles can form.
pub(crate) struct Thread {
	pub id: ThreadId,
	pub prio: u8,
	/// One bit per core the thread may run on.
	pub affinity: AtomicU64,
	pub flags: AtomicU32,
	/// Serializes compound state transitions (sleep, wake, exit).
	pub lock: SpinMutex<()>,
	/// Core the thread last belonged to; `u32::MAX` before start.
	pub unit_core: AtomicU32,
	/// Saved stack pointer while the thread is off-CPU. Only the owning
	/// execution unit touches this, under its unit lock.
	last_stack_pointer: UnsafeCell<u64>,
	/// Root of the address space the thread runs in.
	pub root_table: PhysAddr,
	pub stacks: ThreadStacks,
	/// Remaining quantum in ticks.
	pub cpu_left: AtomicU32,
	pub context_switches: AtomicU64,
	pub return_value: SpinMutex<Option<usize>>,
}

// `last_stack_pointer` is guarded by the unit lock, everything else is
// atomic or locked.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
	pub fn new(
		id: ThreadId,
		prio: u8,
		affinity: u64,
		stacks: ThreadStacks,
		entry: extern "C" fn(usize),
		arg: usize,
		root_table: PhysAddr,
	) -> Self {
		let initial_sp = create_initial_frame(&stacks, entry, arg);
		debug!("Creating thread {id} with priority {prio}");

		Self {
			id,
			prio,
			affinity: AtomicU64::new(affinity),
			flags: AtomicU32::new(0),
			lock: SpinMutex::new(()),
			unit_core: AtomicU32::new(u32::MAX),
			last_stack_pointer: UnsafeCell::new(initial_sp.as_u64()),
			root_table,
			stacks,
			cpu_left: AtomicU32::new(quantum_for(prio)),
			context_switches: AtomicU64::new(0),
			return_value: SpinMutex::new(None),
		}
	}

	/// The idle thread adopts the stack its core booted on.
	pub fn new_idle(id: ThreadId, core_id: CoreId, boot_stack_top: VirtAddr, root_table: PhysAddr) -> Self {
		debug!("Creating idle thread {id} for core {core_id}");

		Self {
			id,
			prio: IDLE_PRIO,
			affinity: AtomicU64::new(1 << core_id),
			flags: AtomicU32::new(ThreadFlags::RUNNING.bits()),
			lock: SpinMutex::new(()),
			unit_core: AtomicU32::new(core_id),
			last_stack_pointer: UnsafeCell::new(0),
			root_table,
			stacks: ThreadStacks::from_boot_stack(boot_stack_top),
			cpu_left: AtomicU32::new(quantum_for(IDLE_PRIO)),
			context_switches: AtomicU64::new(0),
			return_value: SpinMutex::new(None),
		}
	}

	pub fn flags(&self) -> ThreadFlags {
		ThreadFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
	}

	pub fn set_flags(&self, flags: ThreadFlags) {
		self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
	}

	pub fn clear_flags(&self, flags: ThreadFlags) {
		self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
	}

	pub fn is_dead(&self) -> bool {
		self.flags().contains(ThreadFlags::DEAD)
	}

	pub fn may_run_on(&self, core_id: CoreId) -> bool {
		self.affinity.load(Ordering::Relaxed) & (1 << core_id) != 0
	}

	/// Location of the saved stack pointer, for the context switch.
	///
	/// # Safety
	///
	/// Only the owning unit may use this, under its unit lock.
	pub unsafe fn stack_pointer_slot(&self) -> *mut u64 {
		self.last_stack_pointer.get()
	}

	pub fn reset_quantum(&self) {
		self.cpu_left.store(quantum_for(self.prio), Ordering::Relaxed);
	}
}

/// Ticks a thread of the given priority may run before preemption.
pub(crate) fn quantum_for(prio: u8) -> u32 {
	u32::from(255 - prio).max(1)
}

/// Copyable reference used in pend queues; resolving it goes through the
/// owner registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ThreadHandle {
	pub id: ThreadId,
	pub prio: u8,
	pub core_id: CoreId,
}

/// The kernel owner: the authoritative container of all thread
/// lifetimes.
pub(crate) static OWNER: InterruptTicketMutex<BTreeMap<ThreadId, Arc<Thread>>> =
	InterruptTicketMutex::new(BTreeMap::new());

pub(crate) fn owner_insert(thread: Arc<Thread>) {
	OWNER.lock().insert(thread.id, thread);
}

pub(crate) fn owner_get(id: ThreadId) -> Option<Arc<Thread>> {
	OWNER.lock().get(&id).cloned()
}

pub(crate) fn owner_remove(id: ThreadId) -> Option<Arc<Thread>> {
	OWNER.lock().remove(&id)
}

pub(crate) fn owner_thread_count() -> usize {
	OWNER.lock().len()
}

pub(crate) fn next_thread_id() -> ThreadId {
	static TID_COUNTER: AtomicU32 = AtomicU32::new(0);
	let guard = OWNER.lock();

	loop {
		let id = ThreadId::from(TID_COUNTER.fetch_add(1, Ordering::SeqCst));
		if !guard.contains_key(&id) {
			return id;
		}
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn quantum_derivation() {
		// Quantum counts down from 255 - priority.
		assert_eq!(quantum_for(0), 255);
		assert_eq!(quantum_for(128), 127);
		assert_eq!(quantum_for(254), 1);
		// The idle priority still gets a nonzero quantum.
		assert_eq!(quantum_for(255), 1);
	}

	#[test]
	fn flag_arithmetic() {
		let flags = AtomicU32::new(0);
		flags.fetch_or(
			(ThreadFlags::SLEEPING | ThreadFlags::WOKE_BY_TIMER).bits(),
			Ordering::SeqCst,
		);
		flags.fetch_and(!ThreadFlags::SLEEPING.bits(), Ordering::SeqCst);

		let left = ThreadFlags::from_bits_truncate(flags.load(Ordering::SeqCst));
		assert_eq!(left, ThreadFlags::WOKE_BY_TIMER);
	}
}
