//! Runqueue policies.
//!
//! A policy decides which thread an execution unit runs next. The basic
//! policy keeps two FIFOs per unit (ready and sleeping); the idle policy
//! never offers a thread, leaving the unit on its idle loop.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::scheduler::CoreId;
use crate::scheduler::task::{Thread, ThreadFlags};

pub(crate) trait SchedPolicy: Send {
	fn name(&self) -> &'static str;

	/// Take custody of a thread that stopped running.
	fn enqueue(&mut self, thread: Arc<Thread>);

	/// Offer the next thread to run. `wake_pending` signals that
	/// sleeping threads were woken and must be reconsidered.
	fn dequeue(&mut self, core_id: CoreId, wake_pending: bool) -> Option<Arc<Thread>>;

	/// Account one tick against the running thread.
	fn tick(&mut self, current: Option<&Thread>);
}

/// Two FIFOs: ready and sleeping. Woken threads migrate from the sleep
/// queue on the next dequeue.
#[derive(Default)]
pub(crate) struct BasicPolicy {
	ready_q: VecDeque<Arc<Thread>>,
	sleep_q: VecDeque<Arc<Thread>>,
}

impl BasicPolicy {
	pub fn new() -> Self {
		Self::default()
	}
}

impl SchedPolicy for BasicPolicy {
	fn name(&self) -> &'static str {
		"basic"
	}

	fn enqueue(&mut self, thread: Arc<Thread>) {
		let flags = thread.flags();
		if flags.contains(ThreadFlags::SLEEPING) {
			self.sleep_q.push_back(thread);
		} else {
			self.ready_q.push_back(thread);
		}
	}

	fn dequeue(&mut self, core_id: CoreId, wake_pending: bool) -> Option<Arc<Thread>> {
		if wake_pending {
			// Move everything that is no longer sleeping over.
			let mut remaining = VecDeque::with_capacity(self.sleep_q.len());
			while let Some(thread) = self.sleep_q.pop_front() {
				if thread.flags().contains(ThreadFlags::SLEEPING) {
					remaining.push_back(thread);
				} else {
					self.ready_q.push_back(thread);
				}
			}
			self.sleep_q = remaining;
		}

		// First thread whose affinity admits this core; the others keep
		// their order and wait for their own unit (or the rebalancer).
		let position = self
			.ready_q
			.iter()
			.position(|thread| thread.may_run_on(core_id))?;
		self.ready_q.remove(position)
	}

	fn tick(&mut self, current: Option<&Thread>) {
		if let Some(thread) = current {
			let left = thread.cpu_left.load(core::sync::atomic::Ordering::Relaxed);
			if left > 0 {
				thread
					.cpu_left
					.store(left - 1, core::sync::atomic::Ordering::Relaxed);
			}
		}
	}
}

/// Keeps the unit on its idle thread, whatever happens.
#[derive(Default)]
pub(crate) struct IdlePolicy {
	parked: VecDeque<Arc<Thread>>,
}

impl SchedPolicy for IdlePolicy {
	fn name(&self) -> &'static str {
		"idle"
	}

	fn enqueue(&mut self, thread: Arc<Thread>) {
		// Threads landing here stay parked until the policy is swapped.
		self.parked.push_back(thread);
	}

	fn dequeue(&mut self, _core_id: CoreId, _wake_pending: bool) -> Option<Arc<Thread>> {
		None
	}

	fn tick(&mut self, _current: Option<&Thread>) {}
}

/// The policy an execution unit starts with.
pub(crate) fn default_policy() -> Box<dyn SchedPolicy> {
	Box::new(BasicPolicy::new())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use core::sync::atomic::Ordering;
	use std::vec::Vec;

	use memory_addresses::{PhysAddr, VirtAddr};

	use super::*;
	use crate::scheduler::task::{ThreadId, quantum_for};

	fn thread(id: u32, affinity: u64) -> Arc<Thread> {
		// The boot-stack constructor needs no address space.
		let thread = Thread::new_idle(
			ThreadId::from(id),
			0,
			VirtAddr::new(0x1000),
			PhysAddr::zero(),
		);
		thread.clear_flags(ThreadFlags::RUNNING);
		thread.set_flags(ThreadFlags::READY);
		thread.affinity.store(affinity, Ordering::Relaxed);
		Arc::new(thread)
	}

	#[test]
	fn ready_queue_is_fifo() {
		let mut policy = BasicPolicy::new();
		policy.enqueue(thread(1, u64::MAX));
		policy.enqueue(thread(2, u64::MAX));
		policy.enqueue(thread(3, u64::MAX));

		let order: Vec<u32> = core::iter::from_fn(|| policy.dequeue(0, false))
			.map(|t| t.id.into())
			.collect();
		assert_eq!(order, [1, 2, 3]);
	}

	#[test]
	fn sleeping_threads_wait_for_the_wake_signal() {
		let mut policy = BasicPolicy::new();

		let sleeper = thread(1, u64::MAX);
		sleeper.clear_flags(ThreadFlags::READY);
		sleeper.set_flags(ThreadFlags::SLEEPING);
		policy.enqueue(sleeper.clone());

		// Not runnable while sleeping, even with the signal.
		assert!(policy.dequeue(0, true).is_none());

		// Woken: migrates to the ready queue on the next dequeue.
		sleeper.clear_flags(ThreadFlags::SLEEPING);
		sleeper.set_flags(ThreadFlags::READY);
		assert!(policy.dequeue(0, false).is_none());
		let woken = policy.dequeue(0, true).unwrap();
		assert_eq!(woken.id, ThreadId::from(1));
	}

	#[test]
	fn affinity_is_honored() {
		let mut policy = BasicPolicy::new();
		policy.enqueue(thread(1, 0b10)); // core 1 only
		policy.enqueue(thread(2, 0b01)); // core 0 only

		// Core 0 must skip the first thread without losing it.
		let picked = policy.dequeue(0, false).unwrap();
		assert_eq!(picked.id, ThreadId::from(2));

		let other = policy.dequeue(1, false).unwrap();
		assert_eq!(other.id, ThreadId::from(1));
	}

	#[test]
	fn tick_counts_down_to_zero() {
		let policy_thread = thread(1, u64::MAX);
		let mut policy = BasicPolicy::new();

		let start = policy_thread.cpu_left.load(Ordering::Relaxed);
		assert_eq!(start, quantum_for(255));

		policy.tick(Some(&policy_thread));
		policy.tick(Some(&policy_thread));
		// Saturates at zero instead of wrapping.
		policy.tick(Some(&policy_thread));
		assert_eq!(policy_thread.cpu_left.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn idle_policy_never_offers_work() {
		let mut policy = IdlePolicy::default();
		policy.enqueue(thread(1, u64::MAX));
		assert!(policy.dequeue(0, true).is_none());
	}
}
