use alloc::collections::VecDeque;

use hermit_sync::InterruptTicketMutex;

use crate::arch::kernel::processor;
use crate::scheduler;
use crate::scheduler::task::ThreadHandle;

struct SemaphoreState {
	/// Resource count; may start negative.
	count: isize,
	/// Threads pending on the count, in arrival order.
	queue: VecDeque<ThreadHandle>,
}

/// A counting, blocking semaphore.
///
/// Acquisition succeeds only while the counter is positive; waiters park
/// in a FIFO pend queue and are woken one per release.
pub struct Semaphore {
	state: InterruptTicketMutex<SemaphoreState>,
}

impl Semaphore {
	/// Create a semaphore holding `count` resources.
	pub const fn new(count: isize) -> Self {
		Self {
			state: InterruptTicketMutex::new(SemaphoreState {
				count,
				queue: VecDeque::new(),
			}),
		}
	}

	/// Acquire one resource, blocking up to `timeout_ms` milliseconds
	/// (or indefinitely). Returns whether the resource was acquired.
	pub fn acquire(&self, timeout_ms: Option<u64>) -> bool {
		let deadline = timeout_ms.map(|ms| processor::get_timer_ticks() + ms * 1000);
		let handle = scheduler::current_thread_handle();

		loop {
			let mut state = self.state.lock();

			if state.count > 0 {
				state.count -= 1;
				return true;
			}

			if let Some(deadline) = deadline
				&& processor::get_timer_ticks() >= deadline
			{
				// Timed out: leave the pend queue atomically.
				state.queue.retain(|pending| pending.id != handle.id);
				return false;
			}

			if !state.queue.contains(&handle) {
				state.queue.push_back(handle);
			}
			let timer = scheduler::block_current(deadline);
			drop(state);

			scheduler::reschedule();

			// Awake again: a release may have woken us before the wake
			// timer fired; disarm it so it cannot hit a later wait.
			scheduler::finish_timed_block(timer);
		}
	}

	/// Acquire without blocking.
	pub fn try_acquire(&self) -> bool {
		let mut state = self.state.lock();
		if state.count > 0 {
			state.count -= 1;
			true
		} else {
			false
		}
	}

	/// Release one resource and wake the head of the pend queue.
	///
	/// Releasing without a waiter simply increments the count.
	pub fn release(&self) {
		let woken = {
			let mut state = self.state.lock();
			state.count += 1;
			state.queue.pop_front()
		};

		if let Some(handle) = woken {
			scheduler::wake_by_handle(handle);
		}
	}
}

// The pend queue is fully guarded by the state lock.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}
