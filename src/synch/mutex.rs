use alloc::collections::VecDeque;

use hermit_sync::InterruptTicketMutex;
use thiserror::Error;

use crate::arch::kernel::processor;
use crate::scheduler;
use crate::scheduler::task::{ThreadId, ThreadHandle};

/// How the pend queue is drained on release.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutexOrder {
	/// Strict arrival order.
	Fifo,
	/// Highest priority first; arrival order among equals.
	Priority,
}

/// How long an acquisition may block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutexWait {
	NoWait,
	Forever,
	Millis(u64),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MutexError {
	#[error("the mutex could not be acquired in time")]
	Timeout,
	#[error("only the owning thread may release a mutex")]
	NotOwner,
}

struct MutexState {
	owner: Option<ThreadId>,
	/// Recursive acquisitions by the owner. Zero marks a fresh hand-off
	/// the woken thread has not picked up yet.
	recursion: usize,
	queue: VecDeque<ThreadHandle>,
}

/// Owner-tracked, recursion-capable mutex.
///
/// Release hands the mutex directly to the chosen waiter, so a late
/// arrival can never barge past the pend queue.
pub struct Mutex {
	state: InterruptTicketMutex<MutexState>,
	order: MutexOrder,
}

/// Pick the next owner from the pend queue.
fn select_next(queue: &VecDeque<ThreadHandle>, order: MutexOrder) -> Option<usize> {
	match order {
		MutexOrder::Fifo => (!queue.is_empty()).then_some(0),
		MutexOrder::Priority => {
			// Numerically lowest priority value ranks highest; the scan
			// is front-to-back, so equals keep their arrival order.
			let mut best: Option<(usize, u8)> = None;
			for (index, pending) in queue.iter().enumerate() {
				if best.is_none_or(|(_, prio)| pending.prio < prio) {
					best = Some((index, pending.prio));
				}
			}
			best.map(|(index, _)| index)
		}
	}
}

impl Mutex {
	pub const fn new(order: MutexOrder) -> Self {
		Self {
			state: InterruptTicketMutex::new(MutexState {
				owner: None,
				recursion: 0,
				queue: VecDeque::new(),
			}),
			order,
		}
	}

	pub fn acquire(&self, wait: MutexWait) -> Result<(), MutexError> {
		let deadline = match wait {
			MutexWait::Millis(ms) => Some(processor::get_timer_ticks() + ms * 1000),
			_ => None,
		};
		let handle = scheduler::current_thread_handle();

		loop {
			let mut state = self.state.lock();

			match state.owner {
				None => {
					state.owner = Some(handle.id);
					state.recursion = 1;
					return Ok(());
				}
				Some(owner) if owner == handle.id => {
					if state.recursion == 0 {
						// The release path handed the mutex to us.
						state.recursion = 1;
					} else {
						state.recursion += 1;
					}
					return Ok(());
				}
				Some(_) => {}
			}

			match wait {
				MutexWait::NoWait => return Err(MutexError::Timeout),
				MutexWait::Millis(_)
					if processor::get_timer_ticks() >= deadline.unwrap() =>
				{
					// A timed wake counts as failure; leave the queue in
					// the same critical section.
					state.queue.retain(|pending| pending.id != handle.id);
					return Err(MutexError::Timeout);
				}
				_ => {}
			}

			if !state.queue.contains(&handle) {
				state.queue.push_back(handle);
			}
			let timer = scheduler::block_current(deadline);
			drop(state);

			scheduler::reschedule();

			// Awake again: a hand-off may have beaten the wake timer;
			// disarm it so it cannot hit a later wait.
			scheduler::finish_timed_block(timer);
		}
	}

	pub fn try_acquire(&self) -> bool {
		self.acquire(MutexWait::NoWait).is_ok()
	}

	/// Release one level of ownership; the innermost release hands the
	/// mutex to the next pending thread.
	pub fn release(&self) -> Result<(), MutexError> {
		let handle = scheduler::current_thread_handle();
		let woken = {
			let mut state = self.state.lock();

			if state.owner != Some(handle.id) {
				return Err(MutexError::NotOwner);
			}

			state.recursion -= 1;
			if state.recursion > 0 {
				return Ok(());
			}

			match select_next(&state.queue, self.order) {
				Some(index) => {
					let next = state.queue.remove(index).unwrap();
					state.owner = Some(next.id);
					// recursion stays 0 until the waiter picks it up.
					Some(next)
				}
				None => {
					state.owner = None;
					None
				}
			}
		};

		if let Some(next) = woken {
			scheduler::wake_by_handle(next);
		}
		Ok(())
	}

	pub fn owner(&self) -> Option<ThreadId> {
		self.state.lock().owner
	}
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	fn handle(id: u32, prio: u8) -> ThreadHandle {
		ThreadHandle {
			id: ThreadId::from(id),
			prio,
			core_id: 0,
		}
	}

	#[test]
	fn fifo_selection_preserves_arrival_order() {
		let mut queue = VecDeque::new();
		queue.push_back(handle(1, 200));
		queue.push_back(handle(2, 10));
		queue.push_back(handle(3, 100));

		// FIFO ignores priority entirely.
		assert_eq!(select_next(&queue, MutexOrder::Fifo), Some(0));

		queue.pop_front();
		assert_eq!(select_next(&queue, MutexOrder::Fifo), Some(0));
		assert_eq!(queue[0].id, ThreadId::from(2));
	}

	#[test]
	fn priority_selection_picks_best_and_keeps_fifo_among_equals() {
		let mut queue = VecDeque::new();
		queue.push_back(handle(1, 100));
		queue.push_back(handle(2, 10));
		queue.push_back(handle(3, 10));

		let index = select_next(&queue, MutexOrder::Priority).unwrap();
		assert_eq!(queue[index].id, ThreadId::from(2));

		queue.remove(index);
		let index = select_next(&queue, MutexOrder::Priority).unwrap();
		assert_eq!(queue[index].id, ThreadId::from(3));
	}

	#[test]
	fn empty_queue_selects_nothing() {
		let queue = VecDeque::new();
		assert_eq!(select_next(&queue, MutexOrder::Fifo), None);
		assert_eq!(select_next(&queue, MutexOrder::Priority), None);
	}
}
