//! Interrupt-service dispatch core.
//!
//! Every vector owns a chain of handlers, walked in install-reverse order
//! until one claims the interrupt. A separate end-of-interrupt chain runs
//! after each dispatch; its handlers are the only place the interrupt
//! controller is acknowledged.

use alloc::vec::Vec;

use hermit_sync::InterruptTicketMutex;

pub const MAX_VECTORS: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IsrStatus {
	Handled,
	NotHandled,
}

/// Snapshot of the interrupted context passed to every handler.
#[derive(Clone, Copy, Debug)]
pub struct IsrInfo {
	pub vector: u8,
	pub error_code: Option<u64>,
	pub instruction_pointer: u64,
	pub cpu_flags: u64,
}

pub type IsrHandler = fn(cookie: usize, info: &IsrInfo) -> IsrStatus;

#[derive(Clone, Copy)]
struct IsrEntry {
	handler: IsrHandler,
	cookie: usize,
}

struct IsrTable {
	chains: [Vec<IsrEntry>; MAX_VECTORS],
	eoi_chain: Vec<IsrEntry>,
}

static ISR_TABLE: InterruptTicketMutex<IsrTable> = InterruptTicketMutex::new(IsrTable {
	chains: [const { Vec::new() }; MAX_VECTORS],
	eoi_chain: Vec::new(),
});

/// Add a handler to a vector chain, or to the end-of-interrupt chain.
///
/// The most recently installed handler runs first.
pub fn install(handler: IsrHandler, cookie: usize, vector: u8, eoi: bool) {
	let mut table = ISR_TABLE.lock();
	let entry = IsrEntry { handler, cookie };

	if eoi {
		table.eoi_chain.push(entry);
	} else {
		table.chains[usize::from(vector)].push(entry);
	}
}

pub fn uninstall(handler: IsrHandler, cookie: usize, eoi: bool) {
	let mut table = ISR_TABLE.lock();
	let matches = |entry: &IsrEntry| entry.handler == handler && entry.cookie == cookie;

	if eoi {
		table.eoi_chain.retain(|entry| !matches(entry));
	} else {
		for chain in &mut table.chains {
			chain.retain(|entry| !matches(entry));
		}
	}
}

/// Walk the vector chain, then the end-of-interrupt chain.
///
/// Called from the vector stubs with interrupts disabled.
pub fn dispatch(info: &IsrInfo) -> IsrStatus {
	let table = ISR_TABLE.lock();
	let mut status = IsrStatus::NotHandled;

	for entry in table.chains[usize::from(info.vector)].iter().rev() {
		if (entry.handler)(entry.cookie, info) == IsrStatus::Handled {
			status = IsrStatus::Handled;
			break;
		}
	}

	for entry in table.eoi_chain.iter().rev() {
		if (entry.handler)(entry.cookie, info) == IsrStatus::Handled {
			break;
		}
	}

	status
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	static ORDER: AtomicUsize = AtomicUsize::new(0);
	static FIRST_SEEN: AtomicUsize = AtomicUsize::new(usize::MAX);
	static EOI_RUNS: AtomicUsize = AtomicUsize::new(0);

	fn claiming(cookie: usize, _info: &IsrInfo) -> IsrStatus {
		FIRST_SEEN
			.compare_exchange(usize::MAX, cookie, Ordering::SeqCst, Ordering::SeqCst)
			.ok();
		ORDER.fetch_add(1, Ordering::SeqCst);
		IsrStatus::Handled
	}

	fn declining(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
		ORDER.fetch_add(1, Ordering::SeqCst);
		IsrStatus::NotHandled
	}

	fn eoi_ack(_cookie: usize, _info: &IsrInfo) -> IsrStatus {
		EOI_RUNS.fetch_add(1, Ordering::SeqCst);
		IsrStatus::Handled
	}

	fn info(vector: u8) -> IsrInfo {
		IsrInfo {
			vector,
			error_code: None,
			instruction_pointer: 0,
			cpu_flags: 0,
		}
	}

	#[test]
	fn chain_runs_in_install_reverse_order_and_stops() {
		install(claiming, 1, 77, false);
		install(claiming, 2, 77, false);
		install(eoi_ack, 0, 0, true);

		let status = dispatch(&info(77));

		assert_eq!(status, IsrStatus::Handled);
		// The later install (cookie 2) claimed the interrupt first and the
		// chain stopped there.
		assert_eq!(FIRST_SEEN.load(Ordering::SeqCst), 2);
		assert_eq!(ORDER.load(Ordering::SeqCst), 1);
		assert_eq!(EOI_RUNS.load(Ordering::SeqCst), 1);

		uninstall(claiming, 1, false);
		uninstall(claiming, 2, false);
		uninstall(eoi_ack, 0, true);
	}

	#[test]
	fn unclaimed_vector_still_reaches_eoi_chain() {
		install(declining, 9, 99, false);
		install(eoi_ack, 1, 0, true);
		let before = EOI_RUNS.load(Ordering::SeqCst);

		let status = dispatch(&info(99));

		assert_eq!(status, IsrStatus::NotHandled);
		assert_eq!(EOI_RUNS.load(Ordering::SeqCst), before + 1);

		uninstall(declining, 9, false);
		uninstall(eoi_ack, 1, true);
	}
}
