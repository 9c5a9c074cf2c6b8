//! A small multiprocessor x86-64 kernel core.
//!
//! The crate brings every logical processor up from firmware-provided
//! records, owns physical and virtual memory through three interlocking
//! managers, dispatches interrupts and inter-processor signals, and runs
//! a preemptive per-CPU scheduler over kernel threads.

#![no_std]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]
#![allow(clippy::missing_safety_doc)]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

#[macro_use]
mod macros;

pub mod arch;
mod config;
pub mod console;
pub mod devmgr;
pub mod drivers;
pub mod env;
mod logging;
pub mod mm;
#[cfg(target_os = "none")]
mod runtime_glue;
pub mod scheduler;
pub mod synch;

pub use console::_print;

/// Entry point for the boot processor.
///
/// The boot shim has switched to long mode on `BOOT_PAGING`, installed
/// the firmware records via [`env::set_boot_tables`], and provides a
/// stack. `init` becomes the first kernel thread once all cores are up.
#[cfg(target_os = "none")]
pub fn boot_processor_main(init: extern "C" fn(usize), arg: usize) -> ! {
	arch::kernel::message_output_init();
	logging::init();

	info!("Welcome to Argon {}", env!("CARGO_PKG_VERSION"));

	arch::kernel::boot_processor_init();
	mm::init();
	arch::kernel::boot_processor_init_late();

	arch::kernel::processor::print_information();
	mm::print_information();

	scheduler::add_current_core(boot_timer_device());

	#[cfg(feature = "smp")]
	match arch::kernel::smp_boot::boot_application_processors() {
		Ok(count) => info!("{count} CPUs are online"),
		Err(err) => warn!("Bring-up stopped early: {err}"),
	}

	arch::kernel::print_information();

	scheduler::spawn(
		init,
		arg,
		crate::config::DEFAULT_STACK_SIZE,
		scheduler::task::NORMAL_PRIO,
		u64::MAX,
	)
	.expect("cannot start the init thread");

	scheduler::run_idle_loop()
}

/// The tick source the calling core registered during bring-up.
#[cfg(target_os = "none")]
fn boot_timer_device() -> Option<alloc::sync::Arc<devmgr::Device>> {
	let core_id = arch::core_local::core_id();
	devmgr::dev_get_by_name("apic-timer", core_id).or_else(|| devmgr::dev_get_by_name("pit", core_id))
}
