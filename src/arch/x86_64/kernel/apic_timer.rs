//! Per-CPU local APIC timer.

use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::SpinMutex;

use super::apic::{
	IA32_X2APIC_CUR_COUNT, IA32_X2APIC_DIV_CONF, IA32_X2APIC_INIT_COUNT, timer_lvt_write,
	timer_register_read, timer_register_write,
};
use super::interrupts::LOCAL_TIMER_VECTOR;
use super::pit;
use crate::drivers::timer::{TickHandler, TimeSpec, TimerDevice, TimerError};

const APIC_LVT_MASK: u64 = 1 << 16;
const APIC_LVT_TIMER_PERIODIC: u64 = 1 << 17;
/// Divide configuration 0b0010: divide by 8.
const APIC_DIV_CONF_DIVIDE_BY_8: u64 = 0b0010;

/// One local timer per CPU; the instance lives in that CPU's device entry.
pub struct ApicTimer {
	/// Counter decrements per millisecond at the configured divider.
	counts_per_ms: AtomicU64,
	period_ms: u64,
	handler: SpinMutex<Option<(TickHandler, usize)>>,
}

impl ApicTimer {
	pub const fn new(period_ms: u64) -> Self {
		Self {
			counts_per_ms: AtomicU64::new(0),
			period_ms,
			handler: SpinMutex::new(None),
		}
	}

	/// Calibrate the local timer against a 1 ms one-shot of the 8254.
	///
	/// Returns `false` if the counter did not move, i.e. the CPU has no
	/// usable local timer and the unit must run tickless.
	pub fn calibrate(&self) -> bool {
		timer_register_write(IA32_X2APIC_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_8);
		timer_lvt_write(APIC_LVT_MASK);
		timer_register_write(IA32_X2APIC_INIT_COUNT, u64::from(u32::MAX));

		pit::wait_ms(1);

		let remaining = u64::from(timer_register_read(IA32_X2APIC_CUR_COUNT));
		timer_register_write(IA32_X2APIC_INIT_COUNT, 0);

		let counts = u64::from(u32::MAX) - remaining;
		if counts == 0 {
			return false;
		}

		debug!("Local timer calibrated to {counts} counts per ms");
		self.counts_per_ms.store(counts, Ordering::Relaxed);
		true
	}

	/// Invoked from the local-timer vector.
	pub(crate) fn tick(&self) {
		if let Some((handler, ctx)) = *self.handler.lock() {
			let step = TimeSpec::from_ms(self.period_ms);
			let reserved = handler(ctx, &step);
			debug_assert_eq!(reserved, 0);
		}
	}
}

impl TimerDevice for ApicTimer {
	fn enable(&self) {
		let counts = self.counts_per_ms.load(Ordering::Relaxed);
		assert!(counts > 0, "local timer was not calibrated");

		timer_register_write(IA32_X2APIC_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_8);
		timer_lvt_write(APIC_LVT_TIMER_PERIODIC | u64::from(LOCAL_TIMER_VECTOR));
		timer_register_write(IA32_X2APIC_INIT_COUNT, counts * self.period_ms);
	}

	fn disable(&self) {
		timer_lvt_write(APIC_LVT_MASK);
		timer_register_write(IA32_X2APIC_INIT_COUNT, 0);
	}

	fn reset(&self) {
		let counts = self.counts_per_ms.load(Ordering::Relaxed);
		timer_register_write(IA32_X2APIC_INIT_COUNT, counts * self.period_ms);
	}

	fn set_handler(&self, handler: TickHandler, ctx: usize) -> Result<(), TimerError> {
		*self.handler.lock() = Some((handler, ctx));
		Ok(())
	}

	fn get_handler(&self) -> Option<(TickHandler, usize)> {
		*self.handler.lock()
	}

	fn resolution(&self) -> Result<TimeSpec, TimerError> {
		Ok(TimeSpec::from_ms(self.period_ms))
	}
}
