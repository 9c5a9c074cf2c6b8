//! 8254 programmable interval timer.
//!
//! Serves two roles: the reference device for calibrating the local APIC
//! timers, and the periodic fallback tick source on machines whose CPUs
//! expose no usable local timer.

use hermit_sync::SpinMutex;
use x86_64::instructions::port::Port;

use crate::drivers::timer::{TickHandler, TimeSpec, TimerDevice, TimerError};

const PIT_CHANNEL0_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;

const PIT_FREQUENCY_HZ: u64 = 1_193_182;

/// Channel 0, lobyte/hibyte access, mode 0 (interrupt on terminal count).
const PIT_ONESHOT_COMMAND: u8 = 0b0011_0000;
/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const PIT_PERIODIC_COMMAND: u8 = 0b0011_0100;
/// Latch the counter of channel 0.
const PIT_LATCH_COMMAND: u8 = 0b0000_0000;

pub const PIT_IRQ_LINE: u8 = 0;

fn reload_value_for_ms(ms: u64) -> u16 {
	let ticks = (PIT_FREQUENCY_HZ * ms) / 1000;
	ticks.clamp(1, u64::from(u16::MAX)) as u16
}

fn program(command: u8, reload: u16) {
	unsafe {
		Port::<u8>::new(PIT_COMMAND_PORT).write(command);
		let mut channel0 = Port::<u8>::new(PIT_CHANNEL0_PORT);
		channel0.write((reload & 0xFF) as u8);
		channel0.write((reload >> 8) as u8);
	}
}

fn read_counter() -> u16 {
	unsafe {
		Port::<u8>::new(PIT_COMMAND_PORT).write(PIT_LATCH_COMMAND);
		let mut channel0 = Port::<u8>::new(PIT_CHANNEL0_PORT);
		let low = u16::from(channel0.read());
		let high = u16::from(channel0.read());
		(high << 8) | low
	}
}

/// Arm a one-shot countdown without enabling the interrupt line.
///
/// The caller observes completion by polling [`oneshot_expired`]; this is
/// the calibration window used by the local timers.
pub fn start_oneshot_ms(ms: u64) {
	program(PIT_ONESHOT_COMMAND, reload_value_for_ms(ms));
}

pub fn oneshot_expired(armed_ms: u64) -> bool {
	// In mode 0 the counter wraps after the terminal count; treat any value
	// above the armed reload as expired.
	let armed = reload_value_for_ms(armed_ms);
	let current = read_counter();
	current == 0 || current > armed
}

/// Busy-wait on a one-shot window. Used before interrupts are available.
pub fn wait_ms(ms: u64) {
	start_oneshot_ms(ms);

	// The reload value latches on the next clock edge; ignore whatever
	// the counter still shows until then.
	let armed = reload_value_for_ms(ms);
	while read_counter() > armed {
		core::hint::spin_loop();
	}
	loop {
		let counter = read_counter();
		if counter == 0 || counter > armed {
			break;
		}
		core::hint::spin_loop();
	}
}

/// The periodic fallback tick device.
pub struct Pit {
	handler: SpinMutex<Option<(TickHandler, usize)>>,
	period_ms: u64,
}

impl Pit {
	pub const fn new(period_ms: u64) -> Self {
		Self {
			handler: SpinMutex::new(None),
			period_ms,
		}
	}

	pub(crate) fn tick(&self) {
		if let Some((handler, ctx)) = *self.handler.lock() {
			let step = TimeSpec::from_ms(self.period_ms);
			let reserved = handler(ctx, &step);
			debug_assert_eq!(reserved, 0);
		}
	}
}

impl TimerDevice for Pit {
	fn enable(&self) {
		program(PIT_PERIODIC_COMMAND, reload_value_for_ms(self.period_ms));
		super::pic::unmask(PIT_IRQ_LINE);
	}

	fn disable(&self) {
		super::pic::mask(PIT_IRQ_LINE);
	}

	fn reset(&self) {
		program(PIT_PERIODIC_COMMAND, reload_value_for_ms(self.period_ms));
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

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn reload_values() {
		assert_eq!(reload_value_for_ms(1), 1193);
		// Longer windows saturate at the 16-bit counter limit.
		assert_eq!(reload_value_for_ms(100), u16::MAX);
	}
}
