//! Timer-device abstraction consumed by the scheduler.

use thiserror::Error;

/// Elapsed time reported to a tick handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TimeSpec {
	pub seconds: u64,
	pub nanosec: u64,
}

impl TimeSpec {
	pub const fn from_ms(ms: u64) -> Self {
		Self {
			seconds: ms / 1000,
			nanosec: (ms % 1000) * 1_000_000,
		}
	}

	pub const fn as_ns(&self) -> u64 {
		self.seconds * 1_000_000_000 + self.nanosec
	}
}

/// Tick callback. Runs in interrupt context with interrupts disabled.
///
/// The return value is reserved and must be `0` in this revision.
pub type TickHandler = fn(ctx: usize, step: &TimeSpec) -> u32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimerError {
	#[error("device has no resolution information")]
	NoResolution,
	#[error("device does not support tick handlers")]
	NoHandlerSupport,
}

/// Operations every tick-capable timer device provides.
pub trait TimerDevice: Send + Sync {
	fn enable(&self);
	fn disable(&self);
	/// Restart the current period from zero.
	fn reset(&self);
	fn set_handler(&self, handler: TickHandler, ctx: usize) -> Result<(), TimerError>;
	fn get_handler(&self) -> Option<(TickHandler, usize)>;
	/// The period between two ticks.
	fn resolution(&self) -> Result<TimeSpec, TimerError>;
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn timespec_conversions() {
		let one_ms = TimeSpec::from_ms(1);
		assert_eq!(one_ms.seconds, 0);
		assert_eq!(one_ms.nanosec, 1_000_000);
		assert_eq!(one_ms.as_ns(), 1_000_000);

		let long = TimeSpec::from_ms(2500);
		assert_eq!(long.seconds, 2);
		assert_eq!(long.nanosec, 500_000_000);
	}
}
