use core::fmt;

use hermit_sync::InterruptTicketMutex;

pub(crate) struct Console(());

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		#[cfg(target_os = "none")]
		crate::arch::kernel::output_message_buf(s.as_bytes());
		#[cfg(not(target_os = "none"))]
		std::print!("{s}");
		Ok(())
	}
}

static CONSOLE: InterruptTicketMutex<Console> = InterruptTicketMutex::new(Console(()));

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use fmt::Write;
	CONSOLE.lock().write_fmt(args).unwrap();
}
