use log::{Level, LevelFilter, Metadata, Record};

/// Forwards kernel log records to the console, prefixed with the core id.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			println!(
				"[{}][{}] {}",
				crate::arch::core_local::core_id(),
				level_tag(record.level()),
				record.args()
			);
		}
	}

	fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
	match level {
		Level::Error => "ERROR",
		Level::Warn => "WARNING",
		Level::Info => "INFO",
		Level::Debug => "DEBUG",
		Level::Trace => "TRACE",
	}
}

pub(crate) fn init() {
	log::set_logger(&LOGGER).expect("logging is already initialized");
	log::set_max_level(max_level());
}

fn max_level() -> LevelFilter {
	match crate::env::log_level() {
		Some("error") => LevelFilter::Error,
		Some("warn") => LevelFilter::Warn,
		Some("debug") => LevelFilter::Debug,
		Some("trace") => LevelFilter::Trace,
		_ => LevelFilter::Info,
	}
}
