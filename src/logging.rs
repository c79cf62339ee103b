//! Kernel log sink plumbing.
//!
//! The TTY/log device is an external collaborator (a UART, a framebuffer
//! console, a hypervisor debug port) and this crate never drives one
//! directly. Instead it implements [`log::Log`] against an injectable
//! [`LogSink`], and the embedding kernel registers its concrete sink once at
//! boot via [`init`].

use core::fmt::Write as _;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::sync::spinlock::SpinlockIrqSave;

/// A destination for formatted log lines.
///
/// Implementations must not allocate and must be safe to call with
/// interrupts disabled, since the boot-fatal path (§7 of the core spec)
/// logs before panicking with the heap potentially uninitialized.
pub trait LogSink: Send {
	fn write_str(&mut self, s: &str);
}

static SINK: SpinlockIrqSave<Option<&'static mut dyn LogSink>> = SpinlockIrqSave::new(None);

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let style = level_style(record.level());
		let mut guard = SINK.lock();
		let Some(sink) = guard.as_deref_mut() else {
			return;
		};
		let _ = write!(
			sink,
			"{style}[{:>5}]{style:#} {}\n",
			record.level(),
			record.args()
		);
	}

	fn flush(&self) {}
}

fn level_style(level: Level) -> anstyle::Style {
	let color = match level {
		Level::Error => anstyle::AnsiColor::Red,
		Level::Warn => anstyle::AnsiColor::Yellow,
		Level::Info => anstyle::AnsiColor::Green,
		Level::Debug => anstyle::AnsiColor::Blue,
		Level::Trace => anstyle::AnsiColor::BrightBlack,
	};
	anstyle::Style::new().fg_color(Some(color.into()))
}

/// Installs `sink` as the destination for all subsequent log records and
/// sets the maximum level. Intended to be called once, early in boot.
pub fn init(sink: &'static mut dyn LogSink, max_level: LevelFilter) {
	*SINK.lock() = Some(sink);
	log::set_max_level(max_level);
	// `set_logger` fails only if called more than once; the core only ever
	// calls it from boot, so a repeated call is a programmer error.
	log::set_logger(&LOGGER).expect("logging::init called more than once");
}

impl core::fmt::Write for dyn LogSink + '_ {
	fn write_str(&mut self, s: &str) -> core::fmt::Result {
		LogSink::write_str(self, s);
		Ok(())
	}
}
