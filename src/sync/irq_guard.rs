//! Interrupt-mask guard: `intr_lock`/`intr_unlock` as an RAII pair.
//!
//! Disabling interrupts is the only way a spinlock acquired from handler
//! context avoids deadlocking against itself on the same CPU (§4.1, §9 of
//! the core spec). `nested_disable`/`nested_enable` track whether interrupts
//! were already off so that nested critical sections compose: only the
//! outermost `intr_unlock` actually re-enables delivery.

#[cfg(all(target_arch = "x86_64", not(test)))]
mod arch {
	pub fn are_enabled() -> bool {
		x86_64::instructions::interrupts::are_enabled()
	}

	pub fn disable() {
		x86_64::instructions::interrupts::disable();
	}

	pub fn enable() {
		x86_64::instructions::interrupts::enable();
	}
}

/// Hosted stand-in for the architectural interrupt flag, used by tests that
/// run on the host CPU instead of under a freestanding target.
#[cfg(any(not(target_arch = "x86_64"), test))]
mod arch {
	use core::sync::atomic::{AtomicBool, Ordering};

	static ENABLED: AtomicBool = AtomicBool::new(true);

	pub fn are_enabled() -> bool {
		ENABLED.load(Ordering::Relaxed)
	}

	pub fn disable() {
		ENABLED.store(false, Ordering::Relaxed);
	}

	pub fn enable() {
		ENABLED.store(true, Ordering::Relaxed);
	}
}

/// Reports whether local interrupt delivery is currently enabled.
#[inline]
pub fn are_enabled() -> bool {
	arch::are_enabled()
}

/// Disables local interrupt delivery and returns whether it was previously
/// enabled, so the caller can restore it with [`nested_enable`].
#[inline]
pub fn nested_disable() -> bool {
	let was_enabled = arch::are_enabled();
	arch::disable();
	was_enabled
}

/// Restores local interrupt delivery to the state captured by a matching
/// [`nested_disable`]. Only actually re-enables interrupts if `was_enabled`
/// is true, so inner/nested sections don't prematurely turn them back on.
#[inline]
pub fn nested_enable(was_enabled: bool) {
	if was_enabled {
		arch::enable();
	}
}

/// RAII interrupt-mask guard. Disables interrupts on construction, restores
/// the prior state on drop. Pairs nest correctly because each guard captures
/// its own prior state independently.
#[must_use = "the interrupt mask is restored when this guard is dropped"]
pub struct IrqGuard {
	was_enabled: bool,
}

impl IrqGuard {
	/// `intr_lock`: disables local interrupt delivery.
	#[inline]
	pub fn new() -> Self {
		Self {
			was_enabled: nested_disable(),
		}
	}
}

impl Default for IrqGuard {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for IrqGuard {
	/// `intr_unlock`: restores the state captured at construction.
	#[inline]
	fn drop(&mut self) {
		nested_enable(self.was_enabled);
	}
}
