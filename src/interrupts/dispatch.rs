//! Interrupt dispatch: one fixed-size vector table, ordered handler chains
//! per vector (§4.3).
//!
//! This is the single entry point an architectural stub calls once it has
//! saved CPU state. It never allocates and never blocks beyond the routing
//! table's reader/writer lock.

use alloc::vec::Vec;

use crate::irq::controller::LocalController;
use crate::sync::{IrqGuard, RwSpinLock};

use super::vector::{Vector, VectorLayout};

/// The CPU's interrupt descriptor table has exactly 256 entries; the
/// dispatch table always has one chain slot per entry regardless of how a
/// platform's [`VectorLayout`] subdivides that space.
const VECTOR_COUNT: usize = 256;

/// A saved-state record: the vector that fired plus the architectural
/// register snapshot a stub captured before calling in.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedState {
	pub vector: Vector,
	pub error_code: Option<u64>,
	pub instruction_pointer: u64,
	pub code_segment: u64,
	pub cpu_flags: u64,
	pub stack_pointer: u64,
	pub stack_segment: u64,
}

/// A registered interrupt handler. Plain function pointers rather than
/// boxed closures: `unregister` identifies a handler by pointer equality
/// (§4.4 "unlink the first node whose handler pointer matches"), which is
/// exactly what `fn` values already give us for free.
pub type HandlerFn = fn(&SavedState);

/// Per-vector ordered handler chains plus the local controller used to
/// acknowledge (EOI) non-fault, non-spurious vectors.
///
/// Generic over [`LocalController`] so production code links the real Local
/// APIC and tests link a call-counting mock (§10.1, §10.4).
pub struct Dispatcher<C: LocalController> {
	controller: C,
	layout: VectorLayout,
	chains: RwSpinLock<[Vec<HandlerFn>; VECTOR_COUNT]>,
}

impl<C: LocalController> Dispatcher<C> {
	pub fn new(controller: C, layout: VectorLayout) -> Self {
		Self {
			controller,
			layout,
			chains: RwSpinLock::new(core::array::from_fn(|_| Vec::new())),
		}
	}

	/// Pushes `handler` onto `vector`'s chain under the combined
	/// interrupt-mask + write lock. LIFO: the most recently registered
	/// handler is the first one `dispatch` invokes.
	pub fn register(&self, vector: Vector, handler: HandlerFn) -> bool {
		let _guard = IrqGuard::new();
		let mut chains = self.chains.write();
		let chain = &mut chains[vector.as_usize()];
		if chain.try_reserve(1).is_err() {
			return false;
		}
		chain.push(handler);
		true
	}

	/// Removes the first (by chain order) node whose handler pointer
	/// matches. No-op if absent (§4.4).
	pub fn unregister(&self, vector: Vector, handler: HandlerFn) {
		let _guard = IrqGuard::new();
		let mut chains = self.chains.write();
		let chain = &mut chains[vector.as_usize()];
		if let Some(index) = chain.iter().position(|h| *h == handler) {
			chain.remove(index);
		}
	}

	/// Runs the acknowledgement policy and then the handler chain for
	/// `state.vector` (§4.3).
	///
	/// # Panics
	///
	/// Panics with the vector number if the chain is empty -- an unhandled
	/// vector is treated as a programming error, never a recoverable
	/// runtime event.
	pub fn dispatch(&self, state: &SavedState) {
		if self.layout.should_ack(state.vector) {
			self.controller.ack();
		}

		let chains = self.chains.read();
		let chain = &chains[state.vector.as_usize()];
		assert!(
			!chain.is_empty(),
			"kernel: unhandled interrupt vector {}",
			state.vector.0
		);
		for handler in chain.iter().rev() {
			handler(state);
		}
	}
}
