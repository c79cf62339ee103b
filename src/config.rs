//! Boot-time constants that are not worth threading through every call site.
//!
//! Geometry that genuinely varies between platform profiles (vector-space
//! layout, heap bounds) lives in `VectorLayout`/`HeapConfig` instead, see
//! `interrupts::vector` and `mm::heap`.

/// Size of one physical page / heap frame.
pub const FRAME_SIZE: usize = 0x1000;

/// Smallest extra slack (in frames) that makes a split worthwhile.
///
/// `mm::heap` only splits a node if at least this many frames would remain
/// free after carving out the requested allocation and a new header.
pub const MIN_SPLIT_FRAMES: usize = 2;

/// Default production vector-space layout for this platform.
///
/// Test code typically builds its own `VectorLayout` to match a scenario's
/// numbers instead of using this one.
pub const DEFAULT_VECTOR_LAYOUT: crate::interrupts::vector::VectorLayout =
	crate::interrupts::vector::VectorLayout {
		fault_end: 32,
		irq0: 32,
		irqs: 223,
		spurious: 255,
	};
