//! Interrupt vectors and the platform's vector-space layout (§3, §10.3).
//!
//! A [`Vector`] is the raw IDT index an architectural stub reports. What it
//! *means* -- fault, routed IRQ, or the spurious vector -- depends on the
//! platform's [`VectorLayout`], which is configuration rather than a
//! crate-wide constant so production boot code and the hosted test harness
//! can each supply their own numbers (§8 scenario 3 uses `IRQ0 = 0x20,
//! IRQS = 224`, not the production defaults in `config.rs`).

/// An index into the CPU's interrupt descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vector(pub u8);

impl Vector {
	#[inline]
	pub fn as_usize(self) -> usize {
		usize::from(self.0)
	}
}

impl From<u8> for Vector {
	fn from(value: u8) -> Self {
		Self(value)
	}
}

/// Which of the three disjoint vector ranges (§3) a vector falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorClass {
	/// Architectural fault, `[0, fault_end)`. Synchronous, never acknowledged.
	Fault,
	/// Routed IRQ band, `[irq0, irq0 + irqs)`.
	Irq,
	/// The single spurious vector.
	Spurious,
	/// Outside every known range. Still dispatched, still acknowledged.
	Unknown,
}

/// Boundaries of the three vector ranges for one platform profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorLayout {
	/// Length of the architectural fault prefix, `[0, fault_end)`.
	pub fault_end: usize,
	/// First vector of the IRQ band.
	pub irq0: usize,
	/// Width of the IRQ band.
	pub irqs: usize,
	/// The spurious vector.
	pub spurious: u8,
}

impl VectorLayout {
	/// Classifies `vector` against this layout.
	pub fn classify(&self, vector: Vector) -> VectorClass {
		let v = vector.as_usize();
		if v < self.fault_end {
			return VectorClass::Fault;
		}
		if vector.0 == self.spurious {
			return VectorClass::Spurious;
		}
		if v >= self.irq0 && v < self.irq0 + self.irqs {
			return VectorClass::Irq;
		}
		VectorClass::Unknown
	}

	/// Maps a hardware IRQ line to its vector: `(irq mod IRQS) + IRQ0` (§4.4).
	///
	/// Distinct lines can collide on the same vector when `irq >= IRQS`; the
	/// handler-chain mechanism is what lets more than one driver share a
	/// vector safely.
	pub fn vector_for_irq(&self, irq: usize) -> Vector {
		debug_assert!(self.irqs > 0, "IRQS must be non-zero");
		Vector(((irq % self.irqs) + self.irq0) as u8)
	}

	/// Acknowledgement policy (§4.3): faults and the spurious vector are
	/// never acknowledged, everything else is acknowledged immediately.
	pub fn should_ack(&self, vector: Vector) -> bool {
		!matches!(
			self.classify(vector),
			VectorClass::Fault | VectorClass::Spurious
		)
	}
}
