//! Per-CPU synchronization primitives (§4.1 of the core spec).
//!
//! Three building blocks, leaves-first: [`spinlock`] (a single-word
//! CAS lock plus its interrupt-safe composition), [`rwlock`] (a
//! phase-fair reader/writer spinlock), and [`irq_guard`] (the
//! `intr_lock`/`intr_unlock` interrupt-mask guard the other two compose
//! with whenever they may be reached from interrupt context).

pub mod irq_guard;
pub mod rwlock;
pub mod spinlock;

pub use irq_guard::IrqGuard;
pub use rwlock::RwSpinLock;
pub use spinlock::{Spinlock, SpinlockIrqSave};
