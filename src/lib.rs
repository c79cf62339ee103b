//! Low-level execution substrate for a freestanding x86-64 SMP kernel.
//!
//! This crate owns three tightly coupled subsystems: interrupt dispatch
//! (`interrupts`), the page-granular kernel heap (`mm`), and the per-CPU
//! synchronization primitives (`sync`) both of the above are built on. The
//! fourth module, `irq`, is the policy layer that binds hardware IRQ lines to
//! dispatch-table entries and programs the discovered interrupt
//! controller(s).
//!
//! Everything this crate needs from the surrounding kernel — the physical
//! frame allocator, the virtual mapper, and the interrupt controller
//! hardware — arrives through narrow traits (see `mm::pmm`, `mm::vmm`,
//! `irq::controller`). The embedding kernel supplies real implementations;
//! the test suite in each module supplies hosted mocks.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod interrupts;
pub mod irq;
pub mod logging;
pub mod mm;
pub mod sync;

pub use interrupts::dispatch::Dispatcher;
pub use interrupts::vector::{Vector, VectorLayout};
pub use irq::routing::Router;
pub use mm::heap::Heap;
