//! IRQ routing policy (§4.4): binds hardware IRQ lines, with their
//! polarity/trigger attributes, to dispatch-table entries and programs the
//! interrupt controller(s) that own them.

pub mod controller;
pub mod routing;
pub mod tuple;

pub use controller::{ControllerInfo, IoApicController, LocalController};
pub use routing::Router;
pub use tuple::{IrqTuple, Polarity, Trigger};
