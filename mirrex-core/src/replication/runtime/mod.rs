//! In-process runtime pieces backing the event capability.

pub mod event_bus;

pub use event_bus::{EventStream, InProcEventBus, ProgressBatcher};
