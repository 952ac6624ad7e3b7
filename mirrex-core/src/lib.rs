//! Core library for the Mirrex replication service.
//!
//! The crate implements the durable file queue, the per-bucket schedulers
//! that claim and dispatch work, the hash-verified copy workers, and the
//! in-process event bus that external surfaces (control plane, dashboard,
//! scanner) observe. Everything durable goes through [`replication::QueueStore`];
//! everything observable goes through [`replication::EventPublisher`].
#![allow(missing_docs)]

pub mod error;
pub mod hash;
pub mod replication;

pub use error::{CoreError, Result};
