//! Background task plumbing: bus consumers and process lifecycle.

pub mod consumer;
pub mod lifecycle;

pub use consumer::EventConsumer;
pub use lifecycle::{Application, NamedTask};
