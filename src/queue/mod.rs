//! Per-queue job production.

mod producer;

pub use producer::{Producer, ProducerOptions};
