//! Long-running workers

pub mod consumer;
