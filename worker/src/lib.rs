//! deployd library
//!
//! Core modules for the queue-driven deployment worker.

pub mod app;
pub mod commands;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod mqtt;
pub mod queue;
pub mod storage;
pub mod utils;
pub mod workers;
