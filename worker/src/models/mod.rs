//! Data models

pub mod application;
pub mod job;
