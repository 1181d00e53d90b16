//! MQTT transport for the job queue

pub mod client;
pub mod topics;
