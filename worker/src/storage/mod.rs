//! Persistent state: layout, settings and applications

pub mod applications;
pub mod layout;
pub mod settings;
