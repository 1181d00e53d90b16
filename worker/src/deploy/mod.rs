//! Deployment module

pub mod dispatcher;
pub mod fsm;
pub mod remote;
pub mod trust;
pub mod webhook;
