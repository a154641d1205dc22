//! Command handlers

pub mod config;
pub mod queue;
pub mod send;
pub mod status;
pub mod watch;
