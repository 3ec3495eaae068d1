//! Shared types for the syncam coordinator and device agents.

pub mod config;
pub mod discovery;
pub mod naming;
pub mod protocol;
