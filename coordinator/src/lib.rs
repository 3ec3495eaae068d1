//! Coordinator for synchronized multi-device capture.
//!
//! Owns the device roster, conductor role, session identity and capture
//! naming, and serves the realtime channel plus the object upload endpoint.

pub mod coordinator;
pub mod server;
pub mod storage;
