pub mod agent;
pub mod buffer;
pub mod client;
pub mod console;
pub mod error;
pub mod source;
pub mod upload;
