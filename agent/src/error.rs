//! Errors surfaced by the capture path of a device agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// No segment has been finalized yet (buffer underrun).
    #[error("not ready yet")]
    NotReady,
    /// A capture is already in flight on this device.
    #[error("busy")]
    Busy,
    #[error("timed out waiting for the marked segment")]
    Timeout,
    /// The wait was abandoned (disconnect or reset).
    #[error("capture cancelled")]
    Cancelled,
    /// The buffer restarted before the marked segment was finalized.
    #[error("rolling buffer restarted before the marked segment was finalized")]
    Restarted,
    #[error("capture device error: {0:#}")]
    Source(anyhow::Error),
    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),
}
