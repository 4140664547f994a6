use thiserror::Error;

/// Local capture failures. Fatal to joining: surfaced to the user, no retry.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device is busy")]
    Busy,
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("no such capture device")]
    NoDevice,
    #[error("capture failed: {0}")]
    Failed(String),
}

/// Loss or unavailability of the relay channel. Tears down every session at
/// once; retry is the outer connection loop's decision, never per-session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error("relay connection lost: {0}")]
    Lost(String),
}
