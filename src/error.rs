//! Error taxonomy shared by the client, the playback engine and the server.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Audio output failures. Cloneable so the worker thread can report the same
/// error to `start()` and to the engine event channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to open output device '{device}': {reason}")]
    DeviceOpen { device: String, reason: String },
    #[error("output device write failed: {0}")]
    DeviceWrite(String),
    #[error("output device recovery failed: {0}")]
    DeviceRecover(String),
    #[error("failed to spawn playback worker: {0}")]
    Spawn(String),
    #[error("playback worker did not report readiness within {0:?}")]
    StartTimeout(Duration),
    #[error("playback worker crashed: {0}")]
    WorkerPanicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Inside the cool-down window that follows an interrupt.
    Locked,
    QueueFull,
    /// Tagged with a session the engine is no longer bound to.
    StaleSession,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Locked => "locked",
            RejectReason::QueueFull => "queue full",
            RejectReason::StaleSession => "stale session",
        };
        f.write_str(s)
    }
}

/// A chunk the engine refused. The chunk itself is dropped.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("chunk rejected: {reason}")]
pub struct Rejected {
    pub reason: RejectReason,
}

impl Rejected {
    pub fn new(reason: RejectReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown unit discriminant: {0:#04x}")]
    UnknownDiscriminant(u8),
    #[error("unsupported audio frame version {0}")]
    UnsupportedVersion(u8),
    #[error("PCM payload of {0} bytes is not a whole number of 16-bit samples")]
    OddPcmLength(usize),
    #[error("{kind} unit out of order: got seq {got}, expected at least {expected}")]
    OutOfOrder {
        kind: &'static str,
        expected: u32,
        got: u32,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("session exceeded total timeout of {0:?}")]
    TotalTimeout(Duration),
    #[error("no unit received for {0:?}")]
    UnitStale(Duration),
    #[error("stream unusable after {0} consecutive malformed units")]
    Unusable(usize),
}

/// Failures from the text/speech backend on the server side.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
}
