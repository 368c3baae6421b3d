//! Session identity and the per-session interrupt token.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, monotonically increasing session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out session ids derived from wall-clock milliseconds, bumped by one
/// whenever two sessions start in the same millisecond (or the clock steps back).
#[derive(Debug, Default)]
pub struct SessionIdGen {
    last: u64,
}

impl SessionIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> SessionId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last = now.max(self.last + 1);
        SessionId(self.last)
    }
}

/// Returned by [`InterruptSignal::check`] once the session has been interrupted.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("session interrupted")]
pub struct Interrupted;

/// One-shot interrupt flag for a single session.
///
/// Setting it is lock-free and safe from any thread. Once set it stays set;
/// the next session gets a fresh signal instead of reusing this one.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal(Arc<AtomicBool>);

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call is the one that flipped the flag.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Yield-point check: `Err(Interrupted)` once the flag is set.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_set() { Err(Interrupted) } else { Ok(()) }
    }

    pub fn same_as(&self, other: &InterruptSignal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Session lifecycle states, also the payload of every UI notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Sleeping,
    Listening,
    Processing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Sleeping => "sleeping",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One listen → process → respond episode. Owned by the state machine; other
/// components only ever see its id and a clone of its signal.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub hardware_id: String,
    pub state: SessionState,
    pub created_at: Instant,
    pub signal: InterruptSignal,
}

impl Session {
    pub fn new(id: SessionId, hardware_id: impl Into<String>) -> Self {
        Self {
            id,
            hardware_id: hardware_id.into(),
            state: SessionState::Listening,
            created_at: Instant::now(),
            signal: InterruptSignal::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_strictly_increase() {
        let mut ids = SessionIdGen::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_signal_is_terminal_and_shared() {
        let signal = InterruptSignal::new();
        let reader = signal.clone();
        assert!(reader.check().is_ok());

        assert!(signal.set());
        assert!(!signal.set(), "second set reports already-set");
        assert_eq!(reader.check(), Err(Interrupted));
        assert!(reader.same_as(&signal));
    }

    #[test]
    fn test_new_session_gets_fresh_signal() {
        let mut ids = SessionIdGen::new();
        let old = Session::new(ids.next_id(), "hw");
        old.signal.set();
        let fresh = Session::new(ids.next_id(), "hw");
        assert!(!fresh.signal.is_set());
        assert!(!fresh.signal.same_as(&old.signal));
    }
}
