use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::session::InterruptSignal;

/// Interrupt signals of the sessions currently producing, keyed by hardware id.
#[derive(Debug, Default)]
pub struct InterruptRegistry {
    active: Mutex<HashMap<String, InterruptSignal>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InterruptSignal>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session for `hardware_id` and return its fresh signal.
    /// An older session still producing for the same device is interrupted.
    pub fn begin(&self, hardware_id: &str) -> InterruptSignal {
        let signal = InterruptSignal::new();
        if let Some(old) = self.lock().insert(hardware_id.to_string(), signal.clone()) {
            if old.set() {
                log::info!("New session for {} supersedes the running one", hardware_id);
            }
        }
        signal
    }

    /// Returns `true` if a running session was interrupted by this call.
    /// Interrupting an idle or already-interrupted device is a no-op.
    pub fn interrupt(&self, hardware_id: &str) -> bool {
        match self.lock().get(hardware_id) {
            Some(signal) => signal.set(),
            None => false,
        }
    }

    /// Drop the entry, unless a newer session has replaced it meanwhile.
    pub fn finish(&self, hardware_id: &str, signal: &InterruptSignal) {
        let mut active = self.lock();
        if active.get(hardware_id).is_some_and(|s| s.same_as(signal)) {
            active.remove(hardware_id);
        }
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_sets_only_that_device() {
        let registry = InterruptRegistry::new();
        let a = registry.begin("a");
        let b = registry.begin("b");
        assert!(registry.interrupt("a"));
        assert!(a.is_set());
        assert!(!b.is_set());
    }

    #[test]
    fn test_repeated_and_unknown_interrupts_are_noops() {
        let registry = InterruptRegistry::new();
        assert!(!registry.interrupt("nobody"));
        let s = registry.begin("hw");
        assert!(registry.interrupt("hw"));
        assert!(!registry.interrupt("hw"));
        registry.finish("hw", &s);
        assert!(!registry.interrupt("hw"));
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_new_session_supersedes_old() {
        let registry = InterruptRegistry::new();
        let old = registry.begin("hw");
        let new = registry.begin("hw");
        assert!(old.is_set());
        assert!(!new.is_set());

        // The old connection finishing must not unregister the new one.
        registry.finish("hw", &old);
        assert_eq!(registry.active(), 1);
        assert!(registry.interrupt("hw"));
        assert!(new.is_set());
    }
}
