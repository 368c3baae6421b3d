//! Two-edge press detector: interrupt on key-down, decide on key-up.

use std::time::{Duration, Instant};

use super::Intent;

#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// evdev key code of the push-to-talk key (97 = right Ctrl)
    pub key_code: u16,
    /// Presses at least this long start a recording on release
    pub long_press_threshold: Duration,
    /// Key-downs this soon after a key-up are treated as switch chatter
    pub debounce: Duration,
    /// A recording still open after this long is cancelled
    pub max_recording: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_code: 97,
            long_press_threshold: Duration::from_millis(300),
            debounce: Duration::from_millis(30),
            max_recording: Duration::from_secs(120),
        }
    }
}

/// Turns key-down/key-up timestamps into intents. Knows nothing about audio
/// or the network, and takes `now` explicitly so it can be driven by tests.
#[derive(Debug)]
pub struct KeyIntentDetector {
    config: KeyConfig,
    pressed: bool,
    press_started_at: Option<Instant>,
    last_release_at: Option<Instant>,
}

impl KeyIntentDetector {
    pub fn new(config: KeyConfig) -> Self {
        Self {
            config,
            pressed: false,
            press_started_at: None,
            last_release_at: None,
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    /// Every fresh press interrupts whatever is going on, before the press
    /// length is known.
    pub fn on_key_down(&mut self, now: Instant) -> Option<Intent> {
        if self.pressed {
            // autorepeat
            return None;
        }
        if let Some(released) = self.last_release_at {
            let gap = now.saturating_duration_since(released);
            if gap < self.config.debounce {
                log::trace!("Key-down debounced ({:?} after release)", gap);
                return None;
            }
        }
        self.pressed = true;
        self.press_started_at = Some(now);
        Some(Intent::InterruptOrCancel)
    }

    /// A long press starts recording; a short press has already done its job
    /// (the interrupt on key-down).
    pub fn on_key_up(&mut self, now: Instant) -> Option<Intent> {
        if !self.pressed {
            return None;
        }
        self.pressed = false;
        self.last_release_at = Some(now);
        let started = self.press_started_at.take()?;
        let held = now.saturating_duration_since(started);
        if held >= self.config.long_press_threshold {
            log::debug!("Long press ({:?}), starting recording", held);
            Some(Intent::StartRecording)
        } else {
            log::debug!("Short press ({:?}), interrupt only", held);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> KeyIntentDetector {
        KeyIntentDetector::new(KeyConfig::default())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_short_press_only_interrupts() {
        let mut d = detector();
        let t0 = Instant::now();
        assert_eq!(d.on_key_down(t0), Some(Intent::InterruptOrCancel));
        assert_eq!(d.on_key_up(t0 + ms(200)), None);
        assert!(!d.is_pressed());
    }

    #[test]
    fn test_long_press_starts_recording_on_release() {
        let mut d = detector();
        let t0 = Instant::now();
        assert_eq!(d.on_key_down(t0), Some(Intent::InterruptOrCancel));
        assert_eq!(d.on_key_up(t0 + ms(600)), Some(Intent::StartRecording));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut d = detector();
        let t0 = Instant::now();
        d.on_key_down(t0);
        assert_eq!(d.on_key_up(t0 + ms(300)), Some(Intent::StartRecording));
    }

    #[test]
    fn test_repress_interrupts_exactly_once_before_next_recording() {
        let mut d = detector();
        let t0 = Instant::now();
        d.on_key_down(t0);
        assert_eq!(d.on_key_up(t0 + ms(600)), Some(Intent::StartRecording));

        let mut seen = Vec::new();
        seen.extend(d.on_key_down(t0 + ms(700)));
        // autorepeat while held
        seen.extend(d.on_key_down(t0 + ms(800)));
        seen.extend(d.on_key_down(t0 + ms(900)));
        seen.extend(d.on_key_up(t0 + ms(1400)));
        assert_eq!(seen, vec![Intent::InterruptOrCancel, Intent::StartRecording]);
    }

    #[test]
    fn test_chatter_after_release_is_ignored() {
        let mut d = detector();
        let t0 = Instant::now();
        d.on_key_down(t0);
        d.on_key_up(t0 + ms(100));
        assert_eq!(d.on_key_down(t0 + ms(110)), None);
        // the matching bounce release is ignored too
        assert_eq!(d.on_key_up(t0 + ms(115)), None);
        assert_eq!(d.on_key_down(t0 + ms(200)), Some(Intent::InterruptOrCancel));
    }

    #[test]
    fn test_release_without_press_is_ignored() {
        let mut d = detector();
        assert_eq!(d.on_key_up(Instant::now()), None);
    }
}
