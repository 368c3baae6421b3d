//! evdev key listener running on its own OS thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use evdev::{Device, InputEventKind, Key};
use tokio::sync::mpsc;

use super::{Intent, KeyConfig, KeyIntentDetector};

/// Find all keyboard devices on the system
pub fn find_keyboards() -> Vec<(PathBuf, Device)> {
    evdev::enumerate()
        .filter(|(_, device)| {
            // A keyboard should support common keys
            device.supported_keys().is_some_and(|keys| {
                keys.contains(Key::KEY_ENTER)
                    && keys.contains(Key::KEY_SPACE)
                    && keys.contains(Key::KEY_A)
                    && keys.contains(Key::KEY_Z)
            })
        })
        .collect()
}

pub struct KeyListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyListener {
    /// Open the first keyboard that has the push-to-talk key and start a
    /// `key-listener` thread feeding intents into `tx`.
    pub fn spawn(config: KeyConfig, tx: mpsc::Sender<Intent>) -> Result<Self> {
        let key = Key::new(config.key_code);
        let mut keyboards = find_keyboards();
        if keyboards.is_empty() {
            bail!(
                "No keyboard devices readable. Ensure you are in the 'input' group:\n\
                 sudo usermod -aG input $USER"
            );
        }
        let index = keyboards
            .iter()
            .position(|(_, d)| d.supported_keys().is_some_and(|keys| keys.contains(key)))
            .context("No keyboard supports the configured push-to-talk key")?;
        let (path, device) = keyboards.swap_remove(index);
        log::info!(
            "Listening for key {:?} on {:?} ({})",
            key,
            path,
            device.name().unwrap_or("Unknown")
        );

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("key-listener".into())
                .spawn(move || listen(device, key, config, tx, &running))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Ask the thread to stop after its next event batch. The thread is
    /// detached because the device read cannot be interrupted.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle.take();
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(
    mut device: Device,
    key: Key,
    config: KeyConfig,
    tx: mpsc::Sender<Intent>,
    running: &AtomicBool,
) {
    let mut detector = KeyIntentDetector::new(config);
    while running.load(Ordering::Relaxed) {
        let events = match device.fetch_events() {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Keyboard read error (disconnected?): {}", e);
                break;
            }
        };
        for ev in events {
            match ev.kind() {
                InputEventKind::Key(k) if k == key => {}
                _ => continue,
            }
            let now = Instant::now();
            // 0 = released, 1 = pressed, 2 = autorepeat
            let intent = match ev.value() {
                1 | 2 => detector.on_key_down(now),
                0 => detector.on_key_up(now),
                _ => None,
            };
            if let Some(intent) = intent {
                log::debug!("Key intent: {}", intent.name());
                if tx.blocking_send(intent).is_err() {
                    log::info!("Intent receiver dropped, key listener exiting");
                    return;
                }
            }
        }
    }
    log::info!("Key listener stopped");
}
