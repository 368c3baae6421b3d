//! The playback engine: a bounded chunk queue drained by one dedicated
//! `std::thread` worker, with hard-interrupt and buffer-lock semantics.
//!
//! Uses std::thread (NOT tokio tasks) for device I/O because device writes
//! block. The queue is the only state shared with the async side.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc};

use super::chunk::AudioChunk;
use super::device::{DeviceConfig, DeviceFactory, OutputDevice};
use crate::error::{EngineError, RejectReason, Rejected};
use crate::session::{InterruptSignal, SessionId};

/// Playback engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Preferred output device
    pub device: DeviceConfig,
    /// Tried once when the preferred device fails to open
    pub fallback_device: DeviceConfig,
    /// Maximum number of queued, not yet played chunks
    pub queue_capacity: usize,
    /// How long `interrupt(true)` waits for the device to stop before giving up
    pub interrupt_hard_cap: Duration,
    /// Cool-down after an interrupt during which new chunks are rejected
    pub buffer_lock: Duration,
    /// Upper bound for letting a finished response play out
    pub drain_timeout: Duration,
    /// How long `start()` waits for the worker to open the device
    pub start_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            fallback_device: DeviceConfig {
                name: "plughw:0,0".to_string(),
                sample_rate: 48000,
                channels: 2,
                period_size: 0,
            },
            queue_capacity: 512,
            interrupt_hard_cap: Duration::from_millis(100),
            buffer_lock: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Stopped,
    Running,
    /// The worker died; `start()` must be called again.
    Failed,
}

impl EngineStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EngineStatus::Running,
            2 => EngineStatus::Failed,
            _ => EngineStatus::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineStatus::Stopped => 0,
            EngineStatus::Running => 1,
            EngineStatus::Failed => 2,
        }
    }
}

/// Pushed to whoever owns the engine when the worker degrades.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Failed(EngineError),
}

struct Queued {
    chunk: AudioChunk,
    signal: InterruptSignal,
}

struct PlaybackBuffer {
    chunks: VecDeque<Queued>,
    session: Option<SessionId>,
    signal: InterruptSignal,
    locked_until: Option<Instant>,
    stop_requested: bool,
    stops_honored: u64,
    shutdown: bool,
}

struct Shared {
    buffer: Mutex<PlaybackBuffer>,
    /// Worker waits here for chunks, stop requests or shutdown.
    wakeup: Condvar,
    /// `interrupt(true)` waits here for the worker to stop the device.
    stopped: Condvar,
    status: AtomicU8,
    playing: AtomicBool,
    idle: Notify,
    /// Signalled whenever the queue shrinks or the engine stops.
    space: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlaybackBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: EngineStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        let buf = self.lock();
        buf.chunks.is_empty() && !self.playing.load(Ordering::SeqCst)
    }
}

pub struct AudioPlaybackEngine {
    config: EngineConfig,
    factory: Arc<dyn DeviceFactory>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl AudioPlaybackEngine {
    pub fn new(config: EngineConfig, factory: Arc<dyn DeviceFactory>) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(PlaybackBuffer {
                chunks: VecDeque::with_capacity(config.queue_capacity.min(1024)),
                session: None,
                signal: InterruptSignal::new(),
                locked_until: None,
                stop_requested: false,
                stops_honored: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            stopped: Condvar::new(),
            status: AtomicU8::new(EngineStatus::Stopped.as_u8()),
            playing: AtomicBool::new(false),
            idle: Notify::new(),
            space: Notify::new(),
        });
        Self {
            config,
            factory,
            shared,
            worker: Mutex::new(None),
            events: None,
        }
    }

    /// Report worker failures on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status()
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().chunks.len()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    pub fn bound_session(&self) -> Option<SessionId> {
        self.shared.lock().session
    }

    /// Spin up the playback worker. Idempotent while the worker is alive; after
    /// a failure it replaces the dead worker with a fresh one.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.status() == EngineStatus::Running
            && worker.as_ref().is_some_and(|h| !h.is_finished())
        {
            return Ok(());
        }
        if let Some(old) = worker.take() {
            let _ = old.join();
        }
        {
            let mut buf = self.shared.lock();
            buf.shutdown = false;
            buf.stop_requested = false;
        }

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let shared = self.shared.clone();
        let factory = self.factory.clone();
        let config = self.config.clone();
        let events = self.events.clone();

        let handle = thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                let mut device = match open_with_fallback(factory.as_ref(), &config) {
                    Ok(device) => device,
                    Err(e) => {
                        shared.set_status(EngineStatus::Failed);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                shared.set_status(EngineStatus::Running);
                let _ = ready_tx.send(Ok(()));

                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| run_worker(&shared, device.as_mut())));
                let failure = match outcome {
                    Ok(Ok(())) => {
                        log::info!("Playback worker stopped");
                        None
                    }
                    Ok(Err(e)) => {
                        log::error!("Playback worker error: {}", e);
                        Some(e)
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        log::error!("Playback worker panicked: {}", msg);
                        Some(EngineError::WorkerPanicked(msg))
                    }
                };

                shared.playing.store(false, Ordering::SeqCst);
                shared.set_status(if failure.is_some() {
                    EngineStatus::Failed
                } else {
                    EngineStatus::Stopped
                });
                {
                    // Release anyone waiting in interrupt(true).
                    let mut buf = shared.lock();
                    buf.stop_requested = false;
                    buf.stops_honored += 1;
                }
                shared.stopped.notify_all();
                shared.idle.notify_waiters();
                shared.space.notify_waiters();

                if let (Some(e), Some(tx)) = (failure, events.as_ref()) {
                    let _ = tx.send(EngineEvent::Failed(e));
                }
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        *worker = Some(handle);

        match ready_rx.recv_timeout(self.config.start_timeout) {
            Ok(Ok(())) => {
                log::info!("Playback engine started");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::StartTimeout(self.config.start_timeout)),
        }
    }

    /// Bind the engine to a new session. Leftovers from any previous session
    /// are discarded and the post-interrupt lock is lifted, since session
    /// tagging now filters stale audio.
    pub fn bind_session(&self, session: SessionId, signal: InterruptSignal) {
        let mut buf = self.shared.lock();
        if !buf.chunks.is_empty() {
            log::debug!(
                "Dropping {} chunks left over before session {}",
                buf.chunks.len(),
                session
            );
            buf.chunks.clear();
        }
        buf.session = Some(session);
        buf.signal = signal;
        buf.locked_until = None;
        drop(buf);
        self.shared.space.notify_waiters();
    }

    /// Queue a chunk that is not tied to any session (local cues, tests).
    pub fn enqueue(&self, chunk: AudioChunk) -> Result<(), Rejected> {
        self.push(None, chunk)
    }

    /// Queue a chunk produced for `session`; rejected if the engine has moved on.
    pub fn enqueue_tagged(&self, session: SessionId, chunk: AudioChunk) -> Result<(), Rejected> {
        self.push(Some(session), chunk)
    }

    /// Like `enqueue_tagged`, but waits for room instead of rejecting a full
    /// queue. Returns early when the session is interrupted, the buffer is
    /// locked or no worker is left to make room.
    pub async fn enqueue_wait(&self, session: SessionId, chunk: AudioChunk) -> Result<(), Rejected> {
        let mut chunk = chunk;
        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_push(Some(session), chunk) {
                Ok(()) => return Ok(()),
                Err((rejected, back)) if rejected.reason == RejectReason::QueueFull => {
                    if self.shared.status() != EngineStatus::Running {
                        return Err(rejected);
                    }
                    chunk = back;
                }
                Err((rejected, _)) => return Err(rejected),
            }
            space.await;
        }
    }

    fn push(&self, session: Option<SessionId>, chunk: AudioChunk) -> Result<(), Rejected> {
        self.try_push(session, chunk).map_err(|(rejected, _)| {
            if rejected.reason == RejectReason::QueueFull {
                log::warn!(
                    "Playback queue full ({} chunks), dropping chunk",
                    self.config.queue_capacity
                );
            }
            rejected
        })
    }

    /// Hands the chunk back on rejection so a waiting caller can retry it.
    fn try_push(
        &self,
        session: Option<SessionId>,
        chunk: AudioChunk,
    ) -> Result<(), (Rejected, AudioChunk)> {
        let mut buf = self.shared.lock();
        if let Some(until) = buf.locked_until {
            if Instant::now() < until {
                log::debug!("Buffer locked, dropping {} samples", chunk.len());
                return Err((Rejected::new(RejectReason::Locked), chunk));
            }
            buf.locked_until = None;
        }
        if let Some(id) = session {
            if buf.session != Some(id) {
                log::debug!("Dropping chunk for stale session {}", id);
                return Err((Rejected::new(RejectReason::StaleSession), chunk));
            }
        }
        if buf.signal.is_set() {
            return Err((Rejected::new(RejectReason::StaleSession), chunk));
        }
        if buf.chunks.len() >= self.config.queue_capacity {
            return Err((Rejected::new(RejectReason::QueueFull), chunk));
        }
        let signal = buf.signal.clone();
        buf.chunks.push_back(Queued { chunk, signal });
        drop(buf);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Stop playback: set the signal, clear the queue, optionally stop the
    /// device (bounded by `interrupt_hard_cap`), then arm the buffer lock.
    /// Returns the wall-clock time spent.
    pub fn interrupt(&self, immediate: bool) -> Duration {
        let started = Instant::now();
        let cap = self.config.interrupt_hard_cap;

        let mut buf = self.shared.lock();
        buf.signal.set();
        let dropped = buf.chunks.len();
        buf.chunks.clear();
        buf.session = None;
        buf.signal = InterruptSignal::new();

        if immediate && self.shared.status() == EngineStatus::Running {
            let target = buf.stops_honored + 1;
            buf.stop_requested = true;
            self.shared.wakeup.notify_all();
            let (guard, waited) = self
                .shared
                .stopped
                .wait_timeout_while(buf, cap, |b| b.stops_honored < target && !b.shutdown)
                .unwrap_or_else(|e| e.into_inner());
            buf = guard;
            if waited.timed_out() {
                log::warn!(
                    "Output device did not stop within {:?}, proceeding anyway",
                    cap
                );
            }
        }

        buf.locked_until = Some(Instant::now() + self.config.buffer_lock);
        drop(buf);
        self.shared.idle.notify_waiters();
        self.shared.space.notify_waiters();

        let elapsed = started.elapsed();
        log::info!(
            "Playback interrupted (immediate={}): dropped {} queued chunks in {:?}",
            immediate,
            dropped,
            elapsed
        );
        elapsed
    }

    /// Wait until everything queued has been played, or `timeout` elapses.
    /// Returns `true` if the engine went idle. Returns early with `false` if
    /// audio is queued but no worker is running to play it.
    pub async fn drain_or_timeout(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_idle() {
                return true;
            }
            if self.shared.status() != EngineStatus::Running {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.is_idle();
            }
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&self) {
        {
            let mut buf = self.shared.lock();
            buf.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        self.shared.stopped.notify_all();
        self.shared.space.notify_waiters();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            let _ = h.join();
        }
        if self.shared.status() == EngineStatus::Running {
            self.shared.set_status(EngineStatus::Stopped);
        }
    }
}

impl Drop for AudioPlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ======================== Playback worker ========================

fn open_with_fallback(
    factory: &dyn DeviceFactory,
    config: &EngineConfig,
) -> Result<Box<dyn OutputDevice>, EngineError> {
    match factory.open(&config.device) {
        Ok(device) => Ok(device),
        Err(e) => {
            log::warn!(
                "Failed to open '{}': {}. Retrying with fallback '{}'",
                config.device.name,
                e,
                config.fallback_device.name
            );
            factory.open(&config.fallback_device).inspect_err(|e2| {
                log::error!("Fallback device failed too: {}", e2);
            })
        }
    }
}

enum Step {
    Play(Queued),
    Stop,
    Shutdown,
}

fn next_step(shared: &Shared) -> Step {
    let mut buf = shared.lock();
    loop {
        if buf.shutdown {
            return Step::Shutdown;
        }
        if buf.stop_requested {
            buf.stop_requested = false;
            return Step::Stop;
        }
        if let Some(entry) = buf.chunks.pop_front() {
            shared.playing.store(true, Ordering::SeqCst);
            shared.space.notify_waiters();
            return Step::Play(entry);
        }
        shared.idle.notify_waiters();
        buf = shared.wakeup.wait(buf).unwrap_or_else(|e| e.into_inner());
    }
}

fn run_worker(shared: &Shared, device: &mut dyn OutputDevice) -> Result<(), EngineError> {
    loop {
        match next_step(shared) {
            Step::Shutdown => return Ok(()),
            Step::Stop => {
                if let Err(e) = device.stop() {
                    log::warn!("Failed to stop output device: {}", e);
                }
                shared.lock().stops_honored += 1;
                shared.stopped.notify_all();
                shared.idle.notify_waiters();
            }
            Step::Play(entry) => {
                // Between chunks: anything queued under an interrupted signal is stale.
                let result = if entry.signal.is_set() {
                    log::trace!("Skipping chunk from interrupted session");
                    Ok(())
                } else {
                    play_chunk(device, &entry.chunk)
                };
                shared.playing.store(false, Ordering::SeqCst);
                result?;
            }
        }
    }
}

/// Write one chunk, retrying once after a device recovery.
fn play_chunk(device: &mut dyn OutputDevice, chunk: &AudioChunk) -> Result<(), EngineError> {
    match device.write(chunk) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!("Output write failed ({}), recovering and retrying once", e);
            device.recover()?;
            device.write(chunk)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
