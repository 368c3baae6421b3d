//! Output device seam used by the playback worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use super::chunk::AudioChunk;
use crate::error::EngineError;

/// Requested output configuration. The backend may negotiate different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Backend device name (e.g. "default", "plughw:0,0")
    pub name: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames (0 = let the backend decide)
    pub period_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            sample_rate: 24000,
            channels: 1,
            period_size: 1024,
        }
    }
}

/// A blocking audio sink owned by the playback worker thread.
///
/// `write` is not preemptible: it returns once the whole chunk has been handed
/// to the device.
pub trait OutputDevice: Send {
    fn write(&mut self, chunk: &AudioChunk) -> Result<(), EngineError>;

    /// Discard anything the device still has buffered.
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Bring the device back after a failed write.
    fn recover(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

pub trait DeviceFactory: Send + Sync {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn OutputDevice>, EngineError>;
}

/// Counters shared between a [`NullDeviceFactory`] and the devices it opens.
#[derive(Debug, Default)]
pub struct NullStats {
    pub opened: AtomicUsize,
    pub chunks_written: AtomicUsize,
    pub samples_written: AtomicUsize,
    pub stops: AtomicUsize,
}

impl NullStats {
    pub fn chunks(&self) -> usize {
        self.chunks_written.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Device without hardware behind it. With `realtime` set, each write blocks
/// for the chunk's playback duration, like a real sink would.
#[derive(Debug, Clone)]
pub struct NullDeviceFactory {
    realtime: bool,
    stats: Arc<NullStats>,
}

impl NullDeviceFactory {
    pub fn new(realtime: bool) -> Self {
        Self {
            realtime,
            stats: Arc::new(NullStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<NullStats> {
        self.stats.clone()
    }
}

impl DeviceFactory for NullDeviceFactory {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn OutputDevice>, EngineError> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "Null output opened: device={}, rate={}, realtime={}",
            config.name,
            config.sample_rate,
            self.realtime
        );
        Ok(Box::new(NullDevice {
            realtime: self.realtime,
            stats: self.stats.clone(),
        }))
    }
}

struct NullDevice {
    realtime: bool,
    stats: Arc<NullStats>,
}

impl OutputDevice for NullDevice {
    fn write(&mut self, chunk: &AudioChunk) -> Result<(), EngineError> {
        if self.realtime {
            thread::sleep(chunk.duration());
        }
        self.stats.chunks_written.fetch_add(1, Ordering::SeqCst);
        self.stats
            .samples_written
            .fetch_add(chunk.len(), Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
