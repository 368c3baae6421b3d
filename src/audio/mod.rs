//! audio - Queued PCM playback with hard-interrupt semantics
//!
//! The engine owns one dedicated playback thread. Output goes through the
//! `OutputDevice` seam: a simulated device by default, ALSA with the `alsa`
//! feature.

#[cfg(feature = "alsa")]
mod alsa_device;
mod chunk;
mod device;
mod engine;

#[cfg(feature = "alsa")]
pub use alsa_device::AlsaFactory;
pub use chunk::{AudioChunk, resample_linear, upmix};
pub use device::{DeviceConfig, DeviceFactory, NullDeviceFactory, NullStats, OutputDevice};
pub use engine::{AudioPlaybackEngine, EngineConfig, EngineEvent, EngineStatus};

use std::sync::Arc;

/// Factory for the build's default output backend.
pub fn default_factory() -> Arc<dyn DeviceFactory> {
    #[cfg(feature = "alsa")]
    {
        Arc::new(AlsaFactory)
    }
    #[cfg(not(feature = "alsa"))]
    {
        log::warn!("Built without the `alsa` feature; audio output is simulated");
        Arc::new(NullDeviceFactory::new(true))
    }
}
