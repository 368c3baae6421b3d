//! ALSA PCM playback backend.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::chunk::{AudioChunk, resample_linear, upmix};
use super::device::{DeviceConfig, DeviceFactory, OutputDevice};
use crate::error::EngineError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaFactory;

impl DeviceFactory for AlsaFactory {
    fn open(&self, config: &DeviceConfig) -> Result<Box<dyn OutputDevice>, EngineError> {
        let (pcm, params) = open_playback(config)?;
        Ok(Box::new(AlsaOutput {
            pcm,
            params,
            device: config.name.clone(),
        }))
    }
}

fn open_err(device: &str, e: alsa::Error) -> EngineError {
    EngineError::DeviceOpen {
        device: device.to_string(),
        reason: e.to_string(),
    }
}

/// Open a PCM device for playback.
fn open_playback(config: &DeviceConfig) -> Result<(PCM, AlsaParams), EngineError> {
    let device = config.name.as_str();
    let pcm = PCM::new(device, Direction::Playback, false).map_err(|e| open_err(device, e))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).map_err(|e| open_err(device, e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| open_err(device, e))?;
        hwp.set_format(Format::S16LE)
            .map_err(|e| open_err(device, e))?;
        hwp.set_channels(config.channels)
            .map_err(|e| open_err(device, e))?;
        hwp.set_rate_near(config.sample_rate, ValueOr::Nearest)
            .map_err(|e| open_err(device, e))?;
        if config.period_size > 0 {
            hwp.set_period_size_near(config.period_size as alsa::pcm::Frames, ValueOr::Nearest)
                .map_err(|e| open_err(device, e))?;
        }
        pcm.hw_params(&hwp).map_err(|e| open_err(device, e))?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current().map_err(|e| open_err(device, e))?;
        AlsaParams {
            sample_rate: hwp.get_rate().map_err(|e| open_err(device, e))?,
            channels: hwp.get_channels().map_err(|e| open_err(device, e))?,
            period_size: hwp.get_period_size().map_err(|e| open_err(device, e))? as usize,
        }
    };

    log::info!(
        "ALSA Playback: device={}, rate={}, channels={}, period_size={}",
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

struct AlsaOutput {
    pcm: PCM,
    params: AlsaParams,
    device: String,
}

impl OutputDevice for AlsaOutput {
    fn write(&mut self, chunk: &AudioChunk) -> Result<(), EngineError> {
        let mono = resample_linear(chunk.samples(), chunk.sample_rate(), self.params.sample_rate);
        let pcm_data = upmix(&mono, self.params.channels);
        let channels = self.params.channels.max(1) as usize;

        let io = self
            .pcm
            .io_i16()
            .map_err(|e| EngineError::DeviceWrite(e.to_string()))?;

        // Write with retry loop to handle short writes and XRUN recovery
        let total_frames = pcm_data.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&pcm_data[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error on {}: {}, recovering...", self.device, e);
                    retry_count += 1;
                    self.pcm
                        .prepare()
                        .map_err(|e2| EngineError::DeviceRecover(e2.to_string()))?;
                    // 熔断器：底层持续跟不上写入速度时，放弃本块
                    if retry_count >= 3 {
                        return Err(EngineError::DeviceWrite(format!(
                            "{} frames unwritten after {} retries",
                            total_frames - frames_written,
                            retry_count
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        // drop() discards queued frames immediately; prepare() makes the PCM writable again.
        self.pcm
            .drop()
            .map_err(|e| EngineError::DeviceWrite(e.to_string()))?;
        self.pcm
            .prepare()
            .map_err(|e| EngineError::DeviceRecover(e.to_string()))
    }

    fn recover(&mut self) -> Result<(), EngineError> {
        self.pcm
            .prepare()
            .map_err(|e| EngineError::DeviceRecover(e.to_string()))
    }
}
