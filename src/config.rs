use std::time::Duration;

use crate::audio::{DeviceConfig, EngineConfig};
use crate::input::KeyConfig;
use crate::net_link::ClientConfig;
use crate::server::ServerConfig;

/// 托盘进程（UI）通过本地 UDP 通信
#[derive(Debug, Clone)]
pub struct TrayConfig {
    pub local_port: u16,
    pub remote_port: u16,
}

impl Default for TrayConfig {
    fn default() -> Self {
        Self {
            local_port: 5678,
            remote_port: 5679,
        }
    }
}

/// 采集进程（麦克风 / 屏幕）通过本地 UDP 把已编码的数据交给核心
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub local_port: u16,
    pub remote_port: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            local_port: 5676,
            remote_port: 5677,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,

    pub engine: EngineConfig,
    pub keys: KeyConfig,
    pub client: ClientConfig,
    pub tray: TrayConfig,
    pub capture: CaptureConfig,
    pub server: ServerConfig,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let engine = EngineConfig {
            device: DeviceConfig {
                name: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                sample_rate: env!("AUDIO_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
                channels: env!("AUDIO_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
                period_size: env!("AUDIO_PERIOD_SIZE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_PERIOD_SIZE")?,
            },
            fallback_device: DeviceConfig {
                name: env!("AUDIO_FALLBACK_DEVICE").to_string(),
                sample_rate: env!("AUDIO_FALLBACK_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_FALLBACK_SAMPLE_RATE")?,
                channels: env!("AUDIO_FALLBACK_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_FALLBACK_CHANNELS")?,
                period_size: 0,
            },
            queue_capacity: env!("AUDIO_QUEUE_CAPACITY")
                .parse()
                .map_err(|_| "Failed to parse AUDIO_QUEUE_CAPACITY")?,
            interrupt_hard_cap: millis(env!("AUDIO_INTERRUPT_CAP_MS"))
                .ok_or("Failed to parse AUDIO_INTERRUPT_CAP_MS")?,
            buffer_lock: millis(env!("AUDIO_BUFFER_LOCK_MS"))
                .ok_or("Failed to parse AUDIO_BUFFER_LOCK_MS")?,
            drain_timeout: millis(env!("AUDIO_DRAIN_TIMEOUT_MS"))
                .ok_or("Failed to parse AUDIO_DRAIN_TIMEOUT_MS")?,
            ..EngineConfig::default()
        };

        let keys = KeyConfig {
            key_code: env!("KEY_CODE")
                .parse()
                .map_err(|_| "Failed to parse KEY_CODE")?,
            long_press_threshold: millis(env!("KEY_LONG_PRESS_MS"))
                .ok_or("Failed to parse KEY_LONG_PRESS_MS")?,
            debounce: millis(env!("KEY_DEBOUNCE_MS")).ok_or("Failed to parse KEY_DEBOUNCE_MS")?,
            max_recording: secs(env!("KEY_MAX_RECORDING_SECS"))
                .ok_or("Failed to parse KEY_MAX_RECORDING_SECS")?,
        };

        let client = ClientConfig {
            server_url: env!("SERVER_URL").to_string(),
            control_addr: env!("CONTROL_ADDR").to_string(),
            total_timeout: secs(env!("SESSION_TOTAL_TIMEOUT_SECS"))
                .ok_or("Failed to parse SESSION_TOTAL_TIMEOUT_SECS")?,
            unit_stale_timeout: secs(env!("SESSION_UNIT_STALE_SECS"))
                .ok_or("Failed to parse SESSION_UNIT_STALE_SECS")?,
        };

        let server = ServerConfig {
            bind_addr: env!("SERVER_BIND_ADDR").to_string(),
            control_port: env!("SERVER_CONTROL_PORT")
                .parse()
                .map_err(|_| "Failed to parse SERVER_CONTROL_PORT")?,
            chunk_duration: millis(env!("SERVER_CHUNK_MS")).ok_or("Failed to parse SERVER_CHUNK_MS")?,
            sample_rate: env!("SERVER_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse SERVER_SAMPLE_RATE")?,
        };

        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            // 设备标识初始化为config.toml中的值
            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),
            engine,
            keys,
            client,
            tray: TrayConfig {
                local_port: env!("TRAY_LOCAL_PORT")
                    .parse()
                    .map_err(|_| "Failed to parse TRAY_LOCAL_PORT")?,
                remote_port: env!("TRAY_REMOTE_PORT")
                    .parse()
                    .map_err(|_| "Failed to parse TRAY_REMOTE_PORT")?,
            },
            capture: CaptureConfig {
                local_port: env!("CAPTURE_LOCAL_PORT")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_LOCAL_PORT")?,
                remote_port: env!("CAPTURE_REMOTE_PORT")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_REMOTE_PORT")?,
            },
            server,
        })
    }

    /// 设备ID未配置时的占位值
    pub fn has_device_id(&self) -> bool {
        self.device_id != "unknown-device"
    }

    pub fn has_client_id(&self) -> bool {
        self.client_id != "unknown-client"
    }
}

fn millis(raw: &str) -> Option<Duration> {
    raw.parse().ok().map(Duration::from_millis)
}

fn secs(raw: &str) -> Option<Duration> {
    raw.parse().ok().map(Duration::from_secs)
}
