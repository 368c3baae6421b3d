use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    session: Session,
    audio: Audio,
    keys: Keys,
    tray: Tray,
    capture: Capture,
    server: Server,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    server_url: String,
    control_addr: String,
    device_id: String,
    client_id: String,
}

#[derive(Deserialize)]
struct Session {
    total_timeout_secs: u64,
    unit_stale_secs: u64,
}

#[derive(Deserialize)]
struct Audio {
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
    fallback_device: String,
    fallback_sample_rate: u32,
    fallback_channels: u32,
    queue_capacity: usize,
    interrupt_cap_ms: u64,
    buffer_lock_ms: u64,
    drain_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Keys {
    key_code: u16,
    long_press_ms: u64,
    debounce_ms: u64,
    max_recording_secs: u64,
}

#[derive(Deserialize)]
struct Tray {
    local_port: u16,
    remote_port: u16,
}

#[derive(Deserialize)]
struct Capture {
    local_port: u16,
    remote_port: u16,
}

#[derive(Deserialize)]
struct Server {
    bind_addr: String,
    control_port: u16,
    chunk_ms: u64,
    sample_rate: u32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=SERVER_URL={}", config.network.server_url);
    println!("cargo:rustc-env=CONTROL_ADDR={}", config.network.control_addr);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);

    // 会话超时
    println!("cargo:rustc-env=SESSION_TOTAL_TIMEOUT_SECS={}", config.session.total_timeout_secs);
    println!("cargo:rustc-env=SESSION_UNIT_STALE_SECS={}", config.session.unit_stale_secs);

    // 音频播放配置
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_PERIOD_SIZE={}", config.audio.period_size);
    println!("cargo:rustc-env=AUDIO_FALLBACK_DEVICE={}", config.audio.fallback_device);
    println!("cargo:rustc-env=AUDIO_FALLBACK_SAMPLE_RATE={}", config.audio.fallback_sample_rate);
    println!("cargo:rustc-env=AUDIO_FALLBACK_CHANNELS={}", config.audio.fallback_channels);
    println!("cargo:rustc-env=AUDIO_QUEUE_CAPACITY={}", config.audio.queue_capacity);
    println!("cargo:rustc-env=AUDIO_INTERRUPT_CAP_MS={}", config.audio.interrupt_cap_ms);
    println!("cargo:rustc-env=AUDIO_BUFFER_LOCK_MS={}", config.audio.buffer_lock_ms);
    println!("cargo:rustc-env=AUDIO_DRAIN_TIMEOUT_MS={}", config.audio.drain_timeout_ms);

    // 按键配置
    println!("cargo:rustc-env=KEY_CODE={}", config.keys.key_code);
    println!("cargo:rustc-env=KEY_LONG_PRESS_MS={}", config.keys.long_press_ms);
    println!("cargo:rustc-env=KEY_DEBOUNCE_MS={}", config.keys.debounce_ms);
    println!("cargo:rustc-env=KEY_MAX_RECORDING_SECS={}", config.keys.max_recording_secs);

    // 托盘 / 采集进程
    println!("cargo:rustc-env=TRAY_LOCAL_PORT={}", config.tray.local_port);
    println!("cargo:rustc-env=TRAY_REMOTE_PORT={}", config.tray.remote_port);
    println!("cargo:rustc-env=CAPTURE_LOCAL_PORT={}", config.capture.local_port);
    println!("cargo:rustc-env=CAPTURE_REMOTE_PORT={}", config.capture.remote_port);

    // 服务端配置
    println!("cargo:rustc-env=SERVER_BIND_ADDR={}", config.server.bind_addr);
    println!("cargo:rustc-env=SERVER_CONTROL_PORT={}", config.server.control_port);
    println!("cargo:rustc-env=SERVER_CHUNK_MS={}", config.server.chunk_ms);
    println!("cargo:rustc-env=SERVER_SAMPLE_RATE={}", config.server.sample_rate);
}
