use std::sync::Arc;
use std::time::Duration;

use mac_address::get_mac_address;
use ptt_voice_rs::audio::{self, AudioChunk, AudioPlaybackEngine, EngineEvent};
use ptt_voice_rs::capture_bridge::{self, CaptureBridge};
use ptt_voice_rs::config::Config;
use ptt_voice_rs::controller::{ControlEvent, Notification, SessionController};
use ptt_voice_rs::input::Intent;
use ptt_voice_rs::net_link::WsTransport;
use ptt_voice_rs::state_machine::SessionStateMachine;
use ptt_voice_rs::tray_bridge::TrayBridge;
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;

const CLIENT_ID_FILE: &str = "ptt_client_id.txt";

// 单线程事件循环；播放和按键监听各自占用一个系统线程
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut config = Config::new().map_err(anyhow::Error::msg)?;

    // 设备ID未配置时使用MAC地址，取不到则用随机UUID
    if !config.has_device_id() {
        config.device_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
    }

    // 客户端ID先从本地文件读取以保持重启间身份一致，不存在则生成并保存
    if !config.has_client_id() {
        if let Ok(content) = std::fs::read_to_string(CLIENT_ID_FILE) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                config.client_id = trimmed.to_string();
                log::info!("Loaded Client ID from file: {}", config.client_id);
            }
        }
    }
    if !config.has_client_id() {
        config.client_id = Uuid::new_v4().to_string();
        log::info!("Generated new Client ID: {}", config.client_id);
        if let Err(e) = std::fs::write(CLIENT_ID_FILE, &config.client_id) {
            log::warn!("Failed to save Client ID to file: {}", e);
        }
    }
    log::info!(
        "{} {} starting, device {}",
        config.app_name,
        config.app_version,
        config.device_id
    );

    // 组件间通信通道
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ControlEvent>();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notification>();
    let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let (key_tx, mut key_rx) = mpsc::channel::<Intent>(32);

    let engine = Arc::new(
        AudioPlaybackEngine::new(config.engine.clone(), audio::default_factory()).with_events(engine_tx),
    );
    // 启动失败不致命：下一次打开会话时会重试
    match engine.start() {
        Ok(()) => {
            let cue = AudioChunk::tone(880.0, Duration::from_millis(80), config.engine.device.sample_rate, 0.2);
            let _ = engine.enqueue(cue);
        }
        Err(e) => log::error!("Playback engine failed to start: {}", e),
    }

    let transport = WsTransport::new(config.client.clone(), config.client_id.clone());
    let mut controller = SessionController::new(
        SessionStateMachine::new(config.device_id.clone()),
        engine,
        transport,
        events_tx.clone(),
        notify_tx,
    )
    .with_max_recording(config.keys.max_recording);

    // 托盘桥：状态显示 + 菜单操作
    let tray = Arc::new(TrayBridge::new(&config.tray, events_tx.clone()).await?);
    let tray_clone = tray.clone();
    tokio::spawn(async move {
        if let Err(e) = tray_clone.run().await {
            log::error!("TrayBridge error: {}", e);
        }
    });

    // 采集桥：麦克风数据 + 转写结果
    let capture = Arc::new(CaptureBridge::new(&config.capture, events_tx.clone()).await?);
    let capture_clone = capture.clone();
    tokio::spawn(async move {
        if let Err(e) = capture_clone.run().await {
            log::error!("CaptureBridge error: {}", e);
        }
    });

    let stdin_tx = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = capture_bridge::read_stdin(stdin_tx).await {
            log::warn!("Stdin reader stopped: {}", e);
        }
    });

    #[cfg(target_os = "linux")]
    let _key_listener = match ptt_voice_rs::input::listener::KeyListener::spawn(config.keys.clone(), key_tx) {
        Ok(listener) => Some(listener),
        Err(e) => {
            log::warn!("Push-to-talk key unavailable ({}); use the tray or stdin", e);
            None
        }
    };
    #[cfg(not(target_os = "linux"))]
    {
        log::warn!("No key listener on this platform; use the tray or stdin");
        drop(key_tx);
    }

    log::info!("Core started. State: {}", controller.state());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            Some(intent) = key_rx.recv() => {
                controller.handle(ControlEvent::Intent(intent));
            }
            Some(event) = engine_rx.recv() => {
                controller.handle(ControlEvent::Engine(event));
            }
            Some(event) = events_rx.recv() => {
                controller.handle(event);
            }
            Some(notification) = notify_rx.recv() => {
                let result = match notification {
                    Notification::Mic { .. } => capture.send(&notification).await,
                    _ => tray.send(&notification).await,
                };
                if let Err(e) = result {
                    log::debug!("Failed to forward {:?}: {}", notification, e);
                }
            }
        }
    }

    controller.shutdown();
    Ok(())
}
