use crate::config::TrayConfig;
use crate::controller::{ControlEvent, Notification};
use crate::input::{Intent, Utterance};
use crate::session::{SessionId, SessionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

// 托盘进程发来的操作（点击菜单、输入文字）
#[derive(Debug, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
enum TrayIntent {
    StartRecording,
    StopRecording {
        #[serde(default)]
        text: String,
    },
    InterruptOrCancel,
}

// 发给托盘进程的状态 / 文本
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TrayMessage<'a> {
    State { state: SessionState },
    Text { session_id: SessionId, text: &'a str },
}

pub struct TrayBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::UnboundedSender<ControlEvent>,
}

// 托盘进程和Core进程通过本地UDP通信，端口在配置中指定
impl TrayBridge {
    pub async fn new(config: &TrayConfig, tx: mpsc::UnboundedSender<ControlEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match parse_intent(msg) {
                Some(intent) => {
                    if self.tx.send(ControlEvent::Intent(intent)).is_err() {
                        log::warn!("Controller gone, tray bridge exiting");
                        break;
                    }
                }
                None => log::debug!("Ignoring tray message: {}", msg),
            }
        }
        Ok(())
    }

    /// Forwards state changes and assistant text; mic notifications are not for the tray.
    pub async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let Some(msg) = encode(notification)? else {
            return Ok(());
        };
        self.socket.send_to(msg.as_bytes(), &self.target_addr).await?;
        Ok(())
    }
}

fn parse_intent(msg: &str) -> Option<Intent> {
    let intent = serde_json::from_str::<TrayIntent>(msg).ok()?;
    Some(match intent {
        TrayIntent::StartRecording => Intent::StartRecording,
        TrayIntent::StopRecording { text } => Intent::StopRecording(Utterance::text(text)),
        TrayIntent::InterruptOrCancel => Intent::InterruptOrCancel,
    })
}

fn encode(notification: &Notification) -> serde_json::Result<Option<String>> {
    let msg = match notification {
        Notification::State(state) => TrayMessage::State { state: *state },
        Notification::Text { session_id, text } => TrayMessage::Text {
            session_id: *session_id,
            text,
        },
        Notification::Mic { .. } => return Ok(None),
    };
    serde_json::to_string(&msg).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tray_intents() {
        assert_eq!(
            parse_intent(r#"{"intent":"interrupt_or_cancel"}"#),
            Some(Intent::InterruptOrCancel)
        );
        assert_eq!(
            parse_intent(r#"{"intent":"stop_recording","text":"hi"}"#),
            Some(Intent::StopRecording(Utterance::text("hi")))
        );
        assert_eq!(parse_intent(r#"{"intent":"reboot"}"#), None);
        assert_eq!(parse_intent("garbage"), None);
    }

    #[test]
    fn test_state_notification_json() {
        let json = encode(&Notification::State(SessionState::Processing)).unwrap();
        assert_eq!(json.as_deref(), Some(r#"{"type":"state","state":"processing"}"#));
        let mic = encode(&Notification::Mic {
            session_id: SessionId(1),
            open: true,
        })
        .unwrap();
        assert!(mic.is_none());
    }
}
