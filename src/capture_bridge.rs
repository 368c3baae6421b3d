use crate::config::CaptureConfig;
use crate::controller::{ControlEvent, Notification};
use crate::input::{Intent, Utterance};
use crate::protocol::Attachment;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

// 采集进程的数据报首字节为类型标记：麦克风 PCM 或 JSON 控制消息
const TAG_MIC: u8 = b'M';
const TAG_CONTROL: u8 = b'C';

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CaptureMessage {
    Utterance {
        #[serde(default)]
        text: String,
        #[serde(default)]
        image: Option<Attachment>,
        #[serde(default)]
        audio: Option<Attachment>,
    },
}

#[derive(Serialize)]
struct MicCommand {
    #[serde(rename = "type")]
    msg_type: &'static str,
    state: &'static str,
    session_id: SessionId,
}

pub struct CaptureBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl CaptureBridge {
    pub async fn new(config: &CaptureConfig, tx: mpsc::UnboundedSender<ControlEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.local_port)).await?;
        let target_addr = format!("127.0.0.1:{}", config.remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        // 屏幕帧以 base64 放在 JSON 里，缓冲区要足够大
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Some(event) = classify(&buf[..len]) else {
                continue;
            };
            if self.tx.send(event).is_err() {
                log::warn!("Controller gone, capture bridge exiting");
                break;
            }
        }
        Ok(())
    }

    /// Tells the capture process when to open and close the microphone.
    pub async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let Notification::Mic { session_id, open } = notification else {
            return Ok(());
        };
        let cmd = MicCommand {
            msg_type: "mic",
            state: if *open { "open" } else { "close" },
            session_id: *session_id,
        };
        let msg = serde_json::to_string(&cmd)?;
        self.socket.send_to(msg.as_bytes(), &self.target_addr).await?;
        Ok(())
    }
}

fn classify(datagram: &[u8]) -> Option<ControlEvent> {
    let (&tag, body) = datagram.split_first()?;
    match tag {
        TAG_MIC if !body.is_empty() => Some(ControlEvent::MicAudio(body.to_vec())),
        TAG_MIC => None,
        TAG_CONTROL => match serde_json::from_slice::<CaptureMessage>(body) {
            Ok(CaptureMessage::Utterance { text, image, audio }) => {
                let utterance = Utterance { text, audio, image };
                Some(ControlEvent::Intent(Intent::StopRecording(utterance)))
            }
            Err(e) => {
                log::warn!("Bad capture message: {}", e);
                None
            }
        },
        other => {
            log::debug!("Unknown capture datagram tag {:#04x}", other);
            None
        }
    }
}

/// Console stand-in for key and capture: a line starts a recording and
/// immediately submits the line as the utterance; a line of `!` interrupts.
pub async fn read_stdin(tx: mpsc::UnboundedSender<ControlEvent>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let events = match line {
            "" => continue,
            "!" => vec![Intent::InterruptOrCancel],
            text => vec![
                Intent::InterruptOrCancel,
                Intent::StartRecording,
                Intent::StopRecording(Utterance::text(text)),
            ],
        };
        for intent in events {
            if tx.send(ControlEvent::Intent(intent)).is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}
