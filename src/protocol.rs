//! Streaming session protocol, independent of the transport.
//!
//! Client → server frames are JSON with a `type` tag (`request`, `interrupt`).
//! Server → client units are either JSON text frames (`text`, `end`, `error`)
//! or binary audio frames laid out as
//!
//! ```text
//! 0     1        2..10           10..14      14..18             18..
//! 'A'   version  session_id u64  seq u32     sample_rate u32    PCM s16le
//! ```
//!
//! all integers little-endian.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::audio::AudioChunk;
use crate::error::ProtocolError;
use crate::session::SessionId;

pub const AUDIO_TAG: u8 = b'A';
pub const AUDIO_VERSION: u8 = 1;
const AUDIO_HEADER_LEN: usize = 18;

/// Encoded bytes (image, audio) carried inside a JSON frame as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            data,
        }
    }
}

fn to_base64<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64.encode(data))
}

fn from_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(d)?;
    BASE64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
}

/// Sent once per session, as the first frame on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub hardware_id: String,
    pub session_id: SessionId,
    pub prompt_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Request(Request),
    /// Best-effort: stop producing for this hardware id.
    Interrupt { hardware_id: String },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One unit of a response. Text and audio interleave; a stream ends with
/// exactly one `End` or `Error`, or with neither if it was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseUnit {
    Text(String),
    Audio(AudioChunk),
    End(String),
    Error(String),
}

impl ResponseUnit {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseUnit::Text(_) => "text",
            ResponseUnit::Audio(_) => "audio",
            ResponseUnit::End(_) => "end",
            ResponseUnit::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseUnit::End(_) | ResponseUnit::Error(_))
    }
}

/// A transport message: JSON text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TextFrame {
    Text {
        session_id: SessionId,
        seq: u32,
        text: String,
    },
    End {
        session_id: SessionId,
        message: String,
    },
    Error {
        session_id: SessionId,
        message: String,
    },
}

/// A response unit addressed to a session. `seq` counts text and audio units
/// independently; terminal units carry 0.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFrame {
    pub session_id: SessionId,
    pub seq: u32,
    pub unit: ResponseUnit,
}

impl UnitFrame {
    pub fn encode(&self) -> Result<WireFrame, ProtocolError> {
        let session_id = self.session_id;
        let frame = match &self.unit {
            ResponseUnit::Audio(chunk) => return Ok(WireFrame::Binary(self.encode_audio(chunk))),
            ResponseUnit::Text(text) => TextFrame::Text {
                session_id,
                seq: self.seq,
                text: text.clone(),
            },
            ResponseUnit::End(message) => TextFrame::End {
                session_id,
                message: message.clone(),
            },
            ResponseUnit::Error(message) => TextFrame::Error {
                session_id,
                message: message.clone(),
            },
        };
        Ok(WireFrame::Text(serde_json::to_string(&frame)?))
    }

    fn encode_audio(&self, chunk: &AudioChunk) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + chunk.len() * 2);
        buf.put_u8(AUDIO_TAG);
        buf.put_u8(AUDIO_VERSION);
        buf.put_u64_le(self.session_id.0);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(chunk.sample_rate());
        for s in chunk.samples() {
            buf.put_i16_le(*s);
        }
        buf.freeze()
    }

    pub fn decode(frame: &WireFrame) -> Result<Self, ProtocolError> {
        match frame {
            WireFrame::Text(text) => {
                let frame = match serde_json::from_str::<TextFrame>(text)? {
                    TextFrame::Text {
                        session_id,
                        seq,
                        text,
                    } => UnitFrame {
                        session_id,
                        seq,
                        unit: ResponseUnit::Text(text),
                    },
                    TextFrame::End {
                        session_id,
                        message,
                    } => UnitFrame {
                        session_id,
                        seq: 0,
                        unit: ResponseUnit::End(message),
                    },
                    TextFrame::Error {
                        session_id,
                        message,
                    } => UnitFrame {
                        session_id,
                        seq: 0,
                        unit: ResponseUnit::Error(message),
                    },
                };
                Ok(frame)
            }
            WireFrame::Binary(bytes) => Self::decode_audio(bytes),
        }
    }

    fn decode_audio(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let Some(&tag) = bytes.first() else {
            return Err(ProtocolError::Malformed("empty binary frame".into()));
        };
        if tag != AUDIO_TAG {
            return Err(ProtocolError::UnknownDiscriminant(tag));
        }
        if bytes.len() < AUDIO_HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "audio header needs {} bytes, got {}",
                AUDIO_HEADER_LEN,
                bytes.len()
            )));
        }
        if bytes[1] != AUDIO_VERSION {
            return Err(ProtocolError::UnsupportedVersion(bytes[1]));
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[2..10]);
        let session_id = SessionId(u64::from_le_bytes(id));
        let seq = u32_at(10);
        let sample_rate = u32_at(14);
        let chunk = AudioChunk::from_le_bytes(&bytes[AUDIO_HEADER_LEN..], sample_rate)?;
        Ok(UnitFrame {
            session_id,
            seq,
            unit: ResponseUnit::Audio(chunk),
        })
    }
}

/// Server side: stamps per-kind sequence numbers in emission order.
#[derive(Debug, Default)]
pub struct Sequencer {
    text: u32,
    audio: u32,
}

impl Sequencer {
    pub fn frame(&mut self, session_id: SessionId, unit: ResponseUnit) -> UnitFrame {
        let seq = match &unit {
            ResponseUnit::Text(_) => post_inc(&mut self.text),
            ResponseUnit::Audio(_) => post_inc(&mut self.audio),
            ResponseUnit::End(_) | ResponseUnit::Error(_) => 0,
        };
        UnitFrame {
            session_id,
            seq,
            unit,
        }
    }
}

fn post_inc(counter: &mut u32) -> u32 {
    let current = *counter;
    *counter = counter.wrapping_add(1);
    current
}

/// Client side: refuses units whose per-kind sequence goes backwards. Gaps
/// (a dropped malformed unit) are tolerated.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    next_text: u32,
    next_audio: u32,
}

impl SequenceGuard {
    pub fn admit(&mut self, frame: &UnitFrame) -> Result<(), ProtocolError> {
        let (kind, next) = match frame.unit {
            ResponseUnit::Text(_) => ("text", &mut self.next_text),
            ResponseUnit::Audio(_) => ("audio", &mut self.next_audio),
            ResponseUnit::End(_) | ResponseUnit::Error(_) => return Ok(()),
        };
        if frame.seq < *next {
            return Err(ProtocolError::OutOfOrder {
                kind,
                expected: *next,
                got: frame.seq,
            });
        }
        if frame.seq > *next {
            log::debug!("{} sequence gap: expected {}, got {}", kind, next, frame.seq);
        }
        *next = frame.seq + 1;
        Ok(())
    }
}
