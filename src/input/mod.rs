//! Push-to-talk input: raw key timing in, session-level intents out.
//!
//! The evdev listener (Linux) reads `/dev/input/event*` on its own thread and
//! hands intents to the async side through a channel.
//!
//! # Requirements
//! - User must be in the `input` group: `sudo usermod -aG input $USER`

mod detector;
#[cfg(target_os = "linux")]
pub mod listener;

pub use detector::{KeyConfig, KeyIntentDetector};

use crate::protocol::Attachment;

/// What the user finished saying, handed over by the capture collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Utterance {
    /// Transcript of the utterance (may be empty if only audio is sent)
    pub text: String,
    /// Already-encoded microphone audio
    pub audio: Option<Attachment>,
    /// Screen frame captured alongside the utterance
    pub image: Option<Attachment>,
}

impl Utterance {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// A command is accepted only if there is something to send.
    pub fn is_command(&self) -> bool {
        !self.text.trim().is_empty() || self.audio.is_some()
    }
}

/// Session-level intents. The key detector produces `StartRecording` and
/// `InterruptOrCancel`; `StopRecording` comes from the capture side once the
/// utterance is complete.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    StartRecording,
    StopRecording(Utterance),
    InterruptOrCancel,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::StartRecording => "start_recording",
            Intent::StopRecording(_) => "stop_recording",
            Intent::InterruptOrCancel => "interrupt_or_cancel",
        }
    }
}
