//! The seam to text generation and speech synthesis.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use tokio::sync::mpsc;

use crate::audio::AudioChunk;
use crate::error::GenerationError;
use crate::protocol::Attachment;
use crate::session::SessionId;

#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub session_id: SessionId,
    pub prompt: String,
    /// Opaque memory/context blob, prepended by the backend as it sees fit
    pub context: Option<String>,
    pub image: Option<Attachment>,
    pub audio: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedUnit {
    Sentence(String),
    Audio(AudioChunk),
}

pub type UnitStream = BoxStream<'static, Result<GeneratedUnit, GenerationError>>;

/// Produces a finite, lazy sequence of sentences and audio for one prompt.
/// Each call starts from scratch; a stream cannot be resumed.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, input: GenerationInput) -> Result<UnitStream, GenerationError>;
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn context_for(&self, hardware_id: &str) -> Option<String>;
}

pub struct NoContext;

#[async_trait]
impl ContextSource for NoContext {
    async fn context_for(&self, _hardware_id: &str) -> Option<String> {
        None
    }
}

/// The same context for every device.
pub struct StaticContext(pub String);

#[async_trait]
impl ContextSource for StaticContext {
    async fn context_for(&self, _hardware_id: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Cuts streamed text into sentences as soon as each one is complete.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buf: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completed. A terminator
    /// only ends a sentence once the next character is whitespace, so "3.14"
    /// is not split.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);
        let mut sentences = Vec::new();
        loop {
            let cut = self.buf.char_indices().find_map(|(i, c)| {
                let after = i + c.len_utf8();
                let ends = match c {
                    '。' | '！' | '？' => true,
                    '.' | '!' | '?' => self.buf[after..].starts_with(char::is_whitespace),
                    _ => false,
                };
                ends.then_some(after)
            });
            let Some(cut) = cut else {
                break;
            };
            let sentence = self.buf[..cut].trim().to_string();
            self.buf.drain(..cut);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Whatever is left once the text is complete.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Stand-in backend: streams a short reply word by word and voices each
/// sentence as a tone whose length follows the sentence length.
#[derive(Debug, Clone)]
pub struct ToneSpeechGenerator {
    sample_rate: u32,
    word_delay: Duration,
    per_word: Duration,
}

impl ToneSpeechGenerator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            word_delay: Duration::from_millis(60),
            per_word: Duration::from_millis(120),
        }
    }

    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    pub fn with_per_word(mut self, per_word: Duration) -> Self {
        self.per_word = per_word;
        self
    }

    fn compose(input: &GenerationInput) -> String {
        let mut reply = String::new();
        if let Some(context) = &input.context {
            reply.push_str(&format!("Remembering {} notes. ", context.lines().count()));
        }
        let prompt = input.prompt.trim();
        if prompt.is_empty() {
            reply.push_str("I did not catch any words. ");
        } else {
            reply.push_str(&format!("You said {}. ", prompt.trim_end_matches(['.', '!', '?'])));
        }
        if let Some(audio) = &input.audio {
            reply.push_str(&format!("I received {} bytes of audio. ", audio.data.len()));
        }
        if let Some(image) = &input.image {
            reply.push_str(&format!("I can see a {} frame. ", image.mime));
        }
        reply.push_str("That is all for now.");
        reply
    }
}

#[async_trait]
impl ResponseGenerator for ToneSpeechGenerator {
    async fn generate(&self, input: GenerationInput) -> Result<UnitStream, GenerationError> {
        let reply = Self::compose(&input);
        let (tx, rx) = mpsc::channel(8);
        let this = self.clone();
        let session_id = input.session_id;

        tokio::spawn(async move {
            let mut splitter = SentenceSplitter::new();
            let mut index = 0usize;
            for word in reply.split_inclusive(' ') {
                tokio::time::sleep(this.word_delay).await;
                for sentence in splitter.push(word) {
                    if !this.emit(&tx, sentence, index).await {
                        log::debug!("Session {}: reply consumer gone", session_id);
                        return;
                    }
                    index += 1;
                }
            }
            if let Some(sentence) = splitter.finish() {
                this.emit(&tx, sentence, index).await;
            }
        });

        let units = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|unit| (Ok(unit), rx)) });
        Ok(Box::pin(units))
    }
}

impl ToneSpeechGenerator {
    async fn emit(&self, tx: &mpsc::Sender<GeneratedUnit>, sentence: String, index: usize) -> bool {
        let words = sentence.split_whitespace().count().max(1) as u32;
        let frequency = 330.0 + 55.0 * (index % 5) as f32;
        let chunk = AudioChunk::tone(frequency, self.per_word * words, self.sample_rate, 0.3);
        tx.send(GeneratedUnit::Sentence(sentence)).await.is_ok()
            && tx.send(GeneratedUnit::Audio(chunk)).await.is_ok()
    }
}
