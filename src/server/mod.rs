//! Streaming session server: one WebSocket connection per session, an
//! out-of-band UDP interrupt listener, and a pluggable response generator.

pub mod generator;
pub mod listener;
pub mod registry;
pub mod session;

pub use generator::{
    ContextSource, GeneratedUnit, GenerationInput, NoContext, ResponseGenerator, SentenceSplitter,
    StaticContext, ToneSpeechGenerator, UnitStream,
};
pub use listener::serve;
pub use registry::InterruptRegistry;
pub use session::{SessionEnd, SessionServer};

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// UDP port for out-of-band interrupts
    pub control_port: u16,
    /// Audio is re-chunked to at most this much per unit; smaller chunks
    /// make client-side interrupts land sooner.
    pub chunk_duration: Duration,
    pub sample_rate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8765".to_string(),
            control_port: 8766,
            chunk_duration: Duration::from_millis(40),
            sample_rate: 24000,
        }
    }
}
