//! The per-session generation loop.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::ServerConfig;
use super::generator::{ContextSource, GeneratedUnit, GenerationInput, ResponseGenerator};
use crate::protocol::{Request, ResponseUnit, Sequencer, WireFrame};
use crate::session::{InterruptSignal, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// `End` sent.
    Completed,
    /// `Error` sent.
    Failed(String),
    /// The signal was set; nothing more was sent.
    Interrupted,
    /// The outgoing side went away.
    Disconnected,
}

pub struct SessionServer {
    generator: Arc<dyn ResponseGenerator>,
    context: Arc<dyn ContextSource>,
    config: ServerConfig,
}

/// Stamps and sends units for one session.
struct Emitter<'a> {
    session_id: SessionId,
    seq: Sequencer,
    out: &'a mpsc::Sender<WireFrame>,
    sent: usize,
}

impl Emitter<'_> {
    async fn send(&mut self, unit: ResponseUnit) -> Result<(), SessionEnd> {
        let frame = self
            .seq
            .frame(self.session_id, unit)
            .encode()
            .map_err(|e| SessionEnd::Failed(e.to_string()))?;
        self.out.send(frame).await.map_err(|_| SessionEnd::Disconnected)?;
        self.sent += 1;
        Ok(())
    }
}

impl SessionServer {
    pub fn new(
        generator: Arc<dyn ResponseGenerator>,
        context: Arc<dyn ContextSource>,
        config: ServerConfig,
    ) -> Self {
        Self {
            generator,
            context,
            config,
        }
    }

    /// Produce the response for `request` into `out`, checking `signal`
    /// before every unit. Ends with exactly one `End` or `Error`, or with
    /// neither if interrupted.
    pub async fn run_session(
        &self,
        request: Request,
        signal: &InterruptSignal,
        out: &mpsc::Sender<WireFrame>,
    ) -> SessionEnd {
        let session_id = request.session_id;
        let mut emitter = Emitter {
            session_id,
            seq: Sequencer::default(),
            out,
            sent: 0,
        };
        let end = match self.produce(request, signal, &mut emitter).await {
            Ok(()) => match emitter.send(ResponseUnit::End("done".into())).await {
                Ok(()) => SessionEnd::Completed,
                Err(end) => end,
            },
            Err(SessionEnd::Failed(reason)) => {
                log::warn!("Session {} failed: {}", session_id, reason);
                match emitter.send(ResponseUnit::Error(reason.clone())).await {
                    Ok(()) => SessionEnd::Failed(reason),
                    Err(end) => end,
                }
            }
            Err(end) => end,
        };
        log::info!(
            "Session {} finished after {} units: {:?}",
            session_id,
            emitter.sent,
            end
        );
        end
    }

    async fn produce(
        &self,
        request: Request,
        signal: &InterruptSignal,
        emitter: &mut Emitter<'_>,
    ) -> Result<(), SessionEnd> {
        let checkpoint = || signal.check().map_err(|_| SessionEnd::Interrupted);

        let context = self.context.context_for(&request.hardware_id).await;
        let input = GenerationInput {
            session_id: request.session_id,
            prompt: request.prompt_text,
            context,
            image: request.image,
            audio: request.audio,
        };
        checkpoint()?;
        let mut units = self
            .generator
            .generate(input)
            .await
            .map_err(|e| SessionEnd::Failed(e.to_string()))?;

        while let Some(item) = units.next().await {
            checkpoint()?;
            match item.map_err(|e| SessionEnd::Failed(e.to_string()))? {
                GeneratedUnit::Sentence(text) => emitter.send(ResponseUnit::Text(text)).await?,
                GeneratedUnit::Audio(chunk) => {
                    for piece in chunk.split(self.config.chunk_duration) {
                        checkpoint()?;
                        emitter.send(ResponseUnit::Audio(piece)).await?;
                    }
                }
            }
        }
        checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;
    use crate::error::GenerationError;
    use crate::protocol::UnitFrame;
    use crate::server::generator::{NoContext, UnitStream};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::time::Duration;

    struct Scripted(Vec<Result<GeneratedUnit, GenerationError>>);

    #[async_trait]
    impl ResponseGenerator for Scripted {
        async fn generate(&self, _input: GenerationInput) -> Result<UnitStream, GenerationError> {
            Ok(Box::pin(stream::iter(self.0.clone())))
        }
    }

    fn server(units: Vec<Result<GeneratedUnit, GenerationError>>) -> SessionServer {
        SessionServer::new(
            Arc::new(Scripted(units)),
            Arc::new(NoContext),
            ServerConfig {
                chunk_duration: Duration::from_millis(40),
                ..ServerConfig::default()
            },
        )
    }

    fn request() -> Request {
        Request {
            hardware_id: "hw".into(),
            session_id: SessionId(3),
            prompt_text: "hi".into(),
            image: None,
            audio: None,
        }
    }

    fn collect(rx: &mut mpsc::Receiver<WireFrame>) -> Vec<ResponseUnit> {
        let mut units = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            units.push(UnitFrame::decode(&frame).unwrap().unit);
        }
        units
    }

    #[tokio::test]
    async fn test_audio_is_rechunked_and_stream_terminated() {
        let s = server(vec![
            Ok(GeneratedUnit::Sentence("Hello.".into())),
            Ok(GeneratedUnit::Audio(AudioChunk::silence(Duration::from_millis(100), 1000))),
        ]);
        let (tx, mut rx) = mpsc::channel(64);
        let end = s.run_session(request(), &InterruptSignal::new(), &tx).await;
        assert_eq!(end, SessionEnd::Completed);

        let units = collect(&mut rx);
        let kinds: Vec<_> = units.iter().map(|u| u.kind()).collect();
        assert_eq!(kinds, vec!["text", "audio", "audio", "audio", "end"]);
    }

    #[tokio::test]
    async fn test_backend_error_becomes_error_unit() {
        let s = server(vec![
            Ok(GeneratedUnit::Sentence("Partial.".into())),
            Err(GenerationError::Failed("tts crashed".into())),
        ]);
        let (tx, mut rx) = mpsc::channel(64);
        let end = s.run_session(request(), &InterruptSignal::new(), &tx).await;
        assert!(matches!(end, SessionEnd::Failed(_)));

        let units = collect(&mut rx);
        assert_eq!(units.len(), 2);
        assert!(matches!(units[1], ResponseUnit::Error(ref m) if m.contains("tts crashed")));
        assert!(!units.iter().any(|u| matches!(u, ResponseUnit::End(_))));
    }

    #[tokio::test]
    async fn test_interrupted_session_emits_no_terminator() {
        let s = server(vec![Ok(GeneratedUnit::Sentence("Never sent.".into()))]);
        let signal = InterruptSignal::new();
        signal.set();
        let (tx, mut rx) = mpsc::channel(64);
        assert_eq!(s.run_session(request(), &signal, &tx).await, SessionEnd::Interrupted);
        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_closed_receiver_is_disconnect() {
        let s = server(vec![Ok(GeneratedUnit::Sentence("Hello.".into()))]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(
            s.run_session(request(), &InterruptSignal::new(), &tx).await,
            SessionEnd::Disconnected
        );
    }
}
