//! Runs the state machine's effects against the engine and the transport.
//!
//! Everything here executes on the client's single event loop. Nothing in the
//! intent path awaits the network: streams are spawned, interrupt
//! notifications are fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{AudioPlaybackEngine, EngineEvent, EngineStatus};
use crate::input::{Intent, Utterance};
use crate::net_link::{ClientSink, SessionTransport, StreamHandle, StreamOutcome, UnitSink};
use crate::protocol::{Attachment, Request};
use crate::session::{InterruptSignal, SessionId, SessionState};
use crate::state_machine::{Effect, MachineEvent, SessionStateMachine};

/// Raw microphone bytes are forwarded as-is; the capture process decides the encoding.
const MIC_MIME: &str = "audio/l16";

/// Everything the event loop feeds into the controller.
#[derive(Debug)]
pub enum ControlEvent {
    Intent(Intent),
    MicAudio(Vec<u8>),
    RecordingTimeout(SessionId),
    Text { session_id: SessionId, text: String },
    StreamEnded { session_id: SessionId, outcome: StreamOutcome },
    Engine(EngineEvent),
}

/// Outbound notifications for the tray and capture collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    State(SessionState),
    Text { session_id: SessionId, text: String },
    Mic { session_id: SessionId, open: bool },
}

pub struct SessionController<T: SessionTransport> {
    machine: SessionStateMachine,
    engine: Arc<AudioPlaybackEngine>,
    transport: T,
    events: mpsc::UnboundedSender<ControlEvent>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    stream: Option<StreamHandle>,
    mic: Vec<u8>,
    watchdog: Option<JoinHandle<()>>,
    max_recording: Duration,
    drain_timeout: Duration,
}

impl<T: SessionTransport> SessionController<T> {
    pub fn new(
        machine: SessionStateMachine,
        engine: Arc<AudioPlaybackEngine>,
        transport: T,
        events: mpsc::UnboundedSender<ControlEvent>,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        let drain_timeout = engine.config().drain_timeout;
        Self {
            machine,
            engine,
            transport,
            events,
            notify_tx,
            stream: None,
            mic: Vec::new(),
            watchdog: None,
            max_recording: Duration::from_secs(120),
            drain_timeout,
        }
    }

    pub fn with_max_recording(mut self, max_recording: Duration) -> Self {
        self.max_recording = max_recording;
        self
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.machine.session().map(|s| s.id)
    }

    pub fn engine(&self) -> &Arc<AudioPlaybackEngine> {
        &self.engine
    }

    pub fn handle(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Intent(intent) => {
                log::debug!("Intent: {}", intent.name());
                self.dispatch(MachineEvent::Intent(intent));
            }
            ControlEvent::MicAudio(data) => {
                if self.machine.state() == SessionState::Listening {
                    self.mic.extend_from_slice(&data);
                } else {
                    log::trace!("Dropping {} mic bytes outside LISTENING", data.len());
                }
            }
            ControlEvent::RecordingTimeout(session_id) => {
                self.dispatch(MachineEvent::RecordingTimeout { session_id });
            }
            ControlEvent::Text { session_id, text } => {
                if self.is_processing(session_id) {
                    log::info!("Assistant: {}", text);
                    let _ = self.notify_tx.send(Notification::Text { session_id, text });
                } else {
                    log::debug!("Dropping text for stale session {}", session_id);
                }
            }
            ControlEvent::StreamEnded {
                session_id,
                outcome,
            } => self.on_stream_ended(session_id, outcome),
            ControlEvent::Engine(EngineEvent::Failed(e)) => {
                self.dispatch(MachineEvent::EngineFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Interrupt whatever is active and stop the playback worker.
    pub fn shutdown(&mut self) {
        self.dispatch(MachineEvent::Intent(Intent::InterruptOrCancel));
        self.engine.shutdown();
    }

    fn is_processing(&self, session_id: SessionId) -> bool {
        self.machine.state() == SessionState::Processing && self.current_session() == Some(session_id)
    }

    fn on_stream_ended(&mut self, session_id: SessionId, outcome: StreamOutcome) {
        if self.stream.as_ref().is_some_and(|s| s.session_id == session_id) {
            self.stream = None;
        }
        let event = match outcome {
            StreamOutcome::Completed(_) => MachineEvent::WorkCompleted { session_id },
            StreamOutcome::Interrupted => {
                log::debug!("Stream for session {} stopped locally", session_id);
                return;
            }
            other => MachineEvent::StreamFailed {
                session_id,
                reason: other.describe(),
            },
        };
        self.dispatch(event);
    }

    fn dispatch(&mut self, event: MachineEvent) {
        for effect in self.machine.handle(event) {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::OpenMic { session_id } => {
                self.mic.clear();
                self.arm_watchdog(session_id);
                let _ = self.notify_tx.send(Notification::Mic {
                    session_id,
                    open: true,
                });
            }
            Effect::CloseMic { session_id } => {
                if let Some(w) = self.watchdog.take() {
                    w.abort();
                }
                let _ = self.notify_tx.send(Notification::Mic {
                    session_id,
                    open: false,
                });
            }
            Effect::OpenStream {
                session_id,
                hardware_id,
                signal,
                utterance,
            } => self.open_stream(session_id, hardware_id, signal, utterance),
            Effect::ForceInterrupt {
                session_id,
                hardware_id,
                signal,
            } => self.force_interrupt(session_id, &hardware_id, &signal),
            Effect::NotifyState(state) => {
                let _ = self.notify_tx.send(Notification::State(state));
            }
        }
    }

    fn arm_watchdog(&mut self, session_id: SessionId) {
        if let Some(old) = self.watchdog.take() {
            old.abort();
        }
        let events = self.events.clone();
        let limit = self.max_recording;
        self.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let _ = events.send(ControlEvent::RecordingTimeout(session_id));
        }));
    }

    fn open_stream(
        &mut self,
        session_id: SessionId,
        hardware_id: String,
        signal: InterruptSignal,
        utterance: Utterance,
    ) {
        if self.engine.status() != EngineStatus::Running {
            if let Err(e) = self.engine.start() {
                log::error!("Cannot start playback engine: {}", e);
                let _ = self.events.send(ControlEvent::Engine(EngineEvent::Failed(e)));
                return;
            }
        }
        self.engine.bind_session(session_id, signal.clone());

        let mic = std::mem::take(&mut self.mic);
        let audio = match utterance.audio {
            Some(audio) => Some(audio),
            None if !mic.is_empty() => Some(Attachment::new(MIC_MIME, mic)),
            None => None,
        };
        let request = Request {
            hardware_id,
            session_id,
            prompt_text: utterance.text,
            image: utterance.image,
            audio,
        };
        log::info!(
            "Session {}: opening stream (text {} chars, image: {}, audio: {})",
            session_id,
            request.prompt_text.len(),
            request.image.is_some(),
            request.audio.is_some()
        );
        let sink: Arc<dyn UnitSink> = Arc::new(ClientSink::new(
            self.engine.clone(),
            self.events.clone(),
            self.drain_timeout,
        ));
        if let Some(previous) = self.stream.replace(self.transport.open(request, signal, sink)) {
            previous.cancel();
        }
    }

    /// Signal, stop audio, cancel the consumer, then tell the server without
    /// waiting for it.
    fn force_interrupt(&mut self, session_id: SessionId, hardware_id: &str, signal: &InterruptSignal) {
        signal.set();
        let elapsed = self.engine.interrupt(true);
        if let Some(stream) = self.stream.take() {
            stream.cancel();
        }
        self.transport.notify_interrupt(hardware_id);
        log::info!("Session {} force-interrupted in {:?}", session_id, elapsed);
    }
}
