//! SLEEPING / LISTENING / PROCESSING.
//!
//! The machine is the single writer of session identity. It never touches
//! audio or the network itself: every transition returns the effects the
//! controller must run, in order.

use crate::input::{Intent, Utterance};
use crate::session::{InterruptSignal, Session, SessionId, SessionIdGen, SessionState};

#[derive(Debug)]
enum Phase {
    Sleeping,
    Listening(Session),
    Processing(Session),
}

#[derive(Debug, Clone)]
pub enum MachineEvent {
    Intent(Intent),
    /// The recording watchdog fired for this session.
    RecordingTimeout { session_id: SessionId },
    /// The stream ended with its terminator and playback drained.
    WorkCompleted { session_id: SessionId },
    /// Transport failure, timeout, server error or implicit cancellation.
    StreamFailed { session_id: SessionId, reason: String },
    /// The playback engine degraded; it needs `start()` again.
    EngineFailed { reason: String },
}

#[derive(Debug, Clone)]
pub enum Effect {
    OpenMic {
        session_id: SessionId,
    },
    CloseMic {
        session_id: SessionId,
    },
    OpenStream {
        session_id: SessionId,
        hardware_id: String,
        signal: InterruptSignal,
        utterance: Utterance,
    },
    /// Signal, stop audio, cancel the consumer, notify the server.
    ForceInterrupt {
        session_id: SessionId,
        hardware_id: String,
        signal: InterruptSignal,
    },
    NotifyState(SessionState),
}

#[derive(Debug)]
pub struct SessionStateMachine {
    phase: Phase,
    ids: SessionIdGen,
    hardware_id: String,
}

impl SessionStateMachine {
    pub fn new(hardware_id: impl Into<String>) -> Self {
        Self {
            phase: Phase::Sleeping,
            ids: SessionIdGen::new(),
            hardware_id: hardware_id.into(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Sleeping => SessionState::Sleeping,
            Phase::Listening(_) => SessionState::Listening,
            Phase::Processing(_) => SessionState::Processing,
        }
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<&Session> {
        match &self.phase {
            Phase::Sleeping => None,
            Phase::Listening(s) | Phase::Processing(s) => Some(s),
        }
    }

    pub fn handle(&mut self, event: MachineEvent) -> Vec<Effect> {
        let from = self.state();
        let phase = std::mem::replace(&mut self.phase, Phase::Sleeping);
        let (phase, effects) = self.transition(phase, event);
        self.phase = phase;
        let to = self.state();
        if from != to {
            log::info!("Session state {} -> {}", from, to);
        }
        effects
    }

    fn transition(&mut self, phase: Phase, event: MachineEvent) -> (Phase, Vec<Effect>) {
        match (phase, event) {
            (Phase::Sleeping, MachineEvent::Intent(Intent::StartRecording)) => {
                let session = self.new_session();
                let effects = vec![
                    Effect::OpenMic {
                        session_id: session.id,
                    },
                    Effect::NotifyState(SessionState::Listening),
                ];
                (Phase::Listening(session), effects)
            }

            (Phase::Listening(mut session), MachineEvent::Intent(Intent::StopRecording(utterance))) => {
                let close = Effect::CloseMic {
                    session_id: session.id,
                };
                if !utterance.is_command() {
                    log::info!("Session {}: empty utterance, back to sleep", session.id);
                    session.signal.set();
                    return (Phase::Sleeping, vec![close, Effect::NotifyState(SessionState::Sleeping)]);
                }
                session.state = SessionState::Processing;
                let open = Effect::OpenStream {
                    session_id: session.id,
                    hardware_id: session.hardware_id.clone(),
                    signal: session.signal.clone(),
                    utterance,
                };
                (
                    Phase::Processing(session),
                    vec![close, open, Effect::NotifyState(SessionState::Processing)],
                )
            }

            (Phase::Listening(session), MachineEvent::Intent(Intent::InterruptOrCancel)) => {
                session.signal.set();
                let effects = vec![
                    Effect::CloseMic {
                        session_id: session.id,
                    },
                    Effect::NotifyState(SessionState::Sleeping),
                ];
                (Phase::Sleeping, effects)
            }

            (Phase::Listening(session), MachineEvent::RecordingTimeout { session_id })
                if session_id == session.id =>
            {
                log::warn!("Session {}: recording exceeded its limit, cancelling", session.id);
                session.signal.set();
                let effects = vec![
                    Effect::CloseMic { session_id },
                    Effect::NotifyState(SessionState::Sleeping),
                ];
                (Phase::Sleeping, effects)
            }

            (Phase::Processing(session), MachineEvent::Intent(Intent::InterruptOrCancel)) => {
                let effects = vec![
                    Self::force_interrupt(&session),
                    Effect::NotifyState(SessionState::Sleeping),
                ];
                (Phase::Sleeping, effects)
            }

            (Phase::Processing(old), MachineEvent::Intent(Intent::StartRecording)) => {
                let session = self.new_session();
                let effects = vec![
                    Self::force_interrupt(&old),
                    Effect::OpenMic {
                        session_id: session.id,
                    },
                    Effect::NotifyState(SessionState::Listening),
                ];
                (Phase::Listening(session), effects)
            }

            (Phase::Processing(session), MachineEvent::WorkCompleted { session_id })
                if session_id == session.id =>
            {
                log::info!(
                    "Session {} completed in {:?}",
                    session.id,
                    session.created_at.elapsed()
                );
                (Phase::Sleeping, vec![Effect::NotifyState(SessionState::Sleeping)])
            }

            (Phase::Processing(session), MachineEvent::StreamFailed { session_id, reason })
                if session_id == session.id =>
            {
                log::warn!("Session {} stream failed: {}", session.id, reason);
                let effects = vec![
                    Self::force_interrupt(&session),
                    Effect::NotifyState(SessionState::Sleeping),
                ];
                (Phase::Sleeping, effects)
            }

            (Phase::Processing(session), MachineEvent::EngineFailed { reason }) => {
                log::error!("Session {}: playback engine failed: {}", session.id, reason);
                let effects = vec![
                    Self::force_interrupt(&session),
                    Effect::NotifyState(SessionState::Sleeping),
                ];
                (Phase::Sleeping, effects)
            }

            (phase, event) => {
                log::debug!("Ignoring {:?} in {:?}", event_name(&event), state_of(&phase));
                (phase, Vec::new())
            }
        }
    }

    fn new_session(&mut self) -> Session {
        let session = Session::new(self.ids.next_id(), self.hardware_id.clone());
        log::info!("Session {} created", session.id);
        session
    }

    fn force_interrupt(session: &Session) -> Effect {
        Effect::ForceInterrupt {
            session_id: session.id,
            hardware_id: session.hardware_id.clone(),
            signal: session.signal.clone(),
        }
    }
}

fn state_of(phase: &Phase) -> SessionState {
    match phase {
        Phase::Sleeping => SessionState::Sleeping,
        Phase::Listening(_) => SessionState::Listening,
        Phase::Processing(_) => SessionState::Processing,
    }
}

fn event_name(event: &MachineEvent) -> &'static str {
    match event {
        MachineEvent::Intent(intent) => intent.name(),
        MachineEvent::RecordingTimeout { .. } => "recording_timeout",
        MachineEvent::WorkCompleted { .. } => "work_completed",
        MachineEvent::StreamFailed { .. } => "stream_failed",
        MachineEvent::EngineFailed { .. } => "engine_failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(i: Intent) -> MachineEvent {
        MachineEvent::Intent(i)
    }

    fn to_processing(m: &mut SessionStateMachine) -> SessionId {
        m.handle(intent(Intent::StartRecording));
        m.handle(intent(Intent::StopRecording(Utterance::text("hello"))));
        assert_eq!(m.state(), SessionState::Processing);
        m.session().map(|s| s.id).unwrap()
    }

    fn count_force(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::ForceInterrupt { .. }))
            .count()
    }

    #[test]
    fn test_interrupt_while_sleeping_is_noop() {
        let mut m = SessionStateMachine::new("hw");
        assert!(m.handle(intent(Intent::InterruptOrCancel)).is_empty());
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_start_recording_opens_mic() {
        let mut m = SessionStateMachine::new("hw");
        let effects = m.handle(intent(Intent::StartRecording));
        assert!(matches!(effects[0], Effect::OpenMic { .. }));
        assert!(matches!(
            effects[1],
            Effect::NotifyState(SessionState::Listening)
        ));
        assert_eq!(m.session().unwrap().hardware_id, "hw");
    }

    #[test]
    fn test_accepted_command_opens_stream() {
        let mut m = SessionStateMachine::new("hw");
        m.handle(intent(Intent::StartRecording));
        let effects = m.handle(intent(Intent::StopRecording(Utterance::text("what time is it"))));
        assert!(matches!(effects[0], Effect::CloseMic { .. }));
        match &effects[1] {
            Effect::OpenStream { utterance, .. } => assert_eq!(utterance.text, "what time is it"),
            other => panic!("expected OpenStream, got {:?}", other),
        }
        assert_eq!(m.state(), SessionState::Processing);
    }

    #[test]
    fn test_empty_utterance_goes_back_to_sleep() {
        let mut m = SessionStateMachine::new("hw");
        m.handle(intent(Intent::StartRecording));
        let effects = m.handle(intent(Intent::StopRecording(Utterance::text("   "))));
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenStream { .. })));
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_cancel_while_listening_closes_mic_without_stream() {
        let mut m = SessionStateMachine::new("hw");
        m.handle(intent(Intent::StartRecording));
        let signal = m.session().unwrap().signal.clone();
        let effects = m.handle(intent(Intent::InterruptOrCancel));
        assert!(matches!(effects[0], Effect::CloseMic { .. }));
        assert_eq!(count_force(&effects), 0);
        assert!(signal.is_set());
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_interrupt_while_processing_forces_interrupt() {
        let mut m = SessionStateMachine::new("hw");
        let id = to_processing(&mut m);
        let effects = m.handle(intent(Intent::InterruptOrCancel));
        match &effects[0] {
            Effect::ForceInterrupt {
                session_id,
                hardware_id,
                ..
            } => {
                assert_eq!(*session_id, id);
                assert_eq!(hardware_id, "hw");
            }
            other => panic!("expected ForceInterrupt, got {:?}", other),
        }
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_start_while_processing_interrupts_once_then_listens() {
        let mut m = SessionStateMachine::new("hw");
        let old = to_processing(&mut m);
        let effects = m.handle(intent(Intent::StartRecording));
        assert_eq!(count_force(&effects), 1);
        assert!(matches!(effects[0], Effect::ForceInterrupt { session_id, .. } if session_id == old));
        let opens: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::OpenMic { session_id } => Some(*session_id),
                _ => None,
            })
            .collect();
        assert_eq!(opens.len(), 1);
        assert!(opens[0] > old);
        assert_eq!(m.state(), SessionState::Listening);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut m = SessionStateMachine::new("hw");
        let old = to_processing(&mut m);
        m.handle(intent(Intent::StartRecording));
        m.handle(intent(Intent::StopRecording(Utterance::text("again"))));

        let effects = m.handle(MachineEvent::WorkCompleted { session_id: old });
        assert!(effects.is_empty());
        assert_eq!(m.state(), SessionState::Processing);

        let current = m.session().unwrap().id;
        m.handle(MachineEvent::WorkCompleted { session_id: current });
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_stream_failure_interrupts_and_sleeps() {
        let mut m = SessionStateMachine::new("hw");
        let id = to_processing(&mut m);
        let effects = m.handle(MachineEvent::StreamFailed {
            session_id: id,
            reason: "closed".into(),
        });
        assert_eq!(count_force(&effects), 1);
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_recording_timeout_cancels_listening() {
        let mut m = SessionStateMachine::new("hw");
        m.handle(intent(Intent::StartRecording));
        let id = m.session().unwrap().id;
        m.handle(MachineEvent::RecordingTimeout { session_id: id });
        assert_eq!(m.state(), SessionState::Sleeping);
    }

    #[test]
    fn test_engine_failure_drops_processing() {
        let mut m = SessionStateMachine::new("hw");
        to_processing(&mut m);
        m.handle(MachineEvent::EngineFailed {
            reason: "device gone".into(),
        });
        assert_eq!(m.state(), SessionState::Sleeping);
    }
}
