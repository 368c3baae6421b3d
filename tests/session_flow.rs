//! Client and server wired together over an in-memory loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ptt_voice_rs::audio::{AudioChunk, AudioPlaybackEngine, EngineConfig, NullDeviceFactory};
use ptt_voice_rs::controller::{ControlEvent, Notification, SessionController};
use ptt_voice_rs::error::{GenerationError, TransportError};
use ptt_voice_rs::input::{Intent, KeyConfig, KeyIntentDetector, Utterance};
use ptt_voice_rs::net_link::{self, ClientConfig, SessionTransport, StreamHandle, StreamOutcome, UnitSink};
use ptt_voice_rs::protocol::{Request, ResponseUnit, UnitFrame, WireFrame};
use ptt_voice_rs::server::{
    GeneratedUnit, GenerationInput, InterruptRegistry, NoContext, ResponseGenerator, ServerConfig,
    SessionEnd, SessionServer, UnitStream,
};
use ptt_voice_rs::session::{InterruptSignal, SessionId, SessionState};
use ptt_voice_rs::state_machine::SessionStateMachine;

const RATE: u32 = 8000;

/// Plays back a fixed script, pausing before each unit.
struct Scripted {
    units: Vec<GeneratedUnit>,
    gap: Duration,
}

#[async_trait]
impl ResponseGenerator for Scripted {
    async fn generate(&self, _input: GenerationInput) -> Result<UnitStream, GenerationError> {
        let gap = self.gap;
        let units = stream::unfold(self.units.clone().into_iter(), move |mut it| async move {
            let unit = it.next()?;
            tokio::time::sleep(gap).await;
            Some((Ok(unit), it))
        });
        Ok(Box::pin(units))
    }
}

fn server(units: Vec<GeneratedUnit>, gap: Duration) -> Arc<SessionServer> {
    Arc::new(SessionServer::new(
        Arc::new(Scripted { units, gap }),
        Arc::new(NoContext),
        ServerConfig {
            chunk_duration: Duration::from_millis(40),
            ..ServerConfig::default()
        },
    ))
}

fn frames(rx: mpsc::Receiver<WireFrame>) -> impl futures_util::Stream<Item = Result<WireFrame, TransportError>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (Ok(f), rx)) })
}

/// Runs the real server session loop in-process; interrupts go through the
/// same registry the UDP control listener would use.
struct Loopback {
    server: Arc<SessionServer>,
    registry: Arc<InterruptRegistry>,
    config: ClientConfig,
    notified: Arc<AtomicUsize>,
}

impl SessionTransport for Loopback {
    fn open(&self, request: Request, signal: InterruptSignal, sink: Arc<dyn UnitSink>) -> StreamHandle {
        let session_id = request.session_id;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);

        let server = self.server.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let server_signal = registry.begin(&request.hardware_id);
            let hardware_id = request.hardware_id.clone();
            server.run_session(request, &server_signal, &tx).await;
            registry.finish(&hardware_id, &server_signal);
        });

        let config = self.config.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = net_link::consume(frames(rx), session_id, &signal, &token, sink.as_ref(), &config).await;
            sink.ended(session_id, outcome);
        });
        StreamHandle::new(session_id, cancel, task)
    }

    fn notify_interrupt(&self, hardware_id: &str) {
        self.notified.fetch_add(1, Ordering::SeqCst);
        self.registry.interrupt(hardware_id);
    }
}

struct Client {
    controller: SessionController<Loopback>,
    events: mpsc::UnboundedReceiver<ControlEvent>,
    notes: mpsc::UnboundedReceiver<Notification>,
    notified: Arc<AtomicUsize>,
    stats: Arc<ptt_voice_rs::audio::NullStats>,
}

fn client(server: Arc<SessionServer>) -> Client {
    client_with_drain(server, Duration::from_secs(2))
}

fn client_with_drain(server: Arc<SessionServer>, drain_timeout: Duration) -> Client {
    let factory = NullDeviceFactory::new(true);
    let stats = factory.stats();
    let engine = Arc::new(AudioPlaybackEngine::new(
        EngineConfig {
            drain_timeout,
            ..EngineConfig::default()
        },
        Arc::new(factory),
    ));
    let notified = Arc::new(AtomicUsize::new(0));
    let transport = Loopback {
        server,
        registry: Arc::new(InterruptRegistry::new()),
        config: ClientConfig {
            unit_stale_timeout: Duration::from_secs(2),
            total_timeout: Duration::from_secs(10),
            ..ClientConfig::default()
        },
        notified: notified.clone(),
    };
    let (events_tx, events) = mpsc::unbounded_channel();
    let (notify_tx, notes) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        SessionStateMachine::new("hw-loop"),
        engine,
        transport,
        events_tx,
        notify_tx,
    );
    Client {
        controller,
        events,
        notes,
        notified,
        stats,
    }
}

impl Client {
    fn say(&mut self, text: &str) {
        self.controller.handle(ControlEvent::Intent(Intent::StartRecording));
        self.controller
            .handle(ControlEvent::Intent(Intent::StopRecording(Utterance::text(text))));
    }

    /// Pump controller events until `state` is reached.
    async fn run_until(&mut self, state: SessionState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.controller.state() != state {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("state not reached in time")
                .expect("event channel closed");
            self.controller.handle(event);
        }
    }

    /// Replay one key press held for `held`, feeding the detector's intents
    /// to the controller. Returns the intents in emission order.
    fn press(&mut self, keys: &mut KeyIntentDetector, at: Instant, held: Duration) -> Vec<Intent> {
        let mut intents = Vec::new();
        intents.extend(keys.on_key_down(at));
        intents.extend(keys.on_key_up(at + held));
        for intent in &intents {
            self.controller.handle(ControlEvent::Intent(intent.clone()));
        }
        intents
    }

    fn states(&mut self) -> Vec<SessionState> {
        let mut states = Vec::new();
        while let Ok(n) = self.notes.try_recv() {
            if let Notification::State(s) = n {
                states.push(s);
            }
        }
        states
    }
}

#[tokio::test]
async fn hello_audio_done_plays_and_returns_to_sleep() {
    let server = server(
        vec![
            GeneratedUnit::Sentence("Hello".into()),
            GeneratedUnit::Audio(AudioChunk::tone(440.0, Duration::from_millis(30), RATE, 0.2)),
        ],
        Duration::from_millis(5),
    );
    let mut c = client(server);
    c.say("hi there");
    assert_eq!(c.controller.state(), SessionState::Processing);

    c.run_until(SessionState::Sleeping).await;

    assert_eq!(c.stats.chunks(), 1, "the audio unit reached the device");
    assert_eq!(c.controller.engine().queued(), 0);
    assert!(c.controller.engine().is_idle());
    assert_eq!(
        c.states(),
        vec![
            SessionState::Listening,
            SessionState::Processing,
            SessionState::Sleeping
        ]
    );
    assert_eq!(c.notified.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_while_processing_interrupts_once_then_listens() {
    let long_reply: Vec<_> = (0..50)
        .map(|i| GeneratedUnit::Sentence(format!("Sentence {}.", i)))
        .collect();
    let mut c = client(server(long_reply, Duration::from_millis(20)));
    c.say("tell me a story");
    let first = c.controller.current_session().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    c.controller.handle(ControlEvent::Intent(Intent::StartRecording));

    assert_eq!(c.controller.state(), SessionState::Listening);
    assert_eq!(c.notified.load(Ordering::SeqCst), 1);
    let second = c.controller.current_session().unwrap();
    assert!(second > first);
    assert_eq!(
        c.states(),
        vec![
            SessionState::Listening,
            SessionState::Processing,
            SessionState::Listening
        ]
    );

    // Late events from the first stream must not disturb the new session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = c.events.try_recv() {
        c.controller.handle(event);
    }
    assert_eq!(c.controller.state(), SessionState::Listening);
    assert_eq!(c.controller.current_session(), Some(second));
    assert_eq!(c.notified.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<ResponseUnit>>,
}

#[async_trait]
impl UnitSink for Recorder {
    async fn text(&self, _: SessionId, text: String) {
        self.seen.lock().unwrap().push(ResponseUnit::Text(text));
    }
    async fn audio(&self, _: SessionId, chunk: AudioChunk) {
        self.seen.lock().unwrap().push(ResponseUnit::Audio(chunk));
    }
    async fn finish(&self, _: SessionId) -> bool {
        true
    }
    fn ended(&self, _: SessionId, _: StreamOutcome) {}
}

#[tokio::test]
async fn text_and_audio_keep_their_own_order() {
    let a1 = AudioChunk::new(vec![1; 40], RATE);
    let a2 = AudioChunk::new(vec![2; 40], RATE);
    let server = server(
        vec![
            GeneratedUnit::Sentence("T1".into()),
            GeneratedUnit::Audio(a1.clone()),
            GeneratedUnit::Sentence("T2".into()),
            GeneratedUnit::Sentence("T3".into()),
            GeneratedUnit::Audio(a2.clone()),
        ],
        Duration::ZERO,
    );
    let request = Request {
        hardware_id: "hw".into(),
        session_id: SessionId(11),
        prompt_text: "order".into(),
        image: None,
        audio: None,
    };
    let (tx, rx) = mpsc::channel(64);
    let signal = InterruptSignal::new();
    let producer = {
        let signal = signal.clone();
        tokio::spawn(async move { server.run_session(request, &signal, &tx).await })
    };

    let sink = Recorder::default();
    let outcome = net_link::consume(
        frames(rx),
        SessionId(11),
        &signal,
        &CancellationToken::new(),
        &sink,
        &ClientConfig::default(),
    )
    .await;
    assert!(matches!(outcome, StreamOutcome::Completed(_)));
    assert_eq!(producer.await.unwrap(), SessionEnd::Completed);

    let seen = sink.seen.lock().unwrap();
    let texts: Vec<_> = seen
        .iter()
        .filter_map(|u| match u {
            ResponseUnit::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    let audio: Vec<_> = seen
        .iter()
        .filter_map(|u| match u {
            ResponseUnit::Audio(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["T1", "T2", "T3"]);
    assert_eq!(audio, vec![a1, a2]);
}

#[tokio::test]
async fn server_stops_within_one_unit_of_an_interrupt() {
    let units: Vec<_> = (0..100)
        .map(|i| GeneratedUnit::Sentence(format!("S{}.", i)))
        .collect();
    let server = server(units, Duration::from_millis(20));
    let registry = Arc::new(InterruptRegistry::new());
    let signal = registry.begin("hw");
    let request = Request {
        hardware_id: "hw".into(),
        session_id: SessionId(21),
        prompt_text: "count".into(),
        image: None,
        audio: None,
    };
    let (tx, mut rx) = mpsc::channel(256);
    let producer = tokio::spawn(async move { server.run_session(request, &signal, &tx).await });

    let mut received = 0usize;
    while received < 3 {
        rx.recv().await.expect("server stopped early");
        received += 1;
    }
    assert!(registry.interrupt("hw"));
    while rx.try_recv().is_ok() {
        received += 1;
    }
    let at_interrupt = received;

    assert_eq!(producer.await.unwrap(), SessionEnd::Interrupted);
    let mut after = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        after.push(UnitFrame::decode(&frame).unwrap().unit);
    }
    assert!(after.len() <= 1, "{} units leaked after interrupt", after.len());
    assert!(!after.iter().any(|u| u.is_terminal()), "no terminator after interrupt");
    assert!(at_interrupt >= 3);
    // A second interrupt for the same device is a harmless no-op.
    assert!(!registry.interrupt("hw"));
}

#[tokio::test]
async fn short_press_only_interrupts_and_stays_asleep() {
    let mut c = client(server(Vec::new(), Duration::ZERO));
    let mut keys = KeyIntentDetector::new(KeyConfig::default());

    let intents = c.press(&mut keys, Instant::now(), Duration::from_millis(200));

    assert_eq!(intents, vec![Intent::InterruptOrCancel]);
    assert_eq!(c.controller.state(), SessionState::Sleeping);
    assert!(c.states().is_empty());
    assert_eq!(c.notified.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn long_press_listens_and_a_second_press_interrupts_once_first() {
    let mut c = client(server(Vec::new(), Duration::ZERO));
    let mut keys = KeyIntentDetector::new(KeyConfig::default());
    let t0 = Instant::now();

    let first = c.press(&mut keys, t0, Duration::from_millis(600));
    assert_eq!(first, vec![Intent::InterruptOrCancel, Intent::StartRecording]);
    assert_eq!(c.controller.state(), SessionState::Listening);
    let first_session = c.controller.current_session().unwrap();

    let second = c.press(&mut keys, t0 + Duration::from_millis(700), Duration::from_millis(600));
    assert_eq!(second, vec![Intent::InterruptOrCancel, Intent::StartRecording]);
    assert_eq!(c.controller.state(), SessionState::Listening);
    assert!(c.controller.current_session().unwrap() > first_session);
    assert_eq!(
        c.states(),
        vec![
            SessionState::Listening,
            SessionState::Sleeping,
            SessionState::Listening
        ]
    );
}

#[tokio::test]
async fn long_press_during_a_reply_interrupts_it_exactly_once() {
    let long_reply: Vec<_> = (0..50)
        .map(|i| GeneratedUnit::Sentence(format!("Sentence {}.", i)))
        .collect();
    let mut c = client(server(long_reply, Duration::from_millis(20)));
    let mut keys = KeyIntentDetector::new(KeyConfig::default());
    let t0 = Instant::now();

    c.press(&mut keys, t0, Duration::from_millis(600));
    c.controller
        .handle(ControlEvent::Intent(Intent::StopRecording(Utterance::text("go on"))));
    assert_eq!(c.controller.state(), SessionState::Processing);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let intents = c.press(&mut keys, t0 + Duration::from_secs(1), Duration::from_millis(600));
    assert_eq!(intents, vec![Intent::InterruptOrCancel, Intent::StartRecording]);
    assert_eq!(c.controller.state(), SessionState::Listening);
    assert_eq!(c.notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reply_still_playing_at_drain_timeout_is_silenced() {
    let server = server(
        vec![GeneratedUnit::Audio(AudioChunk::tone(
            330.0,
            Duration::from_secs(1),
            RATE,
            0.2,
        ))],
        Duration::ZERO,
    );
    let mut c = client_with_drain(server, Duration::from_millis(100));
    c.say("play something long");

    c.run_until(SessionState::Sleeping).await;

    assert_eq!(c.controller.engine().queued(), 0, "nothing left to play in SLEEPING");
    assert_eq!(c.notified.load(Ordering::SeqCst), 1, "forced down the interrupt path");
}
