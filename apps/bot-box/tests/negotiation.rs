use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_proto::{BoxMessage, IceCandidate, SdpKind, SessionDescription};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use bot_box::arena::fleet::Fleet;
use bot_box::botcom::{
    supervise, Engine, EngineCommand, EngineContext, EngineEvent, EngineLink, Outbox,
};
use bot_box::config::AudioSettings;
use bot_box::hardware::CommandSink;
use bot_box::media::{build_api, DiscardAudio, LocalTrack, MediaSource, StaticTracks};

const WAIT: Duration = Duration::from_secs(15);

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

struct EngineUnderTest {
    commands: mpsc::Sender<EngineCommand>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    outbox: Outbox,
    hardware: mpsc::Receiver<String>,
    fleet: Fleet,
    task: JoinHandle<()>,
}

fn start_engine() -> EngineUnderTest {
    start_engine_with(Arc::new(StaticTracks::new("bot-box-test")))
}

fn start_engine_with(media: Arc<dyn MediaSource>) -> EngineUnderTest {
    let (hardware_sink, hardware) = CommandSink::channel(32);
    let ctx = EngineContext {
        api: Arc::new(build_api().expect("webrtc api")),
        ice_servers: Vec::new(),
        media,
        audio: AudioSettings::default(),
        audio_sink: Arc::new(DiscardAudio::default()),
        hardware: hardware_sink,
    };
    let fleet = Fleet::new(1, true);
    let (commands, commands_rx) = mpsc::channel(16);
    let (events_tx, events) = mpsc::unbounded_channel();
    let (outbox, outbox_rx) = Outbox::channel(0);
    let engine = Engine::new(
        ctx,
        EngineLink {
            id: 0,
            fleet: fleet.clone(),
            commands: commands_rx,
            events: events_tx,
            outbox: outbox_rx,
        },
    );
    EngineUnderTest {
        commands,
        events,
        outbox,
        hardware,
        fleet,
        task: tokio::spawn(supervise(engine)),
    }
}

/// Crashes the first negotiation that asks it for tracks.
struct CrashOnce {
    tracks: StaticTracks,
    armed: AtomicBool,
}

impl MediaSource for CrashOnce {
    fn tracks(&self) -> Vec<LocalTrack> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("capture pipeline crashed");
        }
        self.tracks.tracks()
    }
}

/// The operator side: a plain offerer with one data channel.
struct Operator {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    opened: mpsc::UnboundedReceiver<()>,
    messages: mpsc::UnboundedReceiver<Value>,
    candidates: mpsc::UnboundedReceiver<RTCIceCandidateInit>,
}

impl Operator {
    async fn new() -> Self {
        let api = build_api().expect("webrtc api");
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("operator peer"),
        );

        let (candidates_tx, candidates) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                let _ = candidates_tx.send(init);
            }
            Box::pin(async {})
        }));

        let channel = pc
            .create_data_channel("controls", None)
            .await
            .expect("data channel");
        let (opened_tx, opened) = mpsc::unbounded_channel();
        channel.on_open(Box::new(move || {
            let _ = opened_tx.send(());
            Box::pin(async {})
        }));
        let (messages_tx, messages) = mpsc::unbounded_channel();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            if let Ok(value) = serde_json::from_slice::<Value>(&message.data) {
                let _ = messages_tx.send(value);
            }
            Box::pin(async {})
        }));

        Self {
            pc,
            channel,
            opened,
            messages,
            candidates,
        }
    }

    async fn offer(&self) -> SessionDescription {
        let offer = self.pc.create_offer(None).await.expect("create offer");
        self.pc
            .set_local_description(offer.clone())
            .await
            .expect("set local offer");
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        }
    }

    async fn say(&self, message: Value) {
        self.channel
            .send_text(message.to_string())
            .await
            .expect("operator send");
    }
}

/// Plays the signaling server between the engine and the operator until `until` matches.
async fn pump<F>(bot: &mut EngineUnderTest, operator: &mut Operator, mut until: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    loop {
        tokio::select! {
            event = bot.events.recv() => {
                let event = event.expect("engine events");
                if let EngineEvent::LocalCandidate(candidate) = &event {
                    operator
                        .pc
                        .add_ice_candidate(RTCIceCandidateInit {
                            candidate: candidate.candidate.clone(),
                            sdp_mid: candidate.sdp_mid.clone(),
                            sdp_mline_index: candidate.sdp_mline_index,
                            username_fragment: candidate.username_fragment.clone(),
                        })
                        .await
                        .expect("operator applies candidate");
                }
                if until(&event) {
                    return event;
                }
            }
            Some(init) = operator.candidates.recv() => {
                bot.commands
                    .send(EngineCommand::Candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }))
                    .await
                    .expect("engine commands");
            }
        }
    }
}

async fn next_hardware(bot: &mut EngineUnderTest) -> Value {
    let line = within(bot.hardware.recv()).await.expect("hardware line");
    serde_json::from_str(&line).expect("hardware json")
}

#[tokio::test]
async fn answers_connects_and_serves_the_operator() {
    init_tracing();
    let mut bot = start_engine();
    let mut operator = Operator::new().await;

    bot.outbox.push(BoxMessage::DisconnectedByAdmin);
    let offer = operator.offer().await;
    bot.commands
        .send(EngineCommand::Description(offer))
        .await
        .unwrap();

    assert_eq!(
        within(bot.events.recv()).await,
        Some(EngineEvent::Readiness(false))
    );
    let answer = match within(bot.events.recv()).await {
        Some(EngineEvent::LocalDescription(answer)) => answer,
        other => panic!("expected the answer before any candidate, got {other:?}"),
    };
    assert_eq!(answer.kind, SdpKind::Answer);
    operator
        .pc
        .set_remote_description(RTCSessionDescription::answer(answer.sdp).unwrap())
        .await
        .expect("operator applies answer");

    within(pump(&mut bot, &mut operator, |event| {
        matches!(event, EngineEvent::ConnectionState(state) if state.is_connected())
    }))
    .await;
    within(operator.opened.recv()).await.expect("channel open");

    // Opening the channel enables the robot and reports the supervisor flag.
    assert_eq!(
        within(operator.messages.recv()).await,
        Some(json!({"type": "CONTROLS_SUPERVISOR_STATUS_CHANGE", "payload": {"status": "ALLOWED"}}))
    );
    assert_eq!(next_hardware(&mut bot).await, json!({"address": 0, "controls": {"start": true}}));

    operator.say(json!({"type": "READY"})).await;
    let ready = within(pump(&mut bot, &mut operator, |event| {
        matches!(event, EngineEvent::Readiness(_))
    }))
    .await;
    assert_eq!(ready, EngineEvent::Readiness(true));
    assert_eq!(next_hardware(&mut bot).await, json!({"address": 0, "controls": {"start": true}}));

    // The fleet gate is closed until the slot's readiness is recorded.
    operator.say(json!({"type": "CONTROLS", "payload": {"n": 1}})).await;
    sleep(Duration::from_millis(200)).await;
    bot.fleet.set_ready(0, true);
    operator.say(json!({"type": "CONTROLS", "payload": "{\"n\":2}"})).await;
    assert_eq!(next_hardware(&mut bot).await, json!({"address": 0, "controls": {"n": 2}}));

    // Stale message from before the offer was discarded; fresh ones are relayed.
    bot.outbox.push(BoxMessage::Telemetry(json!({"id": 0, "speed": 4})));
    assert_eq!(
        within(operator.messages.recv()).await,
        Some(json!({"type": "TELEMETRY", "payload": {"id": 0, "speed": 4}}))
    );

    operator.say(json!({"type": "NOT_READY"})).await;
    let not_ready = within(pump(&mut bot, &mut operator, |event| {
        matches!(event, EngineEvent::Readiness(_))
    }))
    .await;
    assert_eq!(not_ready, EngineEvent::Readiness(false));
    assert_eq!(next_hardware(&mut bot).await, json!({"address": 0, "controls": {"stop": true}}));

    // Quit halts the robot and re-arms for the next operator.
    bot.commands.send(EngineCommand::Quit).await.unwrap();
    assert_eq!(next_hardware(&mut bot).await, json!({"address": 0, "controls": {"stop": true}}));

    let second = Operator::new().await;
    bot.commands
        .send(EngineCommand::Description(second.offer().await))
        .await
        .unwrap();
    let rearmed = within(async {
        loop {
            match bot.events.recv().await {
                Some(EngineEvent::LocalDescription(answer)) => return answer,
                Some(_) => continue,
                None => panic!("engine stopped"),
            }
        }
    })
    .await;
    assert_eq!(rearmed.kind, SdpKind::Answer);

    drop(bot.commands);
    within(bot.task).await.expect("engine task");
    let _ = operator.pc.close().await;
    let _ = second.pc.close().await;
}

#[tokio::test]
async fn rejects_answers_in_place_of_offers() {
    init_tracing();
    let mut bot = start_engine();
    bot.commands
        .send(EngineCommand::Description(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0".into(),
        }))
        .await
        .unwrap();
    match within(bot.events.recv()).await {
        Some(EngineEvent::NegotiationFailed(reason)) => assert!(reason.contains("offer")),
        other => panic!("expected a negotiation failure, got {other:?}"),
    }

    // Still armed: a candidate without a peer is ignored, a quit is harmless.
    bot.commands
        .send(EngineCommand::Candidate(IceCandidate::default()))
        .await
        .unwrap();
    bot.commands.send(EngineCommand::Quit).await.unwrap();
    assert_eq!(next_hardware(&mut bot).await, json!({"address": 0, "controls": {"stop": true}}));

    drop(bot.commands);
    within(bot.task).await.expect("engine task");
}

#[tokio::test]
async fn restarts_after_a_panic_and_answers_again() {
    init_tracing();
    let mut bot = start_engine_with(Arc::new(CrashOnce {
        tracks: StaticTracks::new("bot-box-test"),
        armed: AtomicBool::new(true),
    }));

    let first = Operator::new().await;
    bot.commands
        .send(EngineCommand::Description(first.offer().await))
        .await
        .unwrap();
    assert_eq!(
        within(bot.events.recv()).await,
        Some(EngineEvent::Readiness(false))
    );
    match within(bot.events.recv()).await {
        Some(EngineEvent::NegotiationFailed(reason)) => assert!(reason.contains("restarted")),
        other => panic!("expected the restart to be reported, got {other:?}"),
    }

    let second = Operator::new().await;
    bot.commands
        .send(EngineCommand::Description(second.offer().await))
        .await
        .unwrap();
    assert_eq!(
        within(bot.events.recv()).await,
        Some(EngineEvent::Readiness(false))
    );
    match within(bot.events.recv()).await {
        Some(EngineEvent::LocalDescription(answer)) => assert_eq!(answer.kind, SdpKind::Answer),
        other => panic!("expected an answer after the restart, got {other:?}"),
    }

    drop(bot.commands);
    within(bot.task).await.expect("engine task");
    let _ = first.pc.close().await;
    let _ = second.pc.close().await;
}
