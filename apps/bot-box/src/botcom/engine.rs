use std::sync::Arc;
use std::time::Duration;

use arena_proto::{
    controls_value, BotId, BoxMessage, HardwareCommand, IceCandidate, OperatorMessage, SdpKind,
    SessionDescription,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::{
    CandidateGate, EngineCommand, EngineContext, EngineEvent, EngineLink, NegotiationError,
    PeerState, TARGET,
};
use crate::arena::fleet::Fleet;
use crate::media::select_tracks;

const FLUSH_GRACE: Duration = Duration::from_millis(500);

/// What the peer connection callbacks report back to the engine loop.
enum Signal {
    LocalCandidate(IceCandidate),
    IceState(RTCIceConnectionState),
    ChannelOpen(Arc<RTCDataChannel>),
    ChannelClosed,
    ChannelText(String),
}

/// Callbacks tag their signals with the attempt that registered them, so a
/// peer connection that is being torn down cannot leak into the next attempt.
struct Tagged {
    attempt: u64,
    signal: Signal,
}

struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    channel: Option<Arc<RTCDataChannel>>,
}

impl PeerSession {
    fn ice_connected(&self) -> bool {
        matches!(
            self.pc.ice_connection_state(),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
        )
    }
}

enum Lifecycle {
    Restart,
    Stop,
}

pub struct Engine {
    ctx: EngineContext,
    id: BotId,
    fleet: Fleet,
    commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::UnboundedSender<EngineEvent>,
    outbox: mpsc::Receiver<BoxMessage>,
    signals_tx: mpsc::UnboundedSender<Tagged>,
    signals: mpsc::UnboundedReceiver<Tagged>,
    attempt: u64,
    restarts: u64,
    session: Option<PeerSession>,
}

impl Engine {
    pub fn new(ctx: EngineContext, link: EngineLink) -> Self {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        Self {
            ctx,
            id: link.id,
            fleet: link.fleet,
            commands: link.commands,
            events: link.events,
            outbox: link.outbox,
            signals_tx,
            signals,
            attempt: 0,
            restarts: 0,
            session: None,
        }
    }

    pub fn id(&self) -> BotId {
        self.id
    }

    pub(crate) fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Armed, then live, then back to armed, until the slot drops its command sender.
    pub async fn run(&mut self) {
        loop {
            match self.negotiate().await {
                Lifecycle::Restart => {
                    self.restarts += 1;
                    debug!(target: TARGET, bot_id = self.id, restarts = self.restarts, "engine re-armed");
                }
                Lifecycle::Stop => {
                    self.teardown().await;
                    return;
                }
            }
        }
    }

    /// Cleans up after a panic inside `run` and tells the slot its negotiation is gone.
    pub async fn recover(&mut self) {
        self.teardown().await;
        self.restarts += 1;
        let _ = self
            .events
            .send(EngineEvent::NegotiationFailed("engine restarted".into()));
    }

    async fn negotiate(&mut self) -> Lifecycle {
        self.attempt += 1;
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Lifecycle::Stop;
                    };
                    if let Some(next) = self.on_command(command).await {
                        return next;
                    }
                }
                Some(tagged) = self.signals.recv() => {
                    if tagged.attempt == self.attempt {
                        self.on_signal(tagged.signal).await;
                    } else {
                        trace!(target: TARGET, bot_id = self.id, "ignoring signal from a previous peer");
                    }
                }
                Some(message) = self.outbox.recv(), if self.channel_open() => {
                    self.relay(message).await;
                }
            }
        }
    }

    fn channel_open(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.channel.is_some())
    }

    async fn on_command(&mut self, command: EngineCommand) -> Option<Lifecycle> {
        match command {
            EngineCommand::Description(offer) => {
                if self.session.is_some() {
                    warn!(target: TARGET, bot_id = self.id, "description while a peer is live; ignoring");
                    return None;
                }
                match self.answer(offer).await {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(target: TARGET, bot_id = self.id, error = %err, "negotiation failed");
                        self.teardown().await;
                        let _ = self
                            .events
                            .send(EngineEvent::NegotiationFailed(err.to_string()));
                        Some(Lifecycle::Restart)
                    }
                }
            }
            EngineCommand::Candidate(candidate) => {
                self.add_remote_candidate(candidate).await;
                None
            }
            EngineCommand::Quit => {
                self.ctx.hardware.send(&HardwareCommand::stop(self.id));
                self.flush_outbox().await;
                self.teardown().await;
                Some(Lifecycle::Restart)
            }
            EngineCommand::ClosePeer => {
                self.teardown().await;
                Some(Lifecycle::Restart)
            }
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::NotAnOffer(offer.kind));
        }
        let mut stale = 0;
        while self.outbox.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(target: TARGET, bot_id = self.id, stale, "discarded messages from the previous peer");
        }

        let ice_servers = if self.ctx.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ctx.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            self.ctx
                .api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await?,
        );
        self.session = Some(PeerSession {
            pc: Arc::clone(&pc),
            channel: None,
        });
        let _ = self.events.send(EngineEvent::Readiness(false));

        let gate = Arc::new(self.gate());
        self.observe(&pc, Arc::clone(&gate));

        for local in select_tracks(self.ctx.media.as_ref(), self.ctx.audio.input_enabled) {
            let transceiver = pc
                .add_transceiver_from_track(
                    local.track,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: Vec::new(),
                    }),
                )
                .await?;
            drain_rtcp(transceiver).await;
        }

        pc.set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let local = pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        let _ = self.events.send(EngineEvent::LocalDescription(SessionDescription {
            kind: SdpKind::Answer,
            sdp: local.sdp,
        }));

        let flushed = gate.open();
        info!(target: TARGET, bot_id = self.id, flushed, "answer sent");
        Ok(())
    }

    fn gate(&self) -> CandidateGate {
        let signals = self.signals_tx.clone();
        let attempt = self.attempt;
        CandidateGate::new(move |candidate| {
            let _ = signals.send(Tagged {
                attempt,
                signal: Signal::LocalCandidate(candidate),
            });
        })
    }

    fn observe(&self, pc: &RTCPeerConnection, gate: Arc<CandidateGate>) {
        let attempt = self.attempt;
        let id = self.id;

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        gate.offer(from_init(init));
                    }
                    Err(err) => {
                        warn!(target: TARGET, bot_id = id, error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let signals = self.signals_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let _ = signals.send(Tagged {
                attempt,
                signal: Signal::IceState(state),
            });
            Box::pin(async {})
        }));

        let signals = self.signals_tx.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let signals = signals.clone();
            Box::pin(async move {
                debug!(target: TARGET, bot_id = id, label = channel.label(), "data channel offered");

                let open_signals = signals.clone();
                let opened = Arc::clone(&channel);
                channel.on_open(Box::new(move || {
                    let _ = open_signals.send(Tagged {
                        attempt,
                        signal: Signal::ChannelOpen(Arc::clone(&opened)),
                    });
                    Box::pin(async {})
                }));

                let message_signals = signals.clone();
                channel.on_message(Box::new(move |message: DataChannelMessage| {
                    match String::from_utf8(message.data.to_vec()) {
                        Ok(text) => {
                            let _ = message_signals.send(Tagged {
                                attempt,
                                signal: Signal::ChannelText(text),
                            });
                        }
                        Err(err) => {
                            warn!(target: TARGET, bot_id = id, error = %err, "non-utf8 operator message");
                        }
                    }
                    Box::pin(async {})
                }));

                let close_signals = signals;
                channel.on_close(Box::new(move || {
                    let _ = close_signals.send(Tagged {
                        attempt,
                        signal: Signal::ChannelClosed,
                    });
                    Box::pin(async {})
                }));
            })
        }));

        if self.ctx.audio.output_enabled {
            let sink = Arc::clone(&self.ctx.audio_sink);
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>,
                      _receiver: Arc<RTCRtpReceiver>,
                      _transceiver: Arc<RTCRtpTransceiver>| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        if track.kind() != RTPCodecType::Audio {
                            return;
                        }
                        debug!(target: TARGET, bot_id = id, "receiving operator audio");
                        tokio::spawn(async move {
                            while let Ok((packet, _)) = track.read_rtp().await {
                                sink.accept(packet);
                            }
                        });
                    })
                },
            ));
        }
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) {
        let Some(session) = self.session.as_ref() else {
            debug!(target: TARGET, bot_id = self.id, "candidate without a peer; dropping");
            return;
        };
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        if let Err(err) = session.pc.add_ice_candidate(init).await {
            warn!(target: TARGET, bot_id = self.id, error = %err, "failed to apply remote candidate");
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::LocalCandidate(candidate) => {
                let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
            }
            Signal::IceState(state) => {
                debug!(target: TARGET, bot_id = self.id, %state, "ice connection state");
                let _ = self
                    .events
                    .send(EngineEvent::ConnectionState(PeerState::from(state)));
            }
            Signal::ChannelOpen(channel) => self.on_channel_open(channel).await,
            Signal::ChannelClosed => {
                if let Some(session) = self.session.as_mut() {
                    session.channel = None;
                }
                debug!(target: TARGET, bot_id = self.id, "data channel closed");
            }
            Signal::ChannelText(text) => self.on_operator_message(&text),
        }
    }

    async fn on_channel_open(&mut self, channel: Arc<RTCDataChannel>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.channel = Some(Arc::clone(&channel));
        info!(target: TARGET, bot_id = self.id, label = channel.label(), "data channel open");

        self.ctx.hardware.send(&HardwareCommand::start(self.id));
        send_message(
            self.id,
            &channel,
            &BoxMessage::supervisor(self.fleet.controls_allowed()),
        )
        .await;
    }

    fn on_operator_message(&self, text: &str) {
        let message = match OperatorMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: TARGET, bot_id = self.id, error = %err, "dropping operator message");
                return;
            }
        };
        match message {
            OperatorMessage::Controls { payload } => {
                if !self.fleet.controls_open() {
                    debug!(
                        target: TARGET,
                        bot_id = self.id,
                        allowed = self.fleet.controls_allowed(),
                        all_ready = self.fleet.all_ready(),
                        "controls gated; dropping"
                    );
                    return;
                }
                match controls_value(&payload) {
                    Ok(controls) => {
                        self.ctx
                            .hardware
                            .send(&HardwareCommand::controls(self.id, controls));
                    }
                    Err(err) => {
                        warn!(target: TARGET, bot_id = self.id, error = %err, "bad controls payload");
                    }
                }
            }
            OperatorMessage::Ready => {
                self.ctx.hardware.send(&HardwareCommand::start(self.id));
                let _ = self.events.send(EngineEvent::Readiness(true));
            }
            OperatorMessage::NotReady => {
                self.ctx.hardware.send(&HardwareCommand::stop(self.id));
                let _ = self.events.send(EngineEvent::Readiness(false));
            }
        }
    }

    /// Sends one outbox message to the operator. Returns `false` if it was dropped.
    async fn relay(&mut self, message: BoxMessage) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let Some(channel) = session.channel.as_ref() else {
            return false;
        };
        if !session.ice_connected() {
            debug!(target: TARGET, bot_id = self.id, ?message, "peer not connected; dropping message");
            return false;
        }
        send_message(self.id, channel, &message).await;
        true
    }

    async fn flush_outbox(&mut self) {
        let channel = match self.session.as_ref() {
            Some(session) if session.ice_connected() => session.channel.clone(),
            _ => None,
        };
        let Some(channel) = channel else {
            return;
        };
        let mut flushed = 0;
        while let Ok(message) = self.outbox.try_recv() {
            send_message(self.id, &channel, &message).await;
            flushed += 1;
        }
        if flushed == 0 {
            return;
        }
        // Give the operator a chance to receive them before the transport closes.
        let drained = timeout(FLUSH_GRACE, async {
            while channel.buffered_amount().await > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(target: TARGET, bot_id = self.id, flushed, "closing with unacknowledged messages");
        }
    }

    async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(channel) = session.channel {
            if let Err(err) = channel.close().await {
                debug!(target: TARGET, bot_id = self.id, error = %err, "data channel close failed");
            }
        }
        if session.pc.connection_state() != RTCPeerConnectionState::Closed {
            if let Err(err) = session.pc.close().await {
                debug!(target: TARGET, bot_id = self.id, error = %err, "peer close failed");
            }
        }
        debug!(target: TARGET, bot_id = self.id, "peer torn down");
    }
}

async fn send_message(id: BotId, channel: &RTCDataChannel, message: &BoxMessage) {
    let text = match message.to_text() {
        Ok(text) => text,
        Err(err) => {
            warn!(target: TARGET, bot_id = id, error = %err, "failed to encode operator message");
            return;
        }
    };
    if let Err(err) = channel.send_text(text).await {
        warn!(target: TARGET, bot_id = id, error = %err, "data channel send failed");
    }
}

// Interceptors only run if someone reads the sender's RTCP.
async fn drain_rtcp(transceiver: Arc<RTCRtpTransceiver>) {
    let sender = transceiver.sender().await;
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
