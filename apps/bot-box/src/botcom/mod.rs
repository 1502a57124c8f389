//! Peer negotiation engine, one per bot slot.
//!
//! The engine answers remote offers, trickles ICE candidates in both
//! directions and serves the operator data channel. It lives as long as the
//! process: after every quit it re-arms for the next negotiation, and a
//! supervisor restarts it if it panics. Slots talk to it only through
//! [`EngineLink`] channels, which is also the seam tests use to replace it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arena_proto::{BotId, BoxMessage, IceCandidate, SdpKind, SessionDescription};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::arena::fleet::Fleet;
use crate::config::AudioSettings;
use crate::hardware::CommandSink;
use crate::media::{AudioSink, MediaSource};

mod engine;
pub mod gate;

pub use engine::Engine;
pub use gate::CandidateGate;

pub(crate) const TARGET: &str = "bot_box::botcom";
pub const OUTBOX_CAPACITY: usize = 64;
pub const ENGINE_COMMAND_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("expected an offer, got {0:?}")]
    NotAnOffer(SdpKind),
    #[error("peer connection has no local description after answering")]
    MissingLocalDescription,
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Description(SessionDescription),
    Candidate(IceCandidate),
    /// Halt the robot, flush pending operator messages, close the peer and re-arm.
    Quit,
    /// Close the peer and re-arm without touching the robot or the outbox.
    ClosePeer,
}

/// ICE connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Completed)
    }

    pub fn is_lost(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

impl From<RTCIceConnectionState> for PeerState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => PeerState::Checking,
            RTCIceConnectionState::Connected => PeerState::Connected,
            RTCIceConnectionState::Completed => PeerState::Completed,
            RTCIceConnectionState::Disconnected => PeerState::Disconnected,
            RTCIceConnectionState::Failed => PeerState::Failed,
            RTCIceConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    ConnectionState(PeerState),
    Readiness(bool),
    NegotiationFailed(String),
}

/// Outbound queue of operator-bound messages for one slot.
///
/// Bounded; when full the new message is dropped.
#[derive(Clone, Debug)]
pub struct Outbox {
    id: BotId,
    tx: mpsc::Sender<BoxMessage>,
}

impl Outbox {
    pub fn channel(id: BotId) -> (Self, mpsc::Receiver<BoxMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Self { id, tx }, rx)
    }

    pub fn push(&self, message: BoxMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(target: TARGET, bot_id = self.id, ?message, "outbox full; dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: TARGET, bot_id = self.id, "engine gone; dropping message");
                false
            }
        }
    }
}

/// Engine end of a slot's channels.
pub struct EngineLink {
    pub id: BotId,
    pub fleet: Fleet,
    pub commands: mpsc::Receiver<EngineCommand>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub outbox: mpsc::Receiver<BoxMessage>,
}

/// Starts the engine task for one slot.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, link: EngineLink) -> JoinHandle<()>;
}

/// Shared dependencies of every WebRTC engine.
#[derive(Clone)]
pub struct EngineContext {
    pub api: Arc<API>,
    pub ice_servers: Vec<String>,
    pub media: Arc<dyn MediaSource>,
    pub audio: AudioSettings,
    pub audio_sink: Arc<dyn AudioSink>,
    pub hardware: CommandSink,
}

pub struct WebRtcLauncher {
    ctx: EngineContext,
}

impl WebRtcLauncher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }
}

impl EngineLauncher for WebRtcLauncher {
    fn launch(&self, link: EngineLink) -> JoinHandle<()> {
        tokio::spawn(supervise(Engine::new(self.ctx.clone(), link)))
    }
}

/// Runs the engine until its command channel closes, recovering from panics.
pub async fn supervise(mut engine: Engine) {
    loop {
        match AssertUnwindSafe(engine.run()).catch_unwind().await {
            Ok(()) => break,
            Err(_) => {
                error!(target: TARGET, bot_id = engine.id(), "negotiation engine panicked; restarting");
                engine.recover().await;
            }
        }
    }
    debug!(target: TARGET, bot_id = engine.id(), restarts = engine.restarts(), "negotiation engine stopped");
}
