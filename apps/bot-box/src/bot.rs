//! Per-slot connection state machine: Idle, Connecting, Connected, and back.
//!
//! A `Bot` owns the slot's status and correlation id. It turns platform
//! commands into engine commands and engine events into platform
//! notifications. Wrong-state or mismatched messages are logged and ignored.

use std::sync::Arc;

use arena_proto::{
    BotId, BoxMessage, CandidateReply, DescriptionReply, IceCandidate, Outbound, SessionDescription,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::arena::fleet::{Fleet, SlotStatus};
use crate::auth::Credentials;
use crate::botcom::{EngineCommand, EngineEvent, Outbox, PeerState};
use crate::communicator::SignalingSender;

const TARGET: &str = "bot_box::bot";
pub const BOT_COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Description {
        connection_id: Option<String>,
        description: SessionDescription,
    },
    Candidate {
        connection_id: Option<String>,
        candidate: IceCandidate,
    },
    /// Platform or admin asked to end the current session.
    Disconnect,
    SupervisorChanged(bool),
    /// The signaling link came back; Idle slots announce themselves again.
    Reannounce,
}

pub struct Bot {
    id: BotId,
    credentials: Arc<Credentials>,
    signaling: SignalingSender,
    fleet: Fleet,
    outbox: Outbox,
    engine: mpsc::Sender<EngineCommand>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    commands: mpsc::Receiver<BotCommand>,
    status: SlotStatus,
    connection_id: Option<String>,
}

/// Everything a slot needs besides its id.
pub struct BotParts {
    pub credentials: Arc<Credentials>,
    pub signaling: SignalingSender,
    pub fleet: Fleet,
    pub outbox: Outbox,
    pub engine: mpsc::Sender<EngineCommand>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub commands: mpsc::Receiver<BotCommand>,
}

impl Bot {
    pub fn new(id: BotId, parts: BotParts) -> Self {
        Self {
            id,
            credentials: parts.credentials,
            signaling: parts.signaling,
            fleet: parts.fleet,
            outbox: parts.outbox,
            engine: parts.engine,
            events: parts.events,
            commands: parts.commands,
            status: SlotStatus::Idle,
            connection_id: None,
        }
    }

    pub async fn run(mut self) {
        self.announce();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
            }
        }
        debug!(target: TARGET, bot_id = self.id, "bot stopped");
    }

    fn announce(&self) {
        self.signal(Outbound::CreateConnection(self.credentials.bot_ref(self.id)));
    }

    fn signal(&self, message: Outbound) {
        let name = message.name();
        match message.to_frame() {
            Ok(frame) => {
                if !self.signaling.send(frame) {
                    debug!(target: TARGET, bot_id = self.id, action = name, "signaling frame dropped");
                }
            }
            Err(err) => {
                warn!(target: TARGET, bot_id = self.id, action = name, error = %err, "failed to encode frame");
            }
        }
    }

    fn set_status(&mut self, status: SlotStatus) {
        if self.status != status {
            debug!(target: TARGET, bot_id = self.id, from = ?self.status, to = ?status, "status change");
        }
        self.status = status;
        self.fleet.set_status(self.id, status);
    }

    async fn to_engine(&self, command: EngineCommand) {
        if self.engine.send(command).await.is_err() {
            warn!(target: TARGET, bot_id = self.id, "negotiation engine is gone");
        }
    }

    async fn on_command(&mut self, command: BotCommand) {
        match command {
            BotCommand::Description {
                connection_id,
                description,
            } => {
                if self.status != SlotStatus::Idle {
                    warn!(
                        target: TARGET,
                        bot_id = self.id,
                        status = ?self.status,
                        "description outside Idle; dropping"
                    );
                    return;
                }
                if self.connection_id.is_none() {
                    self.connection_id = connection_id;
                }
                self.set_status(SlotStatus::Connecting);
                info!(
                    target: TARGET,
                    bot_id = self.id,
                    connection_id = self.connection_id.as_deref().unwrap_or(""),
                    "negotiation started"
                );
                self.to_engine(EngineCommand::Description(description)).await;
            }
            BotCommand::Candidate {
                connection_id,
                candidate,
            } => {
                if self.status == SlotStatus::Idle {
                    debug!(target: TARGET, bot_id = self.id, "candidate while Idle; dropping");
                    return;
                }
                if connection_id != self.connection_id {
                    warn!(
                        target: TARGET,
                        bot_id = self.id,
                        expected = self.connection_id.as_deref().unwrap_or(""),
                        got = connection_id.as_deref().unwrap_or(""),
                        "candidate for another connection; dropping"
                    );
                    return;
                }
                self.to_engine(EngineCommand::Candidate(candidate)).await;
            }
            BotCommand::Disconnect => {
                if self.status == SlotStatus::Idle {
                    // Nothing to unblock, but the engine may still hold a half-open peer.
                    self.to_engine(EngineCommand::Quit).await;
                } else {
                    self.go_idle("disconnect requested").await;
                }
            }
            BotCommand::SupervisorChanged(allowed) => {
                if self.status == SlotStatus::Connected {
                    self.outbox.push(BoxMessage::supervisor(allowed));
                }
            }
            BotCommand::Reannounce => {
                if self.status == SlotStatus::Idle {
                    self.announce();
                }
            }
        }
    }

    async fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalDescription(description) => {
                self.signal(Outbound::SetDescription(DescriptionReply {
                    bot: self.credentials.bot_ref(self.id),
                    description,
                }));
            }
            EngineEvent::LocalCandidate(candidate) => {
                self.signal(Outbound::SetCandidate(CandidateReply {
                    bot: self.credentials.bot_ref(self.id),
                    candidate,
                }));
            }
            EngineEvent::ConnectionState(state) => self.on_peer_state(state).await,
            EngineEvent::Readiness(ready) => {
                if ready && self.status == SlotStatus::Idle {
                    debug!(target: TARGET, bot_id = self.id, "ready while Idle; ignoring");
                    return;
                }
                let all_ready = self.fleet.set_ready(self.id, ready);
                debug!(target: TARGET, bot_id = self.id, ready, all_ready, "readiness changed");
                self.outbox.push(BoxMessage::readiness(ready));
            }
            EngineEvent::NegotiationFailed(reason) => {
                if self.status != SlotStatus::Idle {
                    warn!(target: TARGET, bot_id = self.id, %reason, "negotiation failed");
                    self.leave(false).await;
                }
            }
        }
    }

    async fn on_peer_state(&mut self, state: PeerState) {
        if state.is_connected() {
            if self.status == SlotStatus::Connecting {
                self.set_status(SlotStatus::Connected);
                info!(target: TARGET, bot_id = self.id, "peer connected");
                self.signal(Outbound::BotConnected(self.credentials.bot_ref(self.id)));
                self.outbox.push(BoxMessage::BotConnected);
            }
        } else if state.is_lost() && self.status != SlotStatus::Idle {
            self.go_idle("peer connection lost").await;
        }
    }

    async fn go_idle(&mut self, reason: &'static str) {
        info!(target: TARGET, bot_id = self.id, reason, "returning to Idle");
        self.leave(true).await;
    }

    // `quit_engine` is false when the engine has already torn its peer down.
    async fn leave(&mut self, quit_engine: bool) {
        self.set_status(SlotStatus::Idle);
        self.connection_id = None;
        self.fleet.set_ready(self.id, false);
        self.signal(Outbound::UnblockDisconnected(
            self.credentials.bot_ref(self.id),
        ));
        if quit_engine {
            self.to_engine(EngineCommand::Quit).await;
        }
    }
}
