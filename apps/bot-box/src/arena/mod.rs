//! Session orchestrator.
//!
//! Waits for the platform to configure the arena, starts one connection
//! state machine and one negotiation engine per bot slot, then routes every
//! signaling frame to the slot it addresses and every telemetry line to the
//! operator of the robot it came from.

use std::sync::Arc;
use std::time::Duration;

use arena_proto::{
    ArenaConfig, BotId, BoxMessage, Inbound, Outbound, ProtoError, ReadinessReply,
    TelemetryRecord,
};
use futures_util::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::Credentials;
use crate::bot::{Bot, BotCommand, BotParts, BOT_COMMAND_CAPACITY};
use crate::botcom::{EngineCommand, EngineLauncher, EngineLink, Outbox, ENGINE_COMMAND_CAPACITY};
use crate::communicator::{LinkStatus, SignalingParts, SignalingSender};

pub mod fleet;

use fleet::{Fleet, SlotStatus};

const TARGET: &str = "bot_box::arena";
const SLOT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on `nBots`; larger configs are rejected at startup.
pub const MAX_BOTS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("platform requested an arena restart")]
    RestartRequested,
    #[error("signaling transport closed")]
    SignalingClosed,
    #[error("invalid arena config: {0}")]
    InvalidConfig(String),
}

struct Slot {
    bot: mpsc::Sender<BotCommand>,
    engine: mpsc::Sender<EngineCommand>,
    outbox: Outbox,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Arena {
    credentials: Arc<Credentials>,
    signaling: SignalingSender,
    status: watch::Receiver<LinkStatus>,
    inbound: mpsc::UnboundedReceiver<String>,
    telemetry: Option<mpsc::Receiver<String>>,
    launcher: Arc<dyn EngineLauncher>,
}

impl Arena {
    /// `telemetry` is `None` when the hardware transport produces no telemetry.
    pub fn new(
        credentials: Arc<Credentials>,
        signaling: SignalingParts,
        telemetry: Option<mpsc::Receiver<String>>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Self {
        Self {
            credentials,
            signaling: signaling.sender,
            status: signaling.status,
            inbound: signaling.inbound,
            telemetry,
            launcher,
        }
    }

    /// Runs until the platform asks for a restart or the signaling task goes away.
    pub async fn run(mut self) -> Result<(), ArenaError> {
        self.status
            .wait_for(|status| *status == LinkStatus::Connected)
            .await
            .map_err(|_| ArenaError::SignalingClosed)?;
        info!(target: TARGET, "signaling connected; waiting for arena config");

        let config = self.wait_for_config().await?;
        info!(
            target: TARGET,
            n_bots = config.n_bots,
            controls_allowed = config.are_controls_allowed,
            "arena configured"
        );
        let fleet = Fleet::new(config.n_bots, config.are_controls_allowed);
        let slots = (0..config.n_bots)
            .map(|id| self.start_slot(id, &fleet))
            .collect::<Vec<_>>();

        let result = self.route(&fleet, &slots).await;
        stop_slots(slots).await;
        result
    }

    async fn wait_for_config(&mut self) -> Result<ArenaConfig, ArenaError> {
        while let Some(frame) = self.inbound.recv().await {
            match Inbound::decode(&frame) {
                Ok(Inbound::ArenaConfig(config)) => return validate(config),
                Ok(Inbound::RestartArenaApp) => return Err(ArenaError::RestartRequested),
                Err(ProtoError::Payload { action, source }) if action == "ARENA_CONFIG" => {
                    return Err(ArenaError::InvalidConfig(source.to_string()));
                }
                Ok(other) => {
                    debug!(target: TARGET, action = other.action(), "arena not configured yet; ignoring");
                }
                Err(err) => {
                    warn!(target: TARGET, error = %err, "dropping malformed signaling frame");
                }
            }
        }
        Err(ArenaError::SignalingClosed)
    }

    fn start_slot(&self, id: BotId, fleet: &Fleet) -> Slot {
        let (bot_tx, bot_rx) = mpsc::channel(BOT_COMMAND_CAPACITY);
        let (engine_tx, engine_rx) = mpsc::channel(ENGINE_COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbox, outbox_rx) = Outbox::channel(id);

        let engine = self.launcher.launch(EngineLink {
            id,
            fleet: fleet.clone(),
            commands: engine_rx,
            events: events_tx,
            outbox: outbox_rx,
        });
        let bot = Bot::new(
            id,
            BotParts {
                credentials: Arc::clone(&self.credentials),
                signaling: self.signaling.clone(),
                fleet: fleet.clone(),
                outbox: outbox.clone(),
                engine: engine_tx.clone(),
                events: events_rx,
                commands: bot_rx,
            },
        );
        let bot = tokio::spawn(bot.run());

        Slot {
            bot: bot_tx,
            engine: engine_tx,
            outbox,
            tasks: vec![bot, engine],
        }
    }

    async fn route(&mut self, fleet: &Fleet, slots: &[Slot]) -> Result<(), ArenaError> {
        loop {
            tokio::select! {
                frame = self.inbound.recv() => {
                    let Some(frame) = frame else {
                        return Err(ArenaError::SignalingClosed);
                    };
                    self.dispatch(&frame, fleet, slots).await?;
                }
                line = next_line(&mut self.telemetry) => match line {
                    Some(line) => relay_telemetry(&line, fleet, slots),
                    None => {
                        warn!(target: TARGET, "hardware telemetry stream ended");
                        self.telemetry = None;
                    }
                },
                changed = self.status.changed() => {
                    if changed.is_err() {
                        return Err(ArenaError::SignalingClosed);
                    }
                    let status = *self.status.borrow_and_update();
                    debug!(target: TARGET, ?status, "signaling status");
                    if status == LinkStatus::Connected {
                        broadcast(slots, BotCommand::Reannounce).await;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, frame: &str, fleet: &Fleet, slots: &[Slot]) -> Result<(), ArenaError> {
        let message = match Inbound::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: TARGET, error = %err, "dropping malformed signaling frame");
                return Ok(());
            }
        };
        trace!(target: TARGET, action = message.action(), "inbound");

        match message {
            Inbound::RestartArenaApp => {
                warn!(target: TARGET, "restart requested by the platform");
                return Err(ArenaError::RestartRequested);
            }
            Inbound::ArenaConfig(_) => {
                warn!(target: TARGET, "arena already configured; ignoring ARENA_CONFIG");
            }
            Inbound::DisconnectAll => {
                info!(target: TARGET, "disconnecting every bot");
                for slot in slots {
                    slot.outbox.push(BoxMessage::DisconnectedByAdmin);
                    send(slot, BotCommand::Disconnect).await;
                }
            }
            Inbound::ToggleControls {
                are_controls_allowed,
            } => {
                info!(target: TARGET, allowed = are_controls_allowed, "supervisor toggled controls");
                fleet.set_controls_allowed(are_controls_allowed);
                broadcast(slots, BotCommand::SupervisorChanged(are_controls_allowed)).await;
            }
            Inbound::SetDescription {
                id,
                connection_id,
                description,
            } => {
                if let Some(slot) = slots.get(id) {
                    send(
                        slot,
                        BotCommand::Description {
                            connection_id,
                            description,
                        },
                    )
                    .await;
                }
            }
            Inbound::SetCandidate {
                id,
                connection_id,
                candidate,
            } => {
                if let Some(slot) = slots.get(id) {
                    send(
                        slot,
                        BotCommand::Candidate {
                            connection_id,
                            candidate,
                        },
                    )
                    .await;
                }
            }
            Inbound::DisconnectBot { id } => {
                if let Some(slot) = slots.get(id) {
                    send(slot, BotCommand::Disconnect).await;
                }
            }
            Inbound::IsBotReadyForConnection { id } => {
                if let Some(status) = fleet.status(id) {
                    self.reply_readiness(id, status == SlotStatus::Idle);
                }
            }
        }
        Ok(())
    }

    fn reply_readiness(&self, id: BotId, is_ready: bool) {
        let reply = Outbound::BotIsReadyForConnection(ReadinessReply {
            bot: self.credentials.bot_ref(id),
            is_ready,
        });
        match reply.to_frame() {
            Ok(frame) => {
                if !self.signaling.send(frame) {
                    debug!(target: TARGET, bot_id = id, "readiness reply dropped");
                }
            }
            Err(err) => warn!(target: TARGET, bot_id = id, error = %err, "failed to encode readiness reply"),
        }
    }
}

fn validate(config: ArenaConfig) -> Result<ArenaConfig, ArenaError> {
    match config.n_bots {
        0 => Err(ArenaError::InvalidConfig("nBots must be at least 1".into())),
        n if n > MAX_BOTS => Err(ArenaError::InvalidConfig(format!(
            "nBots is {n}, at most {MAX_BOTS} are supported"
        ))),
        _ => Ok(config),
    }
}

async fn next_line(telemetry: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match telemetry {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn relay_telemetry(line: &str, fleet: &Fleet, slots: &[Slot]) {
    let record = match TelemetryRecord::parse(line) {
        Ok(record) => record,
        Err(err) => {
            debug!(target: TARGET, error = %err, "dropping malformed telemetry");
            return;
        }
    };
    let Some(slot) = slots.get(record.id) else {
        debug!(target: TARGET, bot_id = record.id, "telemetry for an unknown bot; dropping");
        return;
    };
    if fleet.status(record.id) != Some(SlotStatus::Connected) {
        trace!(target: TARGET, bot_id = record.id, "bot not connected; dropping telemetry");
        return;
    }
    slot.outbox.push(BoxMessage::Telemetry(record.body));
}

async fn send(slot: &Slot, command: BotCommand) {
    if slot.bot.send(command).await.is_err() {
        warn!(target: TARGET, "bot task is gone; dropping command");
    }
}

async fn broadcast(slots: &[Slot], command: BotCommand) {
    for slot in slots {
        send(slot, command.clone()).await;
    }
}

async fn stop_slots(slots: Vec<Slot>) {
    let mut tasks = Vec::new();
    for (id, slot) in slots.into_iter().enumerate() {
        if let Err(TrySendError::Full(_)) = slot.engine.try_send(EngineCommand::ClosePeer) {
            warn!(target: TARGET, bot_id = id, "engine queue full; peer not closed");
        }
        tasks.extend(slot.tasks);
    }

    let aborts = tasks.iter().map(JoinHandle::abort_handle).collect::<Vec<_>>();
    match tokio::time::timeout(SLOT_STOP_GRACE, join_all(tasks)).await {
        Ok(results) => {
            for err in results.into_iter().filter_map(Result::err) {
                warn!(target: TARGET, error = %err, "slot task ended abnormally");
            }
        }
        Err(_) => {
            warn!(target: TARGET, "slot tasks did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
