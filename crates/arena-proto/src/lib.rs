//! Wire definitions shared by the bot box and anything that talks to it.
//!
//! Three conversations are modelled here: the signaling envelope exchanged
//! with the platform, the envelope spoken over each operator data channel,
//! and the line records exchanged with the robot hardware. Nothing in this
//! crate performs I/O.

use thiserror::Error;

pub mod hardware;
pub mod peer;
pub mod signal;

pub use hardware::{HardwareCommand, TelemetryRecord};
pub use peer::{controls_value, BoxMessage, ControlStatus, OperatorMessage, StatusPayload};
pub use signal::{
    ArenaConfig, BotRef, CandidateReply, DescriptionReply, IceCandidate, Inbound, Outbound,
    ReadinessReply, SdpKind, SessionDescription,
};

/// Index of a bot slot, `0..n_bots`.
pub type BotId = usize;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {action} payload: {source}")]
    Payload {
        action: String,
        source: serde_json::Error,
    },
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("action {action} requires a bot id")]
    MissingBotId { action: String },
    #[error("invalid bot id {0}")]
    InvalidBotId(i64),
    #[error("controls payload is empty")]
    EmptyControls,
}
