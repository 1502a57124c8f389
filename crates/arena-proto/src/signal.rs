use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BotId, ProtoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the browser's JSON shape (`{"type": "offer", "sdp": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaConfig {
    pub are_controls_allowed: bool,
    pub n_bots: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleControls {
    are_controls_allowed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DescriptionData {
    Bare(SessionDescription),
    Wrapped {
        #[serde(rename = "sessionDescription")]
        inner: SessionDescription,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CandidateData {
    Bare(IceCandidate),
    Wrapped {
        #[serde(rename = "iceCandidate")]
        inner: IceCandidate,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    action: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default, alias = "connectionID", alias = "ConnectionID")]
    connection_id: Option<String>,
}

/// Every action the platform may send, decoded once at the socket boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    RestartArenaApp,
    ArenaConfig(ArenaConfig),
    DisconnectAll,
    ToggleControls {
        are_controls_allowed: bool,
    },
    SetDescription {
        id: BotId,
        connection_id: Option<String>,
        description: SessionDescription,
    },
    SetCandidate {
        id: BotId,
        connection_id: Option<String>,
        candidate: IceCandidate,
    },
    IsBotReadyForConnection {
        id: BotId,
    },
    DisconnectBot {
        id: BotId,
    },
}

impl Inbound {
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        let raw: RawInbound = serde_json::from_str(text)?;
        let action = raw.action.as_str();
        let message = match action {
            "RESTART_ARENA_APP" => Inbound::RestartArenaApp,
            "ARENA_CONFIG" => Inbound::ArenaConfig(payload(action, &raw.data)?),
            "DISCONNECT_ALL" => Inbound::DisconnectAll,
            "TOGGLE_CONTROLS" => {
                let toggle: ToggleControls = payload(action, &raw.data)?;
                Inbound::ToggleControls {
                    are_controls_allowed: toggle.are_controls_allowed,
                }
            }
            "SET_DESCRIPTION" => {
                let description = match payload::<DescriptionData>(action, &raw.data)? {
                    DescriptionData::Bare(inner) | DescriptionData::Wrapped { inner } => inner,
                };
                Inbound::SetDescription {
                    id: bot_id(action, raw.id)?,
                    connection_id: raw.connection_id,
                    description,
                }
            }
            "SET_CANDIDATE" => {
                let candidate = match payload::<CandidateData>(action, &raw.data)? {
                    CandidateData::Bare(inner) | CandidateData::Wrapped { inner } => inner,
                };
                Inbound::SetCandidate {
                    id: bot_id(action, raw.id)?,
                    connection_id: raw.connection_id,
                    candidate,
                }
            }
            "IS_BOT_READY_FOR_CONNECTION" => Inbound::IsBotReadyForConnection {
                id: bot_id(action, raw.id)?,
            },
            "DISCONNECT_BOT" => Inbound::DisconnectBot {
                id: bot_id(action, raw.id)?,
            },
            other => return Err(ProtoError::UnknownAction(other.to_string())),
        };
        Ok(message)
    }

    pub fn action(&self) -> &'static str {
        match self {
            Inbound::RestartArenaApp => "RESTART_ARENA_APP",
            Inbound::ArenaConfig(_) => "ARENA_CONFIG",
            Inbound::DisconnectAll => "DISCONNECT_ALL",
            Inbound::ToggleControls { .. } => "TOGGLE_CONTROLS",
            Inbound::SetDescription { .. } => "SET_DESCRIPTION",
            Inbound::SetCandidate { .. } => "SET_CANDIDATE",
            Inbound::IsBotReadyForConnection { .. } => "IS_BOT_READY_FOR_CONNECTION",
            Inbound::DisconnectBot { .. } => "DISCONNECT_BOT",
        }
    }
}

// `data` is normally a string holding JSON, but an inline object is accepted too.
fn payload<T: DeserializeOwned>(action: &str, data: &Value) -> Result<T, ProtoError> {
    let decoded = match data {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    decoded.map_err(|source| ProtoError::Payload {
        action: action.to_string(),
        source,
    })
}

fn bot_id(action: &str, id: Option<i64>) -> Result<BotId, ProtoError> {
    let id = id.ok_or_else(|| ProtoError::MissingBotId {
        action: action.to_string(),
    })?;
    BotId::try_from(id).map_err(|_| ProtoError::InvalidBotId(id))
}

/// Identity block carried by every per-bot notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotRef {
    pub token: String,
    pub public_key: String,
    pub id: BotId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionReply {
    #[serde(flatten)]
    pub bot: BotRef,
    pub description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateReply {
    #[serde(flatten)]
    pub bot: BotRef,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReply {
    #[serde(flatten)]
    pub bot: BotRef,
    pub is_ready: bool,
}

/// Frames the box sends to the platform: `{"name": ACTION, "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    CreateConnection(BotRef),
    SetDescription(DescriptionReply),
    SetCandidate(CandidateReply),
    BotConnected(BotRef),
    UnblockDisconnected(BotRef),
    BotIsReadyForConnection(ReadinessReply),
}

impl Outbound {
    pub fn to_frame(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outbound::CreateConnection(_) => "CREATE_CONNECTION",
            Outbound::SetDescription(_) => "SET_DESCRIPTION",
            Outbound::SetCandidate(_) => "SET_CANDIDATE",
            Outbound::BotConnected(_) => "BOT_CONNECTED",
            Outbound::UnblockDisconnected(_) => "UNBLOCK_DISCONNECTED",
            Outbound::BotIsReadyForConnection(_) => "BOT_IS_READY_FOR_CONNECTION",
        }
    }
}
