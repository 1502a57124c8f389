use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoError;

/// Messages an operator client sends over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorMessage {
    Controls {
        #[serde(default)]
        payload: Value,
    },
    Ready,
    NotReady,
}

impl OperatorMessage {
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(text)?;
        if let Some(tag) = value.get("type").and_then(Value::as_str) {
            if !matches!(tag, "CONTROLS" | "READY" | "NOT_READY") {
                return Err(ProtoError::UnknownAction(tag.to_string()));
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Normalizes a `CONTROLS` payload into the value embedded in a hardware command.
///
/// Clients send either an inline JSON value or a string holding JSON.
pub fn controls_value(payload: &Value) -> Result<Value, ProtoError> {
    let value = match payload {
        Value::String(text) => serde_json::from_str(text)?,
        other => other.clone(),
    };
    if value.is_null() {
        return Err(ProtoError::EmptyControls);
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlStatus {
    Allowed,
    Declined,
}

impl From<bool> for ControlStatus {
    fn from(allowed: bool) -> Self {
        if allowed {
            ControlStatus::Allowed
        } else {
            ControlStatus::Declined
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: ControlStatus,
}

/// Messages the box pushes to the connected operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoxMessage {
    DisconnectedByAdmin,
    ControlsSupervisorStatusChange(StatusPayload),
    ControlsStatusChange(StatusPayload),
    Telemetry(Value),
    BotConnected,
}

impl BoxMessage {
    pub fn supervisor(allowed: bool) -> Self {
        BoxMessage::ControlsSupervisorStatusChange(StatusPayload {
            status: allowed.into(),
        })
    }

    pub fn readiness(ready: bool) -> Self {
        BoxMessage::ControlsStatusChange(StatusPayload {
            status: ready.into(),
        })
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_operator_messages() {
        assert_eq!(
            OperatorMessage::decode(r#"{"type":"READY"}"#).unwrap(),
            OperatorMessage::Ready
        );
        assert_eq!(
            OperatorMessage::decode(r#"{"type":"NOT_READY"}"#).unwrap(),
            OperatorMessage::NotReady
        );
        assert_eq!(
            OperatorMessage::decode(r#"{"type":"CONTROLS","payload":{"left":0.5}}"#).unwrap(),
            OperatorMessage::Controls {
                payload: json!({"left": 0.5})
            }
        );
        assert!(matches!(
            OperatorMessage::decode(r#"{"type":"SELF_DESTRUCT"}"#),
            Err(ProtoError::UnknownAction(tag)) if tag == "SELF_DESTRUCT"
        ));
    }

    #[test]
    fn controls_payload_accepts_string_or_inline_json() {
        assert_eq!(
            controls_value(&json!("{\"forward\":1}")).unwrap(),
            json!({"forward": 1})
        );
        assert_eq!(
            controls_value(&json!({"forward": 1})).unwrap(),
            json!({"forward": 1})
        );
        assert!(matches!(
            controls_value(&Value::Null),
            Err(ProtoError::EmptyControls)
        ));
        assert!(controls_value(&json!("{broken")).is_err());
    }

    #[test]
    fn box_messages_serialize_with_type_tag() {
        assert_eq!(
            serde_json::to_value(BoxMessage::DisconnectedByAdmin).unwrap(),
            json!({"type": "DISCONNECTED_BY_ADMIN"})
        );
        assert_eq!(
            serde_json::to_value(BoxMessage::supervisor(false)).unwrap(),
            json!({"type": "CONTROLS_SUPERVISOR_STATUS_CHANGE", "payload": {"status": "DECLINED"}})
        );
        assert_eq!(
            serde_json::to_value(BoxMessage::readiness(true)).unwrap(),
            json!({"type": "CONTROLS_STATUS_CHANGE", "payload": {"status": "ALLOWED"}})
        );
        assert_eq!(
            serde_json::to_value(BoxMessage::Telemetry(json!({"id": 1, "v": 3}))).unwrap(),
            json!({"type": "TELEMETRY", "payload": {"id": 1, "v": 3}})
        );
    }
}
