use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{BotId, ProtoError};

/// A command addressed to one robot unit: `{"address": 1, "controls": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCommand {
    pub address: BotId,
    pub controls: Value,
}

impl HardwareCommand {
    pub fn start(address: BotId) -> Self {
        Self {
            address,
            controls: json!({ "start": true }),
        }
    }

    pub fn stop(address: BotId) -> Self {
        Self {
            address,
            controls: json!({ "stop": true }),
        }
    }

    pub fn controls(address: BotId, controls: Value) -> Self {
        Self { address, controls }
    }

    /// Single-line JSON, without the trailing newline the transports add.
    pub fn to_line(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct Addressed {
    id: i64,
}

/// A telemetry line from the hardware, addressed by its `id` field.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub id: BotId,
    pub body: Value,
}

impl TelemetryRecord {
    /// Strips control characters and parses the line. The full object is kept as the body.
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        let clean = sanitize(line);
        let body: Value = serde_json::from_str(&clean)?;
        let addressed: Addressed = serde_json::from_value(body.clone())?;
        let id = BotId::try_from(addressed.id).map_err(|_| ProtoError::InvalidBotId(addressed.id))?;
        Ok(Self { id, body })
    }
}

fn sanitize(line: &str) -> String {
    line.chars().filter(|c| !c.is_control()).collect()
}
