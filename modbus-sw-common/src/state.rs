use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Kind of entity exposed to the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Discrete output, surfaced as a switch.
    Coil,
    /// Input register, surfaced as a sensor.
    Input,
}

impl EntityKind {
    /// Get the string representation used in unique ids and key expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Coil => "coil",
            EntityKind::Input => "input",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current value of an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    /// Coil on/off state.
    Switch(bool),
    /// Input register value widened to float.
    Measurement(f64),
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Switch(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Measurement(v)
    }
}

/// Snapshot of an entity's state, published to the host on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    /// Unix epoch milliseconds when the state was captured.
    pub timestamp: i64,

    /// Globally unique identifier (e.g. `modbus_sw-P1-5-coil3`).
    pub unique_id: String,

    /// Human-readable name from configuration.
    pub name: String,

    /// Entity kind.
    pub kind: EntityKind,

    /// Owning port name.
    pub port: String,

    /// Owning device slave address.
    pub slave_id: u8,

    /// Coil or register address.
    pub address: u16,

    /// The current value.
    pub value: StateValue,

    /// Unit of measurement (inputs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Measurement class (inputs only), e.g. "temperature".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    /// State class (inputs only), e.g. "measurement".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
}

impl EntityState {
    /// Key suffix under the bridge prefix: `<port>/<slave>/<kind><address>`.
    pub fn key_suffix(&self) -> String {
        format!(
            "{}/{}/{}{}",
            self.port,
            self.slave_id,
            self.kind.as_str(),
            self.address
        )
    }
}

/// A host request to switch a coil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCommand {
    On,
    Off,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandPayload {
    Flag(bool),
    Number(u8),
    Word(String),
    Object { on: bool },
}

impl SwitchCommand {
    /// The coil value this command asks for.
    pub fn value(self) -> bool {
        matches!(self, SwitchCommand::On)
    }

    /// Parse a command payload.
    ///
    /// Accepts `true`/`false`, `1`/`0`, `"on"`/`"off"` (quoted or bare,
    /// case-insensitive) and `{ "on": bool }`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::Command(format!("payload is not UTF-8: {}", e)))?
            .trim();

        if let Some(command) = Self::from_word(text) {
            return Ok(command);
        }

        match serde_json::from_str::<CommandPayload>(text) {
            Ok(CommandPayload::Flag(on)) | Ok(CommandPayload::Object { on }) => {
                Ok(Self::from(on))
            }
            Ok(CommandPayload::Number(0)) => Ok(SwitchCommand::Off),
            Ok(CommandPayload::Number(1)) => Ok(SwitchCommand::On),
            Ok(CommandPayload::Word(word)) => Self::from_word(&word)
                .ok_or_else(|| Error::Command(format!("unknown command '{}'", word))),
            Ok(CommandPayload::Number(n)) => {
                Err(Error::Command(format!("unknown command '{}'", n)))
            }
            Err(e) => Err(Error::Command(format!("unreadable payload '{}': {}", text, e))),
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "on" => Some(SwitchCommand::On),
            "off" => Some(SwitchCommand::Off),
            _ => None,
        }
    }
}

impl From<bool> for SwitchCommand {
    fn from(on: bool) -> Self {
        if on {
            SwitchCommand::On
        } else {
            SwitchCommand::Off
        }
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
