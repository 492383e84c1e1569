use serde::Serialize;

use crate::error::{Error, Result};

/// Wire format for published entity state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON (default, readable by most home-automation hosts).
    #[default]
    Json,

    /// CBOR (compact binary).
    Cbor,
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityKind, EntityState, StateValue};

    fn input_state() -> EntityState {
        EntityState {
            timestamp: 1_700_000_000_000,
            unique_id: "modbus_sw-P1-5-input2".to_string(),
            name: "Boiler".to_string(),
            kind: EntityKind::Input,
            port: "P1".to_string(),
            slave_id: 5,
            address: 2,
            value: StateValue::Measurement(21.0),
            unit: Some("°C".to_string()),
            device_class: Some("temperature".to_string()),
            state_class: Some("measurement".to_string()),
        }
    }

    #[test]
    fn test_json_keeps_sensor_attributes() {
        let encoded = encode(&input_state(), Format::Json).unwrap();
        let decoded: EntityState = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, input_state());
    }

    #[test]
    fn test_cbor_is_smaller() {
        let json = encode(&input_state(), Format::Json).unwrap();
        let cbor = encode(&input_state(), Format::Cbor).unwrap();

        assert!(cbor.len() < json.len(), "CBOR should be smaller than JSON");
        let decoded: EntityState = ciborium::from_reader(cbor.as_slice()).unwrap();
        assert_eq!(decoded.unique_id, "modbus_sw-P1-5-input2");
    }
}
