//! Error type shared by the protocol core and the BLE seam.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while running the emulated fitness peripheral
#[derive(Error, Debug)]
pub enum ZwackError {
    /// The BLE stack rejected or failed to deliver an outbound value
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed inbound data that cannot be mapped to a result code
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A characteristic was asked to encode a reading it has no layout for
    #[error("Characteristic {characteristic} cannot encode a {reading} reading")]
    UnsupportedReading {
        /// Characteristic short name
        characteristic: &'static str,
        /// Reading variant name
        reading: &'static str,
    },

    /// Invalid configuration or parameter values
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// No registered characteristic matches the UUID
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    /// The characteristic does not support the requested operation
    #[error("Operation not permitted on {uuid}: {operation}")]
    NotPermitted {
        /// Characteristic UUID
        uuid: Uuid,
        /// Attempted operation
        operation: &'static str,
    },
}

/// Result type for peripheral operations
pub type Result<T> = std::result::Result<T, ZwackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ZwackError::UnsupportedReading {
            characteristic: "RSC Measurement",
            reading: "Power",
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("RSC Measurement"));
        assert!(error_string.contains("Power"));

        let error = ZwackError::InvalidParameters("wheel circumference is zero".to_string());
        assert!(format!("{error}").contains("wheel circumference"));

        let error = ZwackError::UnknownCharacteristic(crate::protocol::ble_uuid(0x2A53));
        assert_eq!(
            format!("{error}"),
            "Unknown characteristic: 00002a53-0000-1000-8000-00805f9b34fb"
        );
    }
}
