//! Error types and handling for Torr
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Torr operations
pub type Result<T> = std::result::Result<T, TorrError>;

/// Main error type for Torr
#[derive(Debug, Error)]
pub enum TorrError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Modbus/serial bus communication errors
    #[error("Serial error: {message}")]
    Serial { message: String },

    /// MQTT broker communication errors
    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Progress journal errors
    #[error("Journal error: {message}")]
    Journal { message: String },

    /// Timeout errors (VFD start, setpoint tuning, bus exchanges)
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl TorrError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        TorrError::Config {
            message: message.into(),
        }
    }

    /// Create a new serial bus error
    pub fn serial<S: Into<String>>(message: S) -> Self {
        TorrError::Serial {
            message: message.into(),
        }
    }

    /// Create a new MQTT error
    pub fn mqtt<S: Into<String>>(message: S) -> Self {
        TorrError::Mqtt {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        TorrError::Io {
            message: message.into(),
        }
    }

    /// Create a new journal error
    pub fn journal<S: Into<String>>(message: S) -> Self {
        TorrError::Journal {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        TorrError::Timeout {
            message: message.into(),
        }
    }

    /// Timeout waiting for the drive to acknowledge zero speed after a start
    pub fn vfd_start_timeout(seconds: u64) -> Self {
        TorrError::Timeout {
            message: format!("VFDStartTimeout: drive not ready within {}s", seconds),
        }
    }

    /// Timeout waiting for the test sensor to reach the setpoint
    pub fn tuning_timeout(seconds: u64) -> Self {
        TorrError::Timeout {
            message: format!("TuningTimeout: setpoint not reached within {}s", seconds),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        TorrError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        TorrError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TorrError {
    fn from(err: std::io::Error) -> Self {
        TorrError::io(err.to_string())
    }
}

impl From<serde_json::Error> for TorrError {
    fn from(err: serde_json::Error) -> Self {
        TorrError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tokio_serial::Error> for TorrError {
    fn from(err: tokio_serial::Error) -> Self {
        TorrError::serial(err.to_string())
    }
}

impl From<rumqttc::ClientError> for TorrError {
    fn from(err: rumqttc::ClientError) -> Self {
        TorrError::mqtt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TorrError::config("test config error");
        assert!(matches!(err, TorrError::Config { .. }));

        let err = TorrError::serial("test serial error");
        assert!(matches!(err, TorrError::Serial { .. }));

        let err = TorrError::validation("field", "test validation error");
        assert!(matches!(err, TorrError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = TorrError::mqtt("broker unreachable");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "MQTT error: broker unreachable");

        let err = TorrError::validation("test_field", "invalid value");
        let error_string = format!("{}", err);
        assert_eq!(error_string, "Validation error: test_field - invalid value");
    }

    #[test]
    fn test_timeout_helpers() {
        let err = TorrError::vfd_start_timeout(90);
        assert!(format!("{}", err).contains("VFDStartTimeout"));
        let err = TorrError::tuning_timeout(90);
        assert!(format!("{}", err).contains("TuningTimeout"));
        assert!(matches!(err, TorrError::Timeout { .. }));
    }
}
