//! Configuration management for Torr
//!
//! This module handles loading, validation, and management of the rig
//! configuration from a JSON file shared by the coordinator and the serial
//! service processes.

use crate::error::{Result, TorrError};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "rtu".to_string()
}

fn default_journal_file() -> String {
    "variables.json".to_string()
}

fn default_retry_interval() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_poll_frequency() -> f64 {
    10.0
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identifier, used as the MQTT topic prefix
    pub device_id: String,

    /// MQTT broker connection configuration
    pub mqtt: MqttConfig,

    /// RS-485 serial port configuration
    pub serial: SerialConfig,

    /// Variable-frequency drive addressing
    pub vfd: VfdConfig,

    /// Pressure and flow sensors on the bus
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    /// Solenoid valves driven by the external valve driver
    #[serde(default)]
    pub valves: Vec<ValveConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path of the test-progress journal
    #[serde(default = "default_journal_file")]
    pub journal_file: String,
}

/// MQTT broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address
    pub broker_host: String,

    /// Broker TCP port (typically 1883)
    pub broker_port: u16,

    /// Broker username (empty disables authentication)
    #[serde(default)]
    pub username: String,

    /// Broker password
    #[serde(default)]
    pub password: String,

    /// Delay between reconnection attempts in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Consecutive failed attempts before the process gives up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

/// RS-485 serial line parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (e.g. /dev/ttyUSB0)
    pub port: String,

    /// Line speed in baud (9600 by default on this rig)
    pub baudrate: u32,

    /// Data bits per character (5-8)
    pub bytesize: u8,

    /// Parity: "none", "even" or "odd"
    pub parity: String,

    /// Stop bits (1 or 2)
    pub stopbits: u8,

    /// Read timeout in seconds
    pub timeout: f64,

    /// Framing mode; only "rtu" is supported
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Discard stale bytes before each transaction
    #[serde(default = "default_true")]
    pub clear_buffers_before_each_transaction: bool,

    /// Reopen the port per call (kept for config compatibility; the port is
    /// held for process life)
    #[serde(default)]
    pub close_port_after_each_call: bool,
}

/// VFD addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfdConfig {
    /// Modbus slave address of the drive
    pub address: u8,
}

/// Sensor kind, selecting the register policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Pressure,
    Flow,
}

/// Ambient-condition topic sources for flow sensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientConfig {
    /// Device whose sensor feed provides the ambient values
    pub device_id: String,

    /// Address of the ambient pressure sensor on that device
    pub pressure_address: String,
}

/// One sensor on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Human-readable name, used in logs only
    pub name: String,

    /// Register policy
    #[serde(rename = "type")]
    pub kind: SensorKind,

    /// Modbus slave address; also the last topic segment of its feed
    pub address: u8,

    /// Poll frequency in Hz
    #[serde(default = "default_poll_frequency")]
    pub frequency: f64,

    /// Log every raw reading
    #[serde(default)]
    pub debug: bool,

    /// Ambient topic sources (flow sensors only)
    #[serde(default)]
    pub ambient: Option<AmbientConfig>,
}

/// Capability tags governing a valve's behavior per workflow phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveRole {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "POSITIVE")]
    Positive,
    #[serde(rename = "NEGATIVE")]
    Negative,
    #[serde(rename = "POSITIVE_RELEASE")]
    PositiveRelease,
    #[serde(rename = "NEGATIVE_RELEASE")]
    NegativeRelease,
    #[serde(rename = "ALWAYSON")]
    AlwaysOn,
    #[serde(rename = "ALWAYSOFF")]
    AlwaysOff,
    #[serde(rename = "FORCE")]
    Force,
}

/// One solenoid valve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Valve name; also the last topic segment of its command topic
    pub name: String,

    /// Role tags
    #[serde(default)]
    pub role: Vec<ValveRole>,
}

impl ValveConfig {
    /// Whether this valve carries the given role tag
    pub fn has_role(&self, role: ValveRole) -> bool {
        self.role.contains(&role)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Path to log file (its parent directory receives the rotated files)
    pub file: String,

    /// Max log file size in MB
    pub max_file_size_mb: u32,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            username: String::new(),
            password: String::new(),
            retry_interval_secs: default_retry_interval(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: 9600,
            bytesize: 8,
            parity: "none".to_string(),
            stopbits: 1,
            timeout: 0.5,
            mode: default_mode(),
            clear_buffers_before_each_transaction: true,
            close_port_after_each_call: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "logs/torr.log".to_string(),
            max_file_size_mb: 1,
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "device0".to_string(),
            mqtt: MqttConfig::default(),
            serial: SerialConfig::default(),
            vfd: VfdConfig { address: 1 },
            sensors: Vec::new(),
            valves: Vec::new(),
            logging: LoggingConfig::default(),
            journal_file: default_journal_file(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = ["config.json", "/data/torr/config.json", "/etc/torr/config.json"];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Err(TorrError::config(
            "no config.json found in the default locations",
        ))
    }

    /// Load from the first CLI argument when given, the default paths otherwise
    pub fn load_from_args() -> Result<Self> {
        match std::env::args().nth(1) {
            Some(path) => Self::from_file(path),
            None => Self::load(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(TorrError::validation("device_id", "cannot be empty"));
        }

        if self.serial.port.is_empty() {
            return Err(TorrError::validation("serial.port", "cannot be empty"));
        }

        if self.serial.baudrate == 0 {
            return Err(TorrError::validation(
                "serial.baudrate",
                "must be greater than 0",
            ));
        }

        if self.serial.mode != "rtu" {
            return Err(TorrError::validation("serial.mode", "only rtu is supported"));
        }

        if self.mqtt.broker_host.is_empty() {
            return Err(TorrError::validation("mqtt.broker_host", "cannot be empty"));
        }

        if self.mqtt.broker_port == 0 {
            return Err(TorrError::validation(
                "mqtt.broker_port",
                "must be greater than 0",
            ));
        }

        for sensor in &self.sensors {
            if sensor.frequency <= 0.0 {
                return Err(TorrError::validation(
                    "sensors.frequency",
                    "must be greater than 0",
                ));
            }
            if sensor.kind == SensorKind::Flow && sensor.ambient.is_none() {
                return Err(TorrError::validation(
                    "sensors.ambient",
                    "flow sensors need ambient topic sources",
                ));
            }
        }

        for valve in &self.valves {
            if valve.name.is_empty() {
                return Err(TorrError::validation("valves.name", "cannot be empty"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "device_id": "rig1",
            "mqtt": {"broker_host": "localhost", "broker_port": 1883, "username": "u", "password": "p"},
            "serial": {
                "port": "/dev/ttyUSB0", "baudrate": 9600, "bytesize": 8,
                "parity": "none", "stopbits": 1, "timeout": 0.5, "mode": "rtu",
                "clear_buffers_before_each_transaction": true,
                "close_port_after_each_call": false
            },
            "vfd": {"address": 3},
            "sensors": [
                {"name": "chamber", "type": "pressure", "address": 1, "frequency": 20},
                {"name": "intake", "type": "flow", "address": 2, "frequency": 5,
                 "ambient": {"device_id": "rig1", "pressure_address": "1"}}
            ],
            "valves": [
                {"name": "v1", "role": ["ACTIVE", "POSITIVE"]},
                {"name": "v2", "role": ["ACTIVE", "NEGATIVE", "POSITIVE_RELEASE"]},
                {"name": "pilot", "role": ["ALWAYSON"]}
            ]
        }"#
    }

    #[test]
    fn parse_sample_config() {
        let cfg: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(cfg.device_id, "rig1");
        assert_eq!(cfg.vfd.address, 3);
        assert_eq!(cfg.sensors.len(), 2);
        assert_eq!(cfg.sensors[0].kind, SensorKind::Pressure);
        assert_eq!(cfg.sensors[1].kind, SensorKind::Flow);
        assert_eq!(cfg.valves.len(), 3);
        assert!(cfg.valves[1].has_role(ValveRole::PositiveRelease));
        assert!(!cfg.valves[0].has_role(ValveRole::Force));
        assert_eq!(cfg.journal_file, "variables.json");
        cfg.validate().unwrap();
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let cfg: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(cfg.mqtt.retry_interval_secs, 5);
        assert_eq!(cfg.mqtt.retry_attempts, 3);
        assert_eq!(cfg.logging.backup_count, 5);
        assert_eq!(cfg.logging.max_file_size_mb, 1);
    }

    #[test]
    fn validate_rejects_bad_mode() {
        let mut cfg: Config = serde_json::from_str(sample_json()).unwrap();
        cfg.serial.mode = "ascii".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(crate::error::TorrError::Validation { .. })
        ));
    }

    #[test]
    fn validate_rejects_flow_sensor_without_ambient() {
        let mut cfg: Config = serde_json::from_str(sample_json()).unwrap();
        cfg.sensors[1].ambient = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn valve_roles_round_trip_wire_names() {
        let v: ValveConfig = serde_json::from_str(
            r#"{"name": "x", "role": ["ALWAYSOFF", "NEGATIVE_RELEASE", "FORCE"]}"#,
        )
        .unwrap();
        assert!(v.has_role(ValveRole::AlwaysOff));
        assert!(v.has_role(ValveRole::NegativeRelease));
        assert!(v.has_role(ValveRole::Force));
        let text = serde_json::to_string(&v).unwrap();
        assert!(text.contains("ALWAYSOFF"));
        assert!(text.contains("NEGATIVE_RELEASE"));
    }
}
