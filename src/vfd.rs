//! VFD control surface
//!
//! Dispatches `{device}/vfd/command` messages to Modbus writes on the drive,
//! publishes speed feedback every second, and runs the emergency spin-down.
//! All bus traffic goes through the serial multiplexer.

use crate::config::VfdConfig;
use crate::error::{Result, TorrError};
use crate::logging::get_logger;
use crate::mqtt::Topics;
use crate::serial::{SerialCom, decode_32bit_uint};
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// Start/stop command register
pub const START_STOP_REGISTER: u16 = 8192;
/// Frequency setpoint register (2 decimals on the wire)
pub const FREQUENCY_REGISTER: u16 = 8193;
/// Speed feedback register (2 registers, big-endian, 2 decimals)
pub const SPEED_REGISTER: u16 = 8451;
/// Value written to the start/stop register to start the motor
pub const START_COMMAND: u16 = 18;
/// Value written to the start/stop register to stop the motor
pub const STOP_COMMAND: u16 = 1;
/// Decimal scaling of the frequency registers
pub const FREQUENCY_DECIMALS: u8 = 2;
/// Function code for drive writes
pub const WRITE_FUNCTION: u8 = 6;
/// Function code for drive reads
pub const READ_FUNCTION: u8 = 3;

/// Typed form of a `{device}/vfd/command` payload
#[derive(Debug, Clone, PartialEq)]
pub enum VfdCommand {
    Start,
    Stop,
    SetFrequency(f64),
    EmergencyStop,
}

#[derive(Deserialize)]
struct RawVfdCommand {
    command: String,
    #[serde(default)]
    parameter: serde_json::Value,
}

fn numeric_parameter(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

impl VfdCommand {
    /// Parse a command payload, rejecting unknown shapes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawVfdCommand = serde_json::from_slice(payload)?;
        match raw.command.as_str() {
            "start" => Ok(VfdCommand::Start),
            "stop" => Ok(VfdCommand::Stop),
            "emergency_stop" => Ok(VfdCommand::EmergencyStop),
            "set_frequency" => numeric_parameter(&raw.parameter)
                .map(VfdCommand::SetFrequency)
                .ok_or_else(|| {
                    TorrError::validation("parameter", "set_frequency needs a numeric parameter")
                }),
            other => Err(TorrError::validation(
                "command".to_string(),
                format!("unknown vfd command '{}'", other),
            )),
        }
    }

    /// Wire representation published on the command topic
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            VfdCommand::Start => json!({"command": "start", "parameter": ""}),
            VfdCommand::Stop => json!({"command": "stop", "parameter": ""}),
            VfdCommand::SetFrequency(freq) => {
                json!({"command": "set_frequency", "parameter": freq})
            }
            VfdCommand::EmergencyStop => json!({"command": "emergency_stop", "parameter": ""}),
        }
    }
}

/// Drive controller hosted by the serial service
#[derive(Clone)]
pub struct VfdDriver {
    serial: Arc<SerialCom>,
    client: AsyncClient,
    topics: Topics,
    address: u8,
    logger: crate::logging::StructuredLogger,
}

impl VfdDriver {
    pub fn new(serial: Arc<SerialCom>, client: AsyncClient, topics: Topics, config: &VfdConfig) -> Self {
        Self {
            serial,
            client,
            topics,
            address: config.address,
            logger: get_logger("vfd"),
        }
    }

    /// Handle a routine command. Write failures are logged and swallowed so a
    /// bus transient never takes the command stream down; the coordinator
    /// works from feedback, not from write acknowledgements.
    pub async fn handle(&self, command: VfdCommand) {
        match command {
            VfdCommand::Start => self.start().await,
            VfdCommand::Stop => self.stop().await,
            VfdCommand::SetFrequency(freq) => self.set_frequency(freq).await,
            VfdCommand::EmergencyStop => self.emergency_stop().await,
        }
    }

    async fn start(&self) {
        if let Err(e) = self
            .serial
            .write_register(
                self.address,
                START_STOP_REGISTER,
                f64::from(START_COMMAND),
                0,
                WRITE_FUNCTION,
                false,
            )
            .await
        {
            self.logger.error(&format!("Ignored start command: {}", e));
        }
        self.logger.info("Started VFD");
    }

    async fn stop(&self) {
        if let Err(e) = self
            .serial
            .write_register(
                self.address,
                START_STOP_REGISTER,
                f64::from(STOP_COMMAND),
                0,
                WRITE_FUNCTION,
                false,
            )
            .await
        {
            self.logger.error(&format!("Ignored stop command: {}", e));
        }
        self.logger.info("Stopped VFD");
    }

    async fn set_frequency(&self, frequency: f64) {
        if let Err(e) = self
            .serial
            .write_register(
                self.address,
                FREQUENCY_REGISTER,
                frequency,
                FREQUENCY_DECIMALS,
                WRITE_FUNCTION,
                false,
            )
            .await
        {
            self.logger
                .error(&format!("Ignored set_frequency command: {}", e));
        }
        self.logger.info(&format!("Set frequency: {}", frequency));
    }

    /// Read the speed feedback register in Hz
    pub async fn read_speed(&self) -> Result<f64> {
        let regs = self
            .serial
            .read_registers(self.address, SPEED_REGISTER, 2, READ_FUNCTION)
            .await?;
        Ok(f64::from(decode_32bit_uint(&regs)?) / 100.0)
    }

    /// Write the stop command and poll the speed register until the drive
    /// actually reads zero.
    pub async fn emergency_stop(&self) {
        if let Err(e) = self
            .serial
            .write_register(
                self.address,
                START_STOP_REGISTER,
                f64::from(STOP_COMMAND),
                0,
                WRITE_FUNCTION,
                false,
            )
            .await
        {
            self.logger
                .error(&format!("Ignored emergency stop write: {}", e));
        }

        loop {
            match self.read_speed().await {
                Ok(speed) if speed.abs() < f64::EPSILON => break,
                Ok(speed) => self
                    .logger
                    .warn(&format!("Waiting for VFD to stop, current speed is {}", speed)),
                Err(e) => self.logger.error(&format!("Ignored speed read: {}", e)),
            }
            sleep(Duration::from_millis(100)).await;
        }
        self.logger.info("Emergency stop executed");
    }

    /// Publish the drive speed on `{device}/vfd/feedback` every second until
    /// `exit` is raised.
    pub async fn run_feedback(&self, exit: Arc<AtomicBool>) {
        while !exit.load(Ordering::SeqCst) {
            match self.read_speed().await {
                Ok(speed) => {
                    if let Err(e) = self
                        .client
                        .publish(
                            self.topics.vfd_feedback(),
                            QoS::AtLeastOnce,
                            false,
                            speed.to_string(),
                        )
                        .await
                    {
                        self.logger.warn(&format!("Feedback publish failed: {}", e));
                    }
                }
                Err(e) => self.logger.error(&format!("Failed to read VFD feedback: {}", e)),
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_commands() {
        assert_eq!(
            VfdCommand::parse(br#"{"command": "start", "parameter": ""}"#).unwrap(),
            VfdCommand::Start
        );
        assert_eq!(
            VfdCommand::parse(br#"{"command": "stop"}"#).unwrap(),
            VfdCommand::Stop
        );
        assert_eq!(
            VfdCommand::parse(br#"{"command": "emergency_stop", "parameter": ""}"#).unwrap(),
            VfdCommand::EmergencyStop
        );
    }

    #[test]
    fn parse_set_frequency_accepts_number_or_numeric_string() {
        assert_eq!(
            VfdCommand::parse(br#"{"command": "set_frequency", "parameter": 12.5}"#).unwrap(),
            VfdCommand::SetFrequency(12.5)
        );
        assert_eq!(
            VfdCommand::parse(br#"{"command": "set_frequency", "parameter": "30"}"#).unwrap(),
            VfdCommand::SetFrequency(30.0)
        );
    }

    #[test]
    fn parse_rejects_unknown_shapes() {
        assert!(VfdCommand::parse(br#"{"command": "reverse"}"#).is_err());
        assert!(VfdCommand::parse(br#"{"command": "set_frequency"}"#).is_err());
        assert!(VfdCommand::parse(br#"{"command": "set_frequency", "parameter": "fast"}"#).is_err());
        assert!(VfdCommand::parse(b"not json").is_err());
    }

    #[test]
    fn payload_round_trips() {
        for cmd in [
            VfdCommand::Start,
            VfdCommand::Stop,
            VfdCommand::SetFrequency(17.0),
            VfdCommand::EmergencyStop,
        ] {
            let bytes = serde_json::to_vec(&cmd.to_payload()).unwrap();
            assert_eq!(VfdCommand::parse(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn register_map_matches_drive() {
        assert_eq!(START_STOP_REGISTER, 8192);
        assert_eq!(FREQUENCY_REGISTER, 8193);
        assert_eq!(SPEED_REGISTER, 8451);
        assert_eq!(START_COMMAND, 18);
        assert_eq!(STOP_COMMAND, 1);
    }
}
