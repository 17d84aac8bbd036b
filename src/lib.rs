//! # Torr - Pressure Test Rig Controller
//!
//! A Rust implementation of the hydraulic/pneumatic pressure test rig
//! controller: a coordinator drives a variable-frequency motor drive,
//! actuates solenoid valves and samples pressure and flow sensors to run
//! manual hold tests and resumable cyclic tests.
//!
//! ## Features
//!
//! - **Modbus RTU**: shared RS-485 bus behind a locking serial multiplexer
//! - **MQTT bus**: soft coupling between the coordinator, the serial
//!   service and the operator UI
//! - **Seven-state workflow**: safety-critical test sequencing with
//!   emergency preemption
//! - **Crash-consistent journal**: cyclic tests resume mid-test after a
//!   restart
//! - **Configuration**: JSON-based configuration with validation
//!
//! ## Architecture
//!
//! Two processes share one MQTT broker:
//!
//! - `serial_service` hosts the serial multiplexer, the VFD driver and the
//!   sensor poller
//! - `state_machine` hosts the workflow coordinator
//!
//! Modules:
//!
//! - `config`: configuration management and validation
//! - `logging`: structured logging and tracing
//! - `serial`: Modbus RTU multiplexer for the shared bus
//! - `mqtt`: broker plumbing and the topic catalog
//! - `vfd`: drive control surface
//! - `sensors`: sensor sampling and the air-mass flow model
//! - `journal`: test-progress persistence and recovery
//! - `statemachine`: the workflow coordinator

pub mod config;
pub mod error;
pub mod journal;
pub mod logging;
pub mod mqtt;
pub mod sensors;
pub mod serial;
pub mod statemachine;
pub mod vfd;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, TorrError};
pub use statemachine::StateMachine;
