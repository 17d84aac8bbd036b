//! Workflow state, events and the transition table
//!
//! Commands arrive as JSON on the command topic; they are parsed into an
//! explicit discriminated type and unknown shapes are rejected at the edge.
//! The transition table itself is a pure function so its totality over the
//! legal (state, command) pairs can be tested in isolation.

use crate::config::{ValveConfig, ValveRole};
use crate::error::{Result, TorrError};

/// The seven workflow states. `Idle` is the only resting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    InitializingValves,
    StartingVfd,
    Holding,
    AutomaticCycling,
    Relief,
    Stopping,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowState::Idle => "Idle",
            WorkflowState::InitializingValves => "InitializingValves",
            WorkflowState::StartingVfd => "StartingVfd",
            WorkflowState::Holding => "Holding",
            WorkflowState::AutomaticCycling => "AutomaticCycling",
            WorkflowState::Relief => "Relief",
            WorkflowState::Stopping => "Stopping",
        };
        write!(f, "{}", name)
    }
}

/// Stroke direction of the active test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Positive,
    Negative,
}

/// Command kinds driving the transition table. `Start` arrives from the
/// operator; the rest are synthesized by the workflow to chain states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    TurnOn,
    Hold,
    Automatic,
    Relief,
    TurnOff,
    Idle,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Start => "start",
            EventKind::TurnOn => "turn_on",
            EventKind::Hold => "hold",
            EventKind::Automatic => "automatic",
            EventKind::Relief => "relief",
            EventKind::TurnOff => "turn_off",
            EventKind::Idle => "idle",
        };
        write!(f, "{}", name)
    }
}

/// A manual hold test: ramp to a setpoint, hold for a duration
#[derive(Debug, Clone, PartialEq)]
pub struct ManualTest {
    pub sensor_id: String,
    pub setpoint: f64,
    pub holdtime: f64,
}

/// A cyclic test: stroke between two setpoints for a number of cycles
#[derive(Debug, Clone, PartialEq)]
pub struct CyclicTest {
    pub sensor_id: String,
    pub positive: f64,
    pub negative: f64,
    pub cycles: u32,
    pub test_index: i64,
}

/// Parameters of a start command
#[derive(Debug, Clone, PartialEq)]
pub enum TestRequest {
    Manual(ManualTest),
    Cyclic(CyclicTest),
}

/// One workflow event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start {
        request: TestRequest,
        /// Raw command payload, journaled verbatim for resume
        raw: serde_json::Value,
    },
    TurnOn,
    Hold,
    Automatic,
    Relief,
    TurnOff,
    Idle,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Start { .. } => EventKind::Start,
            Event::TurnOn => EventKind::TurnOn,
            Event::Hold => EventKind::Hold,
            Event::Automatic => EventKind::Automatic,
            Event::Relief => EventKind::Relief,
            Event::TurnOff => EventKind::TurnOff,
            Event::Idle => EventKind::Idle,
        }
    }
}

fn field_f64(value: &serde_json::Value, field: &str) -> Result<f64> {
    value
        .get(field)
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
        .ok_or_else(|| {
            TorrError::validation(field.to_string(), "missing or non-numeric".to_string())
        })
}

fn field_string(value: &serde_json::Value, field: &str) -> Result<String> {
    match value.get(field) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(TorrError::validation(
            field.to_string(),
            "missing or not a string/number".to_string(),
        )),
    }
}

/// Parse a command-topic payload into an event, rejecting unknown shapes.
pub fn parse_command(value: &serde_json::Value) -> Result<Event> {
    let command = value
        .get("command")
        .and_then(|c| c.as_str())
        .ok_or_else(|| TorrError::validation("command", "missing"))?;

    match command {
        "start" => {
            let mode = value
                .get("mode")
                .and_then(|m| m.as_str())
                .ok_or_else(|| TorrError::validation("mode", "missing"))?;
            let sensor_id = field_string(value, "sensor_id")?;

            let request = match mode {
                "manual" => TestRequest::Manual(ManualTest {
                    sensor_id,
                    setpoint: field_f64(value, "setpoint")?,
                    holdtime: field_f64(value, "holdtime")?,
                }),
                "cyclic" => TestRequest::Cyclic(CyclicTest {
                    sensor_id,
                    positive: field_f64(value, "positive")?,
                    negative: field_f64(value, "negative")?,
                    cycles: field_f64(value, "cycles")? as u32,
                    test_index: value
                        .get("test_index")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0),
                }),
                other => {
                    return Err(TorrError::validation(
                        "mode".to_string(),
                        format!("unknown mode '{}'", other),
                    ));
                }
            };

            Ok(Event::Start {
                request,
                raw: value.clone(),
            })
        }
        "turn_on" => Ok(Event::TurnOn),
        "hold" => Ok(Event::Hold),
        "automatic" => Ok(Event::Automatic),
        "relief" => Ok(Event::Relief),
        "turn_off" => Ok(Event::TurnOff),
        "idle" => Ok(Event::Idle),
        other => Err(TorrError::validation(
            "command".to_string(),
            format!("unknown command '{}'", other),
        )),
    }
}

/// One row of the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: WorkflowState,
    /// Event the workflow synthesizes after completing the transition
    pub follow_up: Option<EventKind>,
}

/// The transition table. Total over the legal (state, command) pairs; every
/// other pair yields `None` and is ignored by the worker.
pub fn transition(
    state: WorkflowState,
    command: EventKind,
    cyclic_mode: bool,
) -> Option<Transition> {
    use EventKind::*;
    use WorkflowState::*;

    match (state, command) {
        (WorkflowState::Idle, Start) => Some(Transition {
            to: InitializingValves,
            follow_up: Some(TurnOn),
        }),
        (InitializingValves, TurnOn) => Some(Transition {
            to: StartingVfd,
            follow_up: Some(if cyclic_mode { Automatic } else { Hold }),
        }),
        (StartingVfd, Hold) => Some(Transition {
            to: Holding,
            follow_up: Some(EventKind::Relief),
        }),
        (StartingVfd, Automatic) => Some(Transition {
            to: AutomaticCycling,
            follow_up: Some(EventKind::Relief),
        }),
        (Holding, EventKind::Relief) | (AutomaticCycling, EventKind::Relief) => Some(Transition {
            to: WorkflowState::Relief,
            follow_up: Some(TurnOff),
        }),
        (WorkflowState::Relief, TurnOff) => Some(Transition {
            to: Stopping,
            follow_up: Some(EventKind::Idle),
        }),
        (Stopping, EventKind::Idle) => Some(Transition {
            to: WorkflowState::Idle,
            follow_up: None,
        }),
        _ => None,
    }
}

/// Level an ACTIVE valve is commanded to during valve initialization; `None`
/// for valves the phase does not touch.
pub fn commanded_level(valve: &ValveConfig, action: Action) -> Option<u8> {
    if !valve.has_role(ValveRole::Active) {
        return None;
    }
    let level = match action {
        Action::Positive => !valve.has_role(ValveRole::Positive),
        Action::Negative => !valve.has_role(ValveRole::Negative),
    };
    Some(u8::from(level))
}

/// Frequency ramp step for the given absolute setpoint error
pub fn ramp_step(abs_error: f64) -> f64 {
    if abs_error > 5.0 {
        5.0
    } else if abs_error > 3.0 {
        3.0
    } else {
        1.0
    }
}
