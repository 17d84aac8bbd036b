//! Process-wide telemetry snapshot
//!
//! The dispatcher is the only writer of the feed fields; the workflow worker
//! and the feedback publisher read unsynchronized snapshots. Scalar fields
//! are atomics (f64 values bit-cast through `AtomicU64`); the maps sit
//! behind locks held only long enough to copy a value, never across an
//! await point. Polling these snapshots, rather than edge-triggered
//! signalling, is what makes the workflow robust to MQTT reordering and
//! loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

/// Snapshot fields shared between the dispatcher, the workflow worker and
/// the feedback publisher.
pub struct Shared {
    sensors: RwLock<HashMap<String, f64>>,
    valve_status: RwLock<HashMap<String, u8>>,
    vfd_feedback: AtomicU64,
    freq_command: AtomicU64,
    status: RwLock<String>,
    force_stop: AtomicBool,
    exit: AtomicBool,
    cyclic_resume: AtomicBool,
    current_test_index: AtomicI64,
    test_index_wanted: AtomicI64,
    cycle_index: AtomicU32,
    resume_command: RwLock<serde_json::Value>,
    current_inputs: RwLock<Option<serde_json::Value>>,
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    pub fn new() -> Self {
        Self {
            sensors: RwLock::new(HashMap::new()),
            valve_status: RwLock::new(HashMap::new()),
            vfd_feedback: AtomicU64::new(0f64.to_bits()),
            freq_command: AtomicU64::new(0f64.to_bits()),
            status: RwLock::new("initial".to_string()),
            force_stop: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            cyclic_resume: AtomicBool::new(false),
            current_test_index: AtomicI64::new(0),
            test_index_wanted: AtomicI64::new(0),
            cycle_index: AtomicU32::new(0),
            resume_command: RwLock::new(serde_json::Value::Object(serde_json::Map::new())),
            current_inputs: RwLock::new(None),
        }
    }

    pub fn sensor(&self, id: &str) -> Option<f64> {
        self.sensors.read().ok()?.get(id).copied()
    }

    pub fn set_sensor(&self, id: &str, value: f64) {
        if let Ok(mut map) = self.sensors.write() {
            map.insert(id.to_string(), value);
        }
    }

    pub fn valve_status(&self, name: &str) -> Option<u8> {
        self.valve_status.read().ok()?.get(name).copied()
    }

    pub fn set_valve_statuses(&self, statuses: HashMap<String, u8>) {
        if let Ok(mut map) = self.valve_status.write() {
            *map = statuses;
        }
    }

    pub fn vfd_feedback(&self) -> f64 {
        f64::from_bits(self.vfd_feedback.load(Ordering::SeqCst))
    }

    pub fn set_vfd_feedback(&self, value: f64) {
        self.vfd_feedback.store(value.to_bits(), Ordering::SeqCst);
    }

    pub fn freq_command(&self) -> f64 {
        f64::from_bits(self.freq_command.load(Ordering::SeqCst))
    }

    pub fn set_freq_command(&self, value: f64) {
        self.freq_command.store(value.to_bits(), Ordering::SeqCst);
    }

    pub fn status(&self) -> String {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "initial".to_string())
    }

    pub fn set_status(&self, status: &str) {
        if let Ok(mut s) = self.status.write() {
            *s = status.to_string();
        }
    }

    pub fn force_stop(&self) -> bool {
        self.force_stop.load(Ordering::SeqCst)
    }

    pub fn set_force_stop(&self, value: bool) {
        self.force_stop.store(value, Ordering::SeqCst);
    }

    pub fn exit(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub fn set_exit(&self, value: bool) {
        self.exit.store(value, Ordering::SeqCst);
    }

    pub fn cyclic_resume(&self) -> bool {
        self.cyclic_resume.load(Ordering::SeqCst)
    }

    pub fn set_cyclic_resume(&self, value: bool) {
        self.cyclic_resume.store(value, Ordering::SeqCst);
    }

    pub fn current_test_index(&self) -> i64 {
        self.current_test_index.load(Ordering::SeqCst)
    }

    pub fn set_current_test_index(&self, value: i64) {
        self.current_test_index.store(value, Ordering::SeqCst);
    }

    pub fn test_index_wanted(&self) -> i64 {
        self.test_index_wanted.load(Ordering::SeqCst)
    }

    pub fn set_test_index_wanted(&self, value: i64) {
        self.test_index_wanted.store(value, Ordering::SeqCst);
    }

    pub fn cycle_index(&self) -> u32 {
        self.cycle_index.load(Ordering::SeqCst)
    }

    pub fn set_cycle_index(&self, value: u32) {
        self.cycle_index.store(value, Ordering::SeqCst);
    }

    pub fn resume_command(&self) -> serde_json::Value {
        self.resume_command
            .read()
            .map(|v| v.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn set_resume_command(&self, command: serde_json::Value) {
        if let Ok(mut v) = self.resume_command.write() {
            *v = command;
        }
    }

    pub fn current_inputs(&self) -> Option<serde_json::Value> {
        self.current_inputs.read().ok().and_then(|v| v.clone())
    }

    pub fn set_current_inputs(&self, inputs: serde_json::Value) {
        if let Ok(mut v) = self.current_inputs.write() {
            *v = Some(inputs);
        }
    }
}
