//! MQTT plumbing shared by both rig processes
//!
//! The broker is a soft message bus between the coordinator, the serial
//! service and the operator UI. This module builds client options from the
//! configuration and centralizes the topic catalog so every component names
//! topics the same way.

use crate::config::MqttConfig;
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::time::Duration;

/// Build broker options from the configuration
pub fn connect_options(config: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }
    options
}

/// Create the async client and its event loop
pub fn client(config: &MqttConfig, client_id: &str) -> (AsyncClient, EventLoop) {
    AsyncClient::new(connect_options(config, client_id), 64)
}

/// Incoming topics the rig processes react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingTopic<'a> {
    /// User command (start a test)
    Command,
    /// Cancel a persisted resume
    ResumeCancel,
    /// Emergency stop request
    EmergencyStop,
    /// Opaque UI inputs, persisted for prefill
    CurrentInput,
    /// Sensor feed, keyed by bus address
    Sensor(&'a str),
    /// Valve driver status map
    ValveStatus,
    /// VFD command (also echo-observed by the coordinator)
    VfdCommand,
    /// VFD speed feedback
    VfdFeedback,
}

/// Topic catalog under a single `{device_id}` prefix
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        Self {
            prefix: device_id.to_string(),
        }
    }

    pub fn command(&self) -> String {
        format!("{}/command", self.prefix)
    }

    pub fn resume_cancel(&self) -> String {
        format!("{}/resume_cancel", self.prefix)
    }

    pub fn emergency_stop(&self) -> String {
        format!("{}/emergency_stop", self.prefix)
    }

    pub fn current_input(&self) -> String {
        format!("{}/current_input", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn current_test_index(&self) -> String {
        format!("{}/current_test_index", self.prefix)
    }

    pub fn initial_value(&self) -> String {
        format!("{}/initial_value", self.prefix)
    }

    pub fn resume_status(&self) -> String {
        format!("{}/resume_status", self.prefix)
    }

    pub fn valve(&self, name: &str) -> String {
        format!("{}/valves/{}", self.prefix, name)
    }

    pub fn valves_status(&self) -> String {
        format!("{}/valves/status", self.prefix)
    }

    pub fn vfd_command(&self) -> String {
        format!("{}/vfd/command", self.prefix)
    }

    pub fn vfd_feedback(&self) -> String {
        format!("{}/vfd/feedback", self.prefix)
    }

    pub fn sensor(&self, address: &str) -> String {
        format!("{}/sensors/{}", self.prefix, address)
    }

    /// Classify an incoming topic; topics outside the catalog yield `None`.
    pub fn parse<'a>(&self, topic: &'a str) -> Option<IncomingTopic<'a>> {
        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))?;

        match rest {
            "command" => Some(IncomingTopic::Command),
            "resume_cancel" => Some(IncomingTopic::ResumeCancel),
            "emergency_stop" => Some(IncomingTopic::EmergencyStop),
            "current_input" => Some(IncomingTopic::CurrentInput),
            "valves/status" => Some(IncomingTopic::ValveStatus),
            "vfd/command" => Some(IncomingTopic::VfdCommand),
            "vfd/feedback" => Some(IncomingTopic::VfdFeedback),
            other => other
                .strip_prefix("sensors/")
                .filter(|address| !address.is_empty() && !address.contains('/'))
                .map(IncomingTopic::Sensor),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("rig1")
    }

    // -- topic construction -------------------------------------------------

    #[test]
    fn topics_carry_device_prefix() {
        let t = topics();
        assert_eq!(t.command(), "rig1/command");
        assert_eq!(t.status(), "rig1/status");
        assert_eq!(t.valve("inlet"), "rig1/valves/inlet");
        assert_eq!(t.valves_status(), "rig1/valves/status");
        assert_eq!(t.vfd_command(), "rig1/vfd/command");
        assert_eq!(t.vfd_feedback(), "rig1/vfd/feedback");
        assert_eq!(t.sensor("1"), "rig1/sensors/1");
        assert_eq!(t.resume_status(), "rig1/resume_status");
    }

    // -- parse --------------------------------------------------------------

    #[test]
    fn parse_recognizes_catalog_topics() {
        let t = topics();
        assert_eq!(t.parse("rig1/command"), Some(IncomingTopic::Command));
        assert_eq!(
            t.parse("rig1/resume_cancel"),
            Some(IncomingTopic::ResumeCancel)
        );
        assert_eq!(
            t.parse("rig1/emergency_stop"),
            Some(IncomingTopic::EmergencyStop)
        );
        assert_eq!(
            t.parse("rig1/current_input"),
            Some(IncomingTopic::CurrentInput)
        );
        assert_eq!(t.parse("rig1/valves/status"), Some(IncomingTopic::ValveStatus));
        assert_eq!(t.parse("rig1/vfd/command"), Some(IncomingTopic::VfdCommand));
        assert_eq!(t.parse("rig1/vfd/feedback"), Some(IncomingTopic::VfdFeedback));
        assert_eq!(t.parse("rig1/sensors/1"), Some(IncomingTopic::Sensor("1")));
        assert_eq!(
            t.parse("rig1/sensors/temperature"),
            Some(IncomingTopic::Sensor("temperature"))
        );
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        let t = topics();
        assert_eq!(t.parse("rig2/command"), None);
        assert_eq!(t.parse("command"), None);
    }

    #[test]
    fn parse_rejects_unknown_or_malformed() {
        let t = topics();
        assert_eq!(t.parse("rig1/unknown"), None);
        assert_eq!(t.parse("rig1/sensors/"), None);
        assert_eq!(t.parse("rig1/sensors/1/extra"), None);
        assert_eq!(t.parse("rig1/valves/inlet"), None);
    }

    #[test]
    fn connect_options_apply_credentials() {
        let mut cfg = MqttConfig::default();
        cfg.username = "user".to_string();
        cfg.password = "pass".to_string();
        let opts = connect_options(&cfg, "torr-test");
        assert_eq!(opts.credentials(), Some(("user".to_string(), "pass".to_string())));
    }

    #[test]
    fn connect_options_skip_empty_credentials() {
        let cfg = MqttConfig::default();
        let opts = connect_options(&cfg, "torr-test");
        assert_eq!(opts.credentials(), None);
    }
}
