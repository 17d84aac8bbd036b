//! Workflow coordinator
//!
//! Owns the seven-state test workflow, the progress journal and all valve and
//! VFD command issuance. Three tasks cooperate: the dispatcher consumes MQTT
//! messages and mutates the shared snapshot, the worker polls the event
//! mailbox every 10 ms and runs the blocking state bodies, and the feedback
//! publisher republishes status at a 0.3 s cadence. The worker is the only
//! writer of the current state.

use crate::config::{Config, ValveRole};
use crate::error::{Result, TorrError};
use crate::journal::{Journal, JournalRecord};
use crate::logging::get_logger;
use crate::mqtt::{self, IncomingTopic, Topics};
use crate::vfd::VfdCommand;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::time::sleep;

pub mod shared;
mod states;
pub mod types;

pub use shared::Shared;
pub use types::{Action, Event, EventKind, TestRequest, WorkflowState};

use types::{CyclicTest, ManualTest, transition};

/// Single-slot event mailbox between the dispatcher and the worker.
///
/// The dispatcher posts, the worker polls the flag every 10 ms and drains.
/// A later command overwrites an unconsumed one, mirroring the
/// last-writer-wins semantics of the snapshot fields.
pub struct Mailbox {
    slot: StdMutex<Option<Event>>,
    flag: AtomicBool,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            slot: StdMutex::new(None),
            flag: AtomicBool::new(false),
        }
    }

    pub fn post(&self, event: Event) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(event);
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn take(&self) -> Option<Event> {
        if self.flag.swap(false, Ordering::SeqCst) {
            self.slot.lock().ok()?.take()
        } else {
            None
        }
    }
}

fn store_journal<F: FnOnce(&mut JournalRecord)>(
    journal: &StdMutex<Journal>,
    logger: &crate::logging::StructuredLogger,
    mutate: F,
) {
    match journal.lock() {
        Ok(mut journal) => {
            // A failed commit must not abort a running test; the operator
            // merely loses resume-ability.
            if let Err(e) = journal.update(mutate) {
                logger.warn(&format!("Journal write failed: {}", e));
            }
        }
        Err(_) => logger.warn("Journal lock poisoned, update dropped"),
    }
}

/// Worker-side context: the current state plus the parameters of the active
/// test. States receive it by reference.
pub(crate) struct Workflow {
    pub(crate) config: Arc<Config>,
    pub(crate) client: AsyncClient,
    pub(crate) topics: Topics,
    pub(crate) shared: Arc<Shared>,
    pub(crate) journal: Arc<StdMutex<Journal>>,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) state: WorkflowState,
    pub(crate) cyclic_mode: bool,
    pub(crate) action: Action,
    pub(crate) sensor_id: String,
    pub(crate) setpoint: f64,
    pub(crate) holdtime: f64,
    pub(crate) positive_setpoint: f64,
    pub(crate) negative_setpoint: f64,
    pub(crate) cycle_counter: u32,
    pub(crate) logger: crate::logging::StructuredLogger,
}

impl Workflow {
    fn new(
        config: Arc<Config>,
        client: AsyncClient,
        topics: Topics,
        shared: Arc<Shared>,
        journal: Arc<StdMutex<Journal>>,
        mailbox: Arc<Mailbox>,
    ) -> Self {
        Self {
            config,
            client,
            topics,
            shared,
            journal,
            mailbox,
            state: WorkflowState::Idle,
            cyclic_mode: false,
            action: Action::Positive,
            sensor_id: String::new(),
            setpoint: 0.0,
            holdtime: 0.0,
            positive_setpoint: 0.0,
            negative_setpoint: 0.0,
            cycle_counter: 0,
            logger: get_logger("workflow"),
        }
    }

    /// Run once at worker start: settle into Idle and surface a pending
    /// resume to the operator.
    pub(crate) async fn startup(&mut self) {
        if let Err(e) = states::idle::enter(self).await {
            self.logger.error(&format!("Idle entry failed: {}", e));
            self.shared.set_force_stop(true);
        }
        if self.shared.cyclic_resume() {
            self.shared
                .set_status(&format!("resume cycle {}", self.shared.cycle_index()));
        }
    }

    /// Execute one event against the transition table.
    pub(crate) async fn apply(&mut self, event: Event) {
        let kind = event.kind();

        if self.state == WorkflowState::Idle && kind == EventKind::Start {
            if let Event::Start { request, raw } = &event {
                self.record_start(request, raw);
            }
        }

        let Some(step) = transition(self.state, kind, self.cyclic_mode) else {
            self.logger
                .warn(&format!("Ignoring '{}' in state {}", kind, self.state));
            return;
        };

        if self.state == WorkflowState::Stopping && kind == EventKind::Idle {
            self.cyclic_mode = false;
        }

        if let Err(e) = self.exit_state().await {
            self.logger
                .error(&format!("Exit of {} failed: {}", self.state, e));
            self.shared.set_force_stop(true);
        }

        self.logger
            .info(&format!("Transition {} -> {}", self.state, step.to));
        self.state = step.to;

        if let Err(e) = self.enter_state().await {
            self.logger
                .error(&format!("Entry of {} failed: {}", self.state, e));
            self.shared.set_force_stop(true);
        }

        if let Some(next) = follow_up_event(step.follow_up) {
            self.mailbox.post(next);
        }
    }

    fn record_start(&mut self, request: &TestRequest, raw: &serde_json::Value) {
        // A new test re-arms the workflow after an emergency stop
        self.shared.set_force_stop(false);

        match request {
            TestRequest::Manual(ManualTest {
                sensor_id,
                setpoint,
                holdtime,
            }) => {
                self.cyclic_mode = false;
                self.sensor_id = sensor_id.clone();
                self.setpoint = *setpoint;
                self.holdtime = *holdtime;
                let current = self.shared.sensor(sensor_id).unwrap_or(0.0);
                self.action = if *setpoint > current {
                    Action::Positive
                } else {
                    Action::Negative
                };
            }
            TestRequest::Cyclic(CyclicTest {
                sensor_id,
                positive,
                negative,
                cycles,
                test_index,
            }) => {
                self.cyclic_mode = true;
                self.sensor_id = sensor_id.clone();
                self.positive_setpoint = *positive;
                self.negative_setpoint = *negative;
                self.cycle_counter = *cycles;
                self.shared.set_test_index_wanted(*test_index);
                self.action = if positive > negative {
                    Action::Positive
                } else {
                    Action::Negative
                };
                let raw = raw.clone();
                self.journal_store(move |r| r.command = raw);
            }
        }

        self.logger.info(&format!(
            "Recorded start: sensor {}, action {:?}, cyclic {}",
            self.sensor_id, self.action, self.cyclic_mode
        ));
    }

    async fn enter_state(&mut self) -> Result<()> {
        match self.state {
            WorkflowState::Idle => states::idle::enter(self).await,
            WorkflowState::InitializingValves => states::initializing_valves::enter(self).await,
            WorkflowState::StartingVfd => states::starting_vfd::enter(self).await,
            WorkflowState::Holding => states::holding::enter(self).await,
            WorkflowState::AutomaticCycling => states::automatic_cycling::enter(self).await,
            WorkflowState::Relief => states::relief::enter(self).await,
            WorkflowState::Stopping => states::stopping::enter(self).await,
        }
    }

    async fn exit_state(&mut self) -> Result<()> {
        match self.state {
            WorkflowState::Idle => Ok(()),
            WorkflowState::InitializingValves => states::initializing_valves::exit(self).await,
            WorkflowState::StartingVfd => states::starting_vfd::exit(self).await,
            WorkflowState::Holding => states::holding::exit(self).await,
            WorkflowState::AutomaticCycling => states::automatic_cycling::exit(self).await,
            WorkflowState::Relief => states::relief::exit(self).await,
            WorkflowState::Stopping => states::stopping::exit(self).await,
        }
    }

    pub(crate) async fn publish_valve(&self, name: &str, level: u8) -> Result<()> {
        self.client
            .publish(
                self.topics.valve(name),
                QoS::AtLeastOnce,
                false,
                level.to_string(),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn publish_role_valves(&self, role: ValveRole, level: u8) -> Result<()> {
        for valve in &self.config.valves {
            if valve.has_role(role) {
                self.publish_valve(&valve.name, level).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn publish_vfd(&self, command: VfdCommand) -> Result<()> {
        self.client
            .publish(
                self.topics.vfd_command(),
                QoS::AtLeastOnce,
                false,
                command.to_payload().to_string(),
            )
            .await?;
        Ok(())
    }

    /// Flush status and test index outside the 0.3 s cadence, for transient
    /// statuses the UI must not miss.
    pub(crate) async fn publish_status_now(&self) {
        self.client
            .publish(
                self.topics.status(),
                QoS::AtLeastOnce,
                false,
                self.shared.status(),
            )
            .await
            .ok();
        self.client
            .publish(
                self.topics.current_test_index(),
                QoS::AtLeastOnce,
                false,
                self.shared.current_test_index().to_string(),
            )
            .await
            .ok();
    }

    pub(crate) fn journal_store<F: FnOnce(&mut JournalRecord)>(&self, mutate: F) {
        store_journal(&self.journal, &self.logger, mutate);
    }

    /// Sleep in ≤100 ms ticks, returning true as soon as `force_stop` is
    /// observed.
    pub(crate) async fn pause(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.shared.force_stop() {
                return true;
            }
            let tick = remaining.min(Duration::from_millis(100));
            sleep(tick).await;
            remaining -= tick;
        }
        self.shared.force_stop()
    }

    /// Sleep in ≤100 ms ticks, returning true as soon as `exit` is observed.
    pub(crate) async fn pause_unless_exit(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.shared.exit() {
                return true;
            }
            let tick = remaining.min(Duration::from_millis(100));
            sleep(tick).await;
            remaining -= tick;
        }
        self.shared.exit()
    }
}

fn follow_up_event(kind: Option<EventKind>) -> Option<Event> {
    match kind? {
        EventKind::TurnOn => Some(Event::TurnOn),
        EventKind::Hold => Some(Event::Hold),
        EventKind::Automatic => Some(Event::Automatic),
        EventKind::Relief => Some(Event::Relief),
        EventKind::TurnOff => Some(Event::TurnOff),
        EventKind::Idle => Some(Event::Idle),
        // The table never synthesizes a start
        EventKind::Start => None,
    }
}

/// The coordinator process
pub struct StateMachine {
    config: Arc<Config>,
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    topics: Topics,
    shared: Arc<Shared>,
    journal: Arc<StdMutex<Journal>>,
    mailbox: Arc<Mailbox>,
    logger: crate::logging::StructuredLogger,
}

impl StateMachine {
    /// Build the coordinator, loading the journal for a possible resume.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let client_id = format!("{}-state-machine", config.device_id);
        let (client, eventloop) = mqtt::client(&config.mqtt, &client_id);
        let topics = Topics::new(&config.device_id);
        let logger = get_logger("statemachine");

        let journal = Journal::open(&config.journal_file);
        let record = journal.record().clone();

        let shared = Arc::new(Shared::new());
        shared.set_cyclic_resume(record.resume);
        shared.set_current_test_index(record.current_test_index);
        shared.set_cycle_index(record.cycle_index);
        shared.set_resume_command(record.command.clone());
        if record.current_inputs.as_object().is_some_and(|o| !o.is_empty()) {
            shared.set_current_inputs(record.current_inputs.clone());
        }

        if record.resume {
            logger.info(&format!(
                "Journal holds an interrupted cyclic test at cycle {}",
                record.cycle_index
            ));
        }

        Ok(Self {
            config: Arc::new(config),
            client,
            eventloop: Some(eventloop),
            topics,
            shared,
            journal: Arc::new(StdMutex::new(journal)),
            mailbox: Arc::new(Mailbox::new()),
            logger,
        })
    }

    /// Run until process exit is requested or the broker is lost for good.
    pub async fn run(mut self) -> Result<()> {
        let mut eventloop = self
            .eventloop
            .take()
            .ok_or_else(|| TorrError::generic("state machine already running"))?;

        let worker = tokio::spawn(worker_loop(Workflow::new(
            Arc::clone(&self.config),
            self.client.clone(),
            self.topics.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.journal),
            Arc::clone(&self.mailbox),
        )));

        let feedback = tokio::spawn(feedback_loop(
            self.client.clone(),
            self.topics.clone(),
            Arc::clone(&self.shared),
        ));

        let signal_shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_shared.set_force_stop(true);
                signal_shared.set_exit(true);
            }
        });

        let mut attempts = 0u32;
        let mut exhausted = false;

        while !self.shared.exit() {
            tokio::select! {
                polled = eventloop.poll() => match polled {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        self.logger.info("Connected to MQTT broker");
                        attempts = 0;
                        if let Err(e) = self.subscribe_all().await {
                            self.logger.error(&format!("Subscribe failed: {}", e));
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.logger
                            .warn(&format!("MQTT connection error: {}", e));
                        // A broken bus mid-test is an abort condition; the
                        // workflow winds down while we retry.
                        self.shared.set_force_stop(true);
                        attempts += 1;
                        if attempts >= self.config.mqtt.retry_attempts {
                            self.logger.error("Exceeded maximum MQTT retry attempts");
                            exhausted = true;
                            self.shared.set_exit(true);
                            break;
                        }
                        sleep(Duration::from_secs(self.config.mqtt.retry_interval_secs)).await;
                    }
                },
                _ = sleep(Duration::from_millis(250)) => {}
            }
        }

        self.shared.set_exit(true);
        worker.await.ok();
        feedback.await.ok();
        self.logger.info("State machine stopped");

        if exhausted {
            Err(TorrError::mqtt("broker unreachable, giving up"))
        } else {
            Ok(())
        }
    }

    async fn subscribe_all(&self) -> Result<()> {
        let mut topics = vec![
            self.topics.command(),
            self.topics.resume_cancel(),
            self.topics.vfd_command(),
            self.topics.emergency_stop(),
            self.topics.current_input(),
            self.topics.valves_status(),
            self.topics.vfd_feedback(),
        ];
        for sensor in &self.config.sensors {
            topics.push(self.topics.sensor(&sensor.address.to_string()));
        }

        for topic in topics {
            self.logger.debug(&format!("Subscribing to {}", topic));
            self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        match self.topics.parse(topic) {
            Some(IncomingTopic::VfdCommand) => {
                // Echo-observe our own drive commands to track the commanded
                // frequency.
                if let Ok(VfdCommand::SetFrequency(freq)) = VfdCommand::parse(payload) {
                    self.shared.set_freq_command(freq);
                }
            }
            Some(IncomingTopic::Command) => {
                match serde_json::from_slice::<serde_json::Value>(payload) {
                    Ok(value) => match types::parse_command(&value) {
                        Ok(event) => {
                            self.logger
                                .info(&format!("Command received: {}", event.kind()));
                            self.mailbox.post(event);
                        }
                        Err(e) => self.logger.warn(&format!("Rejected command: {}", e)),
                    },
                    Err(e) => self
                        .logger
                        .warn(&format!("Command payload is not JSON: {}", e)),
                }
            }
            Some(IncomingTopic::ResumeCancel) => self.cancel_resume(),
            Some(IncomingTopic::EmergencyStop) => {
                self.logger.warn("Emergency stop received");
                self.client
                    .publish(
                        self.topics.vfd_command(),
                        QoS::AtLeastOnce,
                        false,
                        VfdCommand::EmergencyStop.to_payload().to_string(),
                    )
                    .await
                    .ok();
                self.shared.set_force_stop(true);
            }
            Some(IncomingTopic::Sensor(address)) => {
                match String::from_utf8_lossy(payload).trim().parse::<f64>() {
                    Ok(value) => self.shared.set_sensor(address, value),
                    Err(_) => self
                        .logger
                        .debug(&format!("Discarded non-numeric payload on {}", topic)),
                }
            }
            Some(IncomingTopic::VfdFeedback) => {
                match String::from_utf8_lossy(payload).trim().parse::<f64>() {
                    Ok(value) => self.shared.set_vfd_feedback(value),
                    Err(_) => self
                        .logger
                        .debug(&format!("Discarded non-numeric payload on {}", topic)),
                }
            }
            Some(IncomingTopic::ValveStatus) => {
                match serde_json::from_slice::<std::collections::HashMap<String, serde_json::Value>>(
                    payload,
                ) {
                    Ok(map) => {
                        let statuses = map
                            .into_iter()
                            .filter_map(|(name, value)| {
                                value
                                    .as_i64()
                                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                                    .map(|level| (name, u8::from(level != 0)))
                            })
                            .collect();
                        self.shared.set_valve_statuses(statuses);
                    }
                    Err(e) => self
                        .logger
                        .warn(&format!("Valve status payload rejected: {}", e)),
                }
            }
            Some(IncomingTopic::CurrentInput) => {
                match serde_json::from_slice::<serde_json::Value>(payload) {
                    Ok(value) => {
                        self.shared.set_current_inputs(value.clone());
                        store_journal(&self.journal, &self.logger, move |r| {
                            r.current_inputs = value;
                        });
                    }
                    Err(e) => self
                        .logger
                        .warn(&format!("Current input payload rejected: {}", e)),
                }
            }
            None => {}
        }
    }

    fn cancel_resume(&self) {
        self.logger.info("Persisted resume cancelled");
        self.shared.set_current_test_index(0);
        self.shared.set_test_index_wanted(0);
        self.shared.set_cyclic_resume(false);
        self.shared.set_cycle_index(0);
        self.shared
            .set_resume_command(serde_json::Value::Object(serde_json::Map::new()));
        self.shared.set_status("idle");
        store_journal(&self.journal, &self.logger, |r| {
            r.resume = false;
            r.command = serde_json::Value::Object(serde_json::Map::new());
            r.current_test_index = 0;
            r.cycle_index = 0;
        });
    }
}

async fn worker_loop(mut workflow: Workflow) {
    workflow.startup().await;
    loop {
        if workflow.shared.exit() {
            break;
        }
        if let Some(event) = workflow.mailbox.take() {
            workflow.apply(event).await;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn feedback_loop(client: AsyncClient, topics: Topics, shared: Arc<Shared>) {
    while !shared.exit() {
        client
            .publish(topics.status(), QoS::AtLeastOnce, false, shared.status())
            .await
            .ok();
        client
            .publish(
                topics.current_test_index(),
                QoS::AtLeastOnce,
                false,
                shared.current_test_index().to_string(),
            )
            .await
            .ok();

        if shared.cyclic_resume() {
            let payload = serde_json::json!({"command": shared.resume_command()}).to_string();
            client
                .publish(topics.resume_status(), QoS::AtLeastOnce, false, payload)
                .await
                .ok();
        }

        if let Some(inputs) = shared.current_inputs() {
            client
                .publish(
                    topics.initial_value(),
                    QoS::AtLeastOnce,
                    false,
                    inputs.to_string(),
                )
                .await
                .ok();
        }

        sleep(Duration::from_millis(300)).await;
    }
}
