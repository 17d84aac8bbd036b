//! Serial service entry point: owns the RS-485 port and hosts the VFD
//! driver and the sensor poller behind the locking multiplexer.

use anyhow::Result;
use rumqttc::{Event as MqttEvent, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use torr::logging::get_logger;
use torr::mqtt::{self, IncomingTopic, Topics};
use torr::sensors::{AmbientConditions, SensorPoller, ambient_topic_map, apply_ambient};
use torr::serial::SerialCom;
use torr::vfd::{VfdCommand, VfdDriver};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = torr::Config::load_from_args()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    torr::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!("Torr serial service starting up");

    let client_id = format!("{}-serial-service", config.device_id);
    let (client, mut eventloop) = mqtt::client(&config.mqtt, &client_id);
    let topics = Topics::new(&config.device_id);

    let serial = Arc::new(
        SerialCom::open(&config.serial)
            .map_err(|e| anyhow::anyhow!("Failed to open serial port: {}", e))?,
    );

    let exit = Arc::new(AtomicBool::new(false));
    let ambient = Arc::new(RwLock::new(AmbientConditions::default()));
    let ambient_topics = ambient_topic_map(&config.sensors);

    let vfd = VfdDriver::new(
        Arc::clone(&serial),
        client.clone(),
        topics.clone(),
        &config.vfd,
    );

    let mut tasks = SensorPoller::new(
        Arc::clone(&serial),
        client.clone(),
        topics.clone(),
        config.sensors.clone(),
        Arc::clone(&ambient),
        Arc::clone(&exit),
    )
    .spawn();

    {
        let vfd = vfd.clone();
        let exit = Arc::clone(&exit);
        tasks.push(tokio::spawn(async move { vfd.run_feedback(exit).await }));
    }

    let logger = get_logger("serial_service");
    let mut attempts = 0u32;

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logger.info("Shutdown requested");
                break Ok(());
            }
            polled = eventloop.poll() => match polled {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    logger.info("Connected to MQTT broker");
                    attempts = 0;
                    if let Err(e) = client.subscribe(topics.vfd_command(), QoS::AtLeastOnce).await {
                        logger.error(&format!("Subscribe failed: {}", e));
                    }
                    for topic in ambient_topics.keys() {
                        if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                            logger.error(&format!("Subscribe failed: {}", e));
                        }
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    if let Some(field) = ambient_topics.get(publish.topic.as_str()) {
                        match String::from_utf8_lossy(&publish.payload).trim().parse::<f64>() {
                            Ok(value) => {
                                if let Ok(mut conditions) = ambient.write() {
                                    apply_ambient(&mut conditions, *field, value);
                                }
                            }
                            Err(_) => logger.debug(&format!(
                                "Discarded non-numeric ambient payload on {}",
                                publish.topic
                            )),
                        }
                    } else if topics.parse(&publish.topic) == Some(IncomingTopic::VfdCommand) {
                        match VfdCommand::parse(&publish.payload) {
                            // The spin-down polls the bus until the drive
                            // stops; run it off the command stream.
                            Ok(VfdCommand::EmergencyStop) => {
                                let vfd = vfd.clone();
                                tokio::spawn(async move { vfd.emergency_stop().await });
                            }
                            Ok(command) => vfd.handle(command).await,
                            Err(e) => logger.warn(&format!("Rejected vfd command: {}", e)),
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    logger.warn(&format!("MQTT connection error: {}", e));
                    attempts += 1;
                    if attempts >= config.mqtt.retry_attempts {
                        logger.error("Exceeded maximum MQTT retry attempts");
                        break Err(anyhow::anyhow!("Broker unreachable, giving up"));
                    }
                    sleep(Duration::from_secs(config.mqtt.retry_interval_secs)).await;
                }
            }
        }
    };

    exit.store(true, Ordering::SeqCst);
    for task in tasks {
        task.await.ok();
    }

    info!("Serial service stopped");
    result
}
