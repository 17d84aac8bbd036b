//! Sensor sampling surface
//!
//! Polls every configured sensor through the serial multiplexer at its own
//! frequency and publishes readings on `{device}/sensors/{address}`.
//! Pressure sensors read an IEEE-754 float; flow sensors read a raw
//! differential pressure and convert it to volumetric flow through the
//! ambient air-density model, whose inputs can be refreshed over MQTT.

use crate::config::{SensorConfig, SensorKind};
use crate::error::{Result, TorrError};
use crate::logging::get_logger;
use crate::mqtt::Topics;
use crate::serial::{SerialCom, decode_32bit_uint};
use rumqttc::{AsyncClient, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Pressure sensor value register (IEEE-754 f32, fc 3)
pub const PRESSURE_REGISTER: u16 = 1028;
/// Instrument-to-engineering-unit factor for pressure sensors
pub const PRESSURE_SCALE: f64 = 144.0;
/// Flow sensor raw differential-pressure register (u32 big-endian)
pub const FLOW_REGISTER: u16 = 0x0424;
/// Raw flow register scaling (1e-4 instrument units per count)
pub const FLOW_RAW_SCALE: f64 = 1.0e-4;

/// Ambient conditions feeding the air-density model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientConditions {
    /// Absolute pressure in Pa
    pub pressure_pa: f64,
    /// Temperature in K
    pub temperature_k: f64,
    /// Relative humidity as a 0-1 ratio
    pub humidity: f64,
}

impl Default for AmbientConditions {
    fn default() -> Self {
        Self {
            pressure_pa: 101325.0,
            temperature_k: 87.0,
            humidity: 0.66,
        }
    }
}

/// Which ambient input an MQTT message refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbientField {
    Pressure,
    Humidity,
    Temperature,
}

/// Apply one ambient message. Pressure arrives in the pressure sensors' own
/// engineering unit (lbf/ft^2) and is converted to Pa; humidity arrives in
/// percent; temperature is used as-is.
pub fn apply_ambient(conditions: &mut AmbientConditions, field: AmbientField, value: f64) {
    match field {
        AmbientField::Pressure => conditions.pressure_pa = value * 47.88 + 101300.0,
        AmbientField::Humidity => conditions.humidity = value / 100.0,
        AmbientField::Temperature => conditions.temperature_k = value,
    }
}

/// Map of ambient topic -> field for all flow sensors in the configuration
pub fn ambient_topic_map(sensors: &[SensorConfig]) -> HashMap<String, AmbientField> {
    let mut map = HashMap::new();
    for sensor in sensors {
        if let Some(ambient) = &sensor.ambient {
            map.insert(
                format!("{}/sensors/{}", ambient.device_id, ambient.pressure_address),
                AmbientField::Pressure,
            );
            map.insert(
                format!("{}/sensors/humidity", ambient.device_id),
                AmbientField::Humidity,
            );
            map.insert(
                format!("{}/sensors/temperature", ambient.device_id),
                AmbientField::Temperature,
            );
        }
    }
    map
}

/// Moist-air density in kg/m^3
pub fn air_density(conditions: &AmbientConditions) -> f64 {
    let phi = conditions.humidity;
    let p = conditions.pressure_pa;
    let t = conditions.temperature_k;

    let n1 = 0.0289652 * phi * p;

    let x = 7.5 * (t - 273.15) / (t + 237.3);
    let n2 = 0.018016 * phi * 6.1078 * 10f64.powf(x);

    (n1 + n2) / (8.31446 * t)
}

/// Volumetric flow from a differential pressure in instrument units
pub fn volumetric_flow(delta_p: f64, conditions: &AmbientConditions) -> f64 {
    0.032429 * (2.0 * delta_p / air_density(conditions)).sqrt()
}

/// Round a value down to two decimals, the wire precision of sensor feeds
pub fn floor_hundredths(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}

/// Read one sensor according to its register policy
pub async fn read_sensor(
    serial: &SerialCom,
    sensor: &SensorConfig,
    ambient: &RwLock<AmbientConditions>,
) -> Result<f64> {
    match sensor.kind {
        SensorKind::Pressure => {
            let value = serial
                .read_float(sensor.address, PRESSURE_REGISTER, 2)
                .await?;
            Ok(value * PRESSURE_SCALE)
        }
        SensorKind::Flow => {
            let regs = serial
                .read_registers(sensor.address, FLOW_REGISTER, 2, 3)
                .await?;
            let delta_p = f64::from(decode_32bit_uint(&regs)?) * FLOW_RAW_SCALE;
            let conditions = ambient
                .read()
                .map(|guard| *guard)
                .map_err(|_| TorrError::generic("ambient conditions lock poisoned"))?;
            Ok(volumetric_flow(delta_p, &conditions))
        }
    }
}

/// Hosts one polling task per configured sensor
pub struct SensorPoller {
    serial: Arc<SerialCom>,
    client: AsyncClient,
    topics: Topics,
    sensors: Vec<SensorConfig>,
    ambient: Arc<RwLock<AmbientConditions>>,
    exit: Arc<AtomicBool>,
}

impl SensorPoller {
    pub fn new(
        serial: Arc<SerialCom>,
        client: AsyncClient,
        topics: Topics,
        sensors: Vec<SensorConfig>,
        ambient: Arc<RwLock<AmbientConditions>>,
        exit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            serial,
            client,
            topics,
            sensors,
            ambient,
            exit,
        }
    }

    /// Spawn the polling tasks, one per sensor
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.sensors
            .iter()
            .cloned()
            .map(|sensor| {
                let serial = Arc::clone(&self.serial);
                let client = self.client.clone();
                let topics = self.topics.clone();
                let ambient = Arc::clone(&self.ambient);
                let exit = Arc::clone(&self.exit);
                tokio::spawn(async move {
                    poll_loop(serial, client, topics, sensor, ambient, exit).await;
                })
            })
            .collect()
    }
}

async fn poll_loop(
    serial: Arc<SerialCom>,
    client: AsyncClient,
    topics: Topics,
    sensor: SensorConfig,
    ambient: Arc<RwLock<AmbientConditions>>,
    exit: Arc<AtomicBool>,
) {
    let logger = get_logger("sensors");
    let topic = topics.sensor(&sensor.address.to_string());
    let period = Duration::from_secs_f64(1.0 / sensor.frequency);
    let mut last_value = 0.0f64;

    logger.info(&format!(
        "Polling {} (slave {}) every {:?}",
        sensor.name, sensor.address, period
    ));

    while !exit.load(Ordering::SeqCst) {
        match read_sensor(&serial, &sensor, &ambient).await {
            Ok(value) => {
                last_value = value;
                if sensor.debug {
                    logger.debug(&format!("{} read {}", sensor.name, value));
                }
            }
            // Serial transients are swallowed; the last good value keeps
            // flowing so downstream consumers never see a gap.
            Err(e) => logger.debug(&format!("{} read failed: {}", sensor.name, e)),
        }

        let payload = format!("{:.2}", floor_hundredths(last_value));
        if let Err(e) = client
            .publish(topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
        {
            logger.warn(&format!("Publish for {} failed: {}", sensor.name, e));
        }

        sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmbientConfig;

    fn close(a: f64, b: f64, rel: f64) -> bool {
        (a - b).abs() <= rel * b.abs().max(1e-12)
    }

    #[test]
    fn density_at_default_conditions() {
        let density = air_density(&AmbientConditions::default());
        assert!(close(density, 2.6778, 1e-3), "density was {}", density);
    }

    #[test]
    fn flow_spot_value_and_monotonicity() {
        let conditions = AmbientConditions::default();
        let q1 = volumetric_flow(1.0, &conditions);
        assert!(close(q1, 0.028026, 1e-3), "qv was {}", q1);

        assert_eq!(volumetric_flow(0.0, &conditions), 0.0);
        assert!(volumetric_flow(4.0, &conditions) > q1);
    }

    #[test]
    fn floor_rounds_toward_negative_infinity() {
        assert_eq!(floor_hundredths(1.239), 1.23);
        assert_eq!(floor_hundredths(10.0), 10.0);
        assert_eq!(floor_hundredths(-1.231), -1.24);
    }

    #[test]
    fn ambient_messages_convert_units() {
        let mut conditions = AmbientConditions::default();

        apply_ambient(&mut conditions, AmbientField::Humidity, 50.0);
        assert!((conditions.humidity - 0.5).abs() < 1e-12);

        apply_ambient(&mut conditions, AmbientField::Temperature, 293.15);
        assert!((conditions.temperature_k - 293.15).abs() < 1e-12);

        apply_ambient(&mut conditions, AmbientField::Pressure, 0.0);
        assert!((conditions.pressure_pa - 101300.0).abs() < 1e-9);
        apply_ambient(&mut conditions, AmbientField::Pressure, 10.0);
        assert!((conditions.pressure_pa - (478.8 + 101300.0)).abs() < 1e-9);
    }

    #[test]
    fn ambient_topic_map_covers_flow_sensors() {
        let sensors = vec![
            SensorConfig {
                name: "chamber".to_string(),
                kind: SensorKind::Pressure,
                address: 1,
                frequency: 20.0,
                debug: false,
                ambient: None,
            },
            SensorConfig {
                name: "intake".to_string(),
                kind: SensorKind::Flow,
                address: 2,
                frequency: 5.0,
                debug: false,
                ambient: Some(AmbientConfig {
                    device_id: "rig1".to_string(),
                    pressure_address: "1".to_string(),
                }),
            },
        ];

        let map = ambient_topic_map(&sensors);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("rig1/sensors/1"), Some(&AmbientField::Pressure));
        assert_eq!(
            map.get("rig1/sensors/humidity"),
            Some(&AmbientField::Humidity)
        );
        assert_eq!(
            map.get("rig1/sensors/temperature"),
            Some(&AmbientField::Temperature)
        );
    }

    #[test]
    fn register_policy_constants() {
        assert_eq!(PRESSURE_REGISTER, 1028);
        assert_eq!(FLOW_REGISTER, 0x0424);
        assert!((PRESSURE_SCALE - 144.0).abs() < f64::EPSILON);
        assert!((FLOW_RAW_SCALE - 1.0e-4).abs() < f64::EPSILON);
    }
}
