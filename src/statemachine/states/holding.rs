//! Holding: wait for the sensor to cross the setpoint, then count the hold
//! time down in 100 ms steps. Manual mode only.

use crate::error::{Result, TorrError};
use crate::statemachine::Workflow;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const TUNING_TIMEOUT_SECS: u64 = 90;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    let baseline = wf.shared.sensor(&wf.sensor_id).unwrap_or(0.0);
    wf.logger
        .debug(&format!("Sensor baseline before tuning: {}", baseline));

    wf.shared.set_status("zero_slider");
    wf.publish_status_now().await;
    wf.shared.set_status("tuning");

    let started = Instant::now();
    while !wf.shared.force_stop() {
        let value = wf.shared.sensor(&wf.sensor_id).unwrap_or(0.0);
        if value.abs() > wf.setpoint.abs() {
            wf.logger.info(&format!("Setpoint reached: {}", value));
            break;
        }
        if started.elapsed() > Duration::from_secs(TUNING_TIMEOUT_SECS) {
            return Err(TorrError::tuning_timeout(TUNING_TIMEOUT_SECS));
        }
        sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

pub(crate) async fn exit(wf: &Workflow) -> Result<()> {
    wf.shared.set_status("tuned");
    wf.publish_status_now().await;

    wf.logger
        .info(&format!("Starting holding time for {} seconds", wf.holdtime));
    let mut remaining = (wf.holdtime * 10.0).round() as i64;
    while remaining > 0 && !wf.shared.force_stop() {
        remaining -= 1;
        sleep(Duration::from_millis(100)).await;
        wf.shared
            .set_status(&format!("Holding {:.1}s", remaining as f64 / 10.0));
    }

    if wf.shared.force_stop() {
        wf.logger.warn("Holding time interrupted");
    } else {
        wf.logger.info("Holding time completed");
    }
    Ok(())
}
