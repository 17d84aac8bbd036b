//! StartingVfd: reset the frequency setpoint, start the drive, and wait for
//! it to acknowledge zero-speed ready.

use crate::error::{Result, TorrError};
use crate::statemachine::Workflow;
use crate::vfd::VfdCommand;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const START_TIMEOUT_SECS: u64 = 90;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    wf.logger.info("Starting VFD");
    wf.publish_vfd(VfdCommand::SetFrequency(0.0)).await?;
    wf.publish_vfd(VfdCommand::Start).await?;
    wf.shared.set_status("vfd reset");
    Ok(())
}

pub(crate) async fn exit(wf: &Workflow) -> Result<()> {
    let started = Instant::now();
    while !wf.shared.force_stop() {
        if wf.shared.vfd_feedback().abs() < f64::EPSILON {
            wf.logger.info("VFD feedback at zero, drive ready");
            break;
        }
        if started.elapsed() > Duration::from_secs(START_TIMEOUT_SECS) {
            return Err(TorrError::vfd_start_timeout(START_TIMEOUT_SECS));
        }
        sleep(Duration::from_millis(100)).await;
    }

    wf.shared.set_status("vfd started");
    Ok(())
}
