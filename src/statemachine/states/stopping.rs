//! Stopping: command the drive down until it reads zero, then close the
//! ACTIVE valves on the way out.

use crate::config::ValveRole;
use crate::error::Result;
use crate::statemachine::Workflow;
use crate::vfd::VfdCommand;
use std::time::Duration;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    wf.logger.info("Stopping VFD");
    wf.shared.set_status("colding down");
    if wf.shared.force_stop() {
        wf.shared.set_status("emergency: waiting for vdf to stop");
    }

    // The spin-down keeps running under force_stop; only process exit
    // abandons the drive.
    while !wf.shared.exit() {
        if wf.shared.vfd_feedback().abs() < f64::EPSILON {
            break;
        }
        wf.publish_vfd(VfdCommand::SetFrequency(0.0)).await?;
        wf.publish_vfd(VfdCommand::Stop).await?;
        wf.pause_unless_exit(Duration::from_secs(1)).await;
    }

    wf.shared.set_status("vfd stopped");
    Ok(())
}

pub(crate) async fn exit(wf: &Workflow) -> Result<()> {
    for valve in &wf.config.valves {
        if valve.has_role(ValveRole::Active) {
            wf.publish_valve(&valve.name, 1).await?;
        }
    }
    wf.logger.info("Valves closed");
    wf.shared.set_status("Closed Valves");
    Ok(())
}
