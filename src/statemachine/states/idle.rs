//! Idle: the only resting state. Entry restores every valve to its rest
//! level and zeroes the frequency command.

use crate::config::ValveRole;
use crate::error::Result;
use crate::statemachine::Workflow;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    wf.shared.set_freq_command(0.0);

    for valve in &wf.config.valves {
        if !valve.has_role(ValveRole::Force) {
            wf.publish_valve(&valve.name, 1).await?;
        }
    }

    for valve in &wf.config.valves {
        if valve.has_role(ValveRole::AlwaysOn) {
            wf.publish_valve(&valve.name, 0).await?;
        }
        if valve.has_role(ValveRole::AlwaysOff) {
            wf.publish_valve(&valve.name, 1).await?;
        }
    }

    wf.logger.info("Valves restored to rest levels");
    wf.shared.set_status("idle");
    Ok(())
}
