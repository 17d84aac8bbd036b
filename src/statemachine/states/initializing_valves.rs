//! InitializingValves: command the ACTIVE valves into the configuration for
//! the requested stroke direction, then wait for the valve driver to confirm.

use crate::error::Result;
use crate::statemachine::Workflow;
use crate::statemachine::types::commanded_level;
use std::time::Duration;
use tokio::time::sleep;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    wf.logger.info("Initializing valves");

    for valve in &wf.config.valves {
        if let Some(level) = commanded_level(valve, wf.action) {
            wf.publish_valve(&valve.name, level).await?;
        }
    }

    wf.shared.set_status("valves configuration requested");
    Ok(())
}

pub(crate) async fn exit(wf: &Workflow) -> Result<()> {
    while !wf.shared.force_stop() {
        let all_matched = wf.config.valves.iter().all(|valve| {
            match commanded_level(valve, wf.action) {
                Some(level) => wf.shared.valve_status(&valve.name) == Some(level),
                None => true,
            }
        });
        if all_matched {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    wf.shared.set_status("valves configuration approved");
    Ok(())
}
