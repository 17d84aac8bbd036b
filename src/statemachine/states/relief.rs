//! Relief: vent the circuit by opening every valve, then wait for the valve
//! driver to confirm all of them.

use crate::error::Result;
use crate::statemachine::Workflow;
use std::time::Duration;
use tokio::time::sleep;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    for valve in &wf.config.valves {
        wf.publish_valve(&valve.name, 1).await?;
    }
    wf.logger.info("Relief requested on all valves");
    wf.shared.set_status("relief configuration requested");
    Ok(())
}

pub(crate) async fn exit(wf: &Workflow) -> Result<()> {
    while !wf.shared.force_stop() {
        let all_open = wf
            .config
            .valves
            .iter()
            .all(|valve| wf.shared.valve_status(&valve.name) == Some(1));
        if all_open {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    wf.shared.set_status("valves configured");
    Ok(())
}
