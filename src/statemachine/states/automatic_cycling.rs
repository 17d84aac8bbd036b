//! AutomaticCycling: ramp the drive up to the larger setpoint, then stroke
//! between the release valves for the requested number of cycles, journaling
//! progress so a crash can resume mid-test.

use crate::config::ValveRole;
use crate::error::Result;
use crate::statemachine::Workflow;
use crate::statemachine::types::{Action, ramp_step};
use crate::vfd::VfdCommand;
use std::time::Duration;

/// Fixed dwell of each half stroke
const STROKE_DWELL: Duration = Duration::from_millis(800);

/// The drive is considered caught up when the commanded frequency leads the
/// feedback by less than this
const CATCH_UP_THRESHOLD: f64 = 0.3;

pub(crate) async fn enter(wf: &Workflow) -> Result<()> {
    wf.shared.set_status("warming up");
    wf.journal_store(|r| r.resume = true);

    let setpoint = wf.positive_setpoint.abs().max(wf.negative_setpoint.abs());
    let mut freq = 0.0;

    while !wf.shared.force_stop() {
        let error = wf.shared.sensor(&wf.sensor_id).unwrap_or(0.0).abs() - setpoint;
        if wf.shared.freq_command() - wf.shared.vfd_feedback() < CATCH_UP_THRESHOLD {
            freq += ramp_step(error.abs());
        }
        wf.publish_vfd(VfdCommand::SetFrequency(freq)).await?;

        if error >= 0.0 {
            break;
        }
        if wf.pause(Duration::from_secs(1)).await {
            break;
        }
    }
    Ok(())
}

pub(crate) async fn exit(wf: &Workflow) -> Result<()> {
    let release_role = match wf.action {
        Action::Positive => ValveRole::PositiveRelease,
        Action::Negative => ValveRole::NegativeRelease,
    };

    for cycle in wf.shared.cycle_index()..wf.cycle_counter {
        if wf.shared.force_stop() {
            return Ok(());
        }
        // The journal commits the cycle about to run; after a crash the test
        // re-enters here with this index.
        wf.shared.set_cycle_index(cycle);
        wf.journal_store(|r| r.cycle_index = cycle);

        wf.shared
            .set_status(&format!("Cycle {} High Stroke", cycle + 1));
        wf.publish_role_valves(release_role, 0).await?;
        if wf.pause(STROKE_DWELL).await {
            return Ok(());
        }

        wf.shared
            .set_status(&format!("Cycle {} Low Stroke", cycle + 1));
        wf.publish_role_valves(release_role, 1).await?;
        if wf.pause(STROKE_DWELL).await {
            return Ok(());
        }

        if cycle + 1 == wf.cycle_counter {
            for valve in &wf.config.valves {
                wf.publish_valve(&valve.name, 1).await?;
            }
        }
    }

    if !wf.shared.force_stop() {
        let wanted = wf.shared.test_index_wanted();
        wf.shared.set_current_test_index(wanted);
        wf.journal_store(|r| r.current_test_index = wanted);
    }

    wf.shared.set_cycle_index(0);
    wf.journal_store(|r| r.cycle_index = 0);
    wf.journal_store(|r| r.resume = false);
    wf.shared.set_cyclic_resume(false);
    Ok(())
}
