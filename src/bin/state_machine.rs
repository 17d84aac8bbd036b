use anyhow::Result;
use torr::statemachine::StateMachine;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = torr::Config::load_from_args()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    torr::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let machine = StateMachine::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create state machine: {}", e))?;

    info!("Torr state machine starting up");

    match machine.run().await {
        Ok(()) => {
            info!("State machine shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("State machine failed with error: {}", e);
            Err(anyhow::anyhow!("State machine error: {}", e))
        }
    }
}
