use std::sync::Arc;

use log::{error, info};

use crate::commons::error::Error;
use crate::constants::{MCM_CLIENT_APP, MCM_CLIENT_VERSION};
use crate::daemon::config::Config;
use crate::daemon::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::remote::control::ControlChannel;
use crate::remote::hub::HubClient;
use crate::remote::vault::VaultClient;
use crate::remote::Collaborators;

/// Builds the collaborators from the config and runs the state machine
/// until the process is told to stop.
pub async fn start_mcm_client(config: Config, control: ControlChannel) -> Result<(), Error> {
    info!("Starting {} v{} for {}", MCM_CLIENT_APP, MCM_CLIENT_VERSION, config.dfsp_id);

    let vault = VaultClient::connect(config.vault.clone()).await?;
    let hub = Arc::new(HubClient::new(config.hub.clone(), config.dfsp_id.clone()));

    let orchestrator = Orchestrator::new(OrchestratorConfig {
        settings: config.settings(),
        retry: config.retry_policy(),
        report_interval: config.report_interval(),
        collaborators: Collaborators {
            vault,
            hub,
            control: Arc::new(control),
            cert_manager: None,
            dfsp_id: config.dfsp_id.clone(),
        },
    })?;
    orchestrator.start().await?;

    let res = tokio::signal::ctrl_c().await;
    info!("Stopping {}", MCM_CLIENT_APP);
    orchestrator.stop().await;

    res.map_err(|e| {
        error!("Cannot listen for the stop signal: {}", e);
        Error::IoError(e)
    })
}
