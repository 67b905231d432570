//! Warden core: a container-orchestration control plane for a fixed catalog
//! of cooperating services.

pub mod catalog;
pub mod config;
pub mod docker;
pub mod engine;
pub mod health;
pub mod history;
pub mod http;
pub mod logging;
pub mod mount;
pub mod planner;
pub mod wizard;

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::WardenConfig;
use crate::docker::DockerGateway;
use crate::engine::InstallationEngine;
use crate::health::HealthProber;
use crate::history::HistoryStore;
use crate::wizard::WizardPublisher;

/// The managed bridge network every catalog service is launched on.
pub const MANAGED_NETWORK: &str = "warden-net";

/// Wires up every component and hands back the pieces `main` needs:
/// the shared `InstallationEngine` driving installs, and the `DockerGateway`
/// needed for graceful-shutdown container teardown.
pub struct Warden {
    pub config: WardenConfig,
    pub catalog: Arc<Catalog>,
    pub docker: Arc<DockerGateway>,
    pub history: Arc<HistoryStore>,
    pub wizard: Arc<WizardPublisher>,
    pub engine: Arc<InstallationEngine>,
}

impl Warden {
    /// Builds every component from a loaded configuration. Returns a startup
    /// error if the Docker gateway cannot connect.
    pub fn bootstrap(config: WardenConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(Catalog::load());
        let docker = Arc::new(DockerGateway::new(&config)?);
        let history = Arc::new(HistoryStore::new(config.history_capacity));
        let wizard = Arc::new(WizardPublisher::new(&config, &catalog));
        let health = Arc::new(HealthProber::new(std::time::Duration::from_secs(
            config.health_timeout_secs,
        )));

        let engine = Arc::new(InstallationEngine::new(
            Arc::clone(&catalog),
            Arc::clone(&docker),
            Arc::clone(&history),
            Arc::clone(&wizard),
            health,
            MANAGED_NETWORK.to_owned(),
            config.host_service_url.clone(),
        ));

        Ok(Self {
            config,
            catalog,
            docker,
            history,
            wizard,
            engine,
        })
    }
}
