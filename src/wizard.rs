//! Wizard step-state projection and publication (`spec.md` §4.8).
//! Grounded on the teacher's `servers/remote.rs::RemoteClient` for the
//! Bearer-authenticated reqwest client, generalized from request/response
//! calls into a single-writer state plus a detached publisher task
//! (`watch` channel coalesces to the latest snapshot, so a slow remote
//! never builds an unbounded backlog of stale updates).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::catalog::{Catalog, WIZARD_STEPS};
use crate::config::WardenConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Complete,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepState {
    pub status: StepStatus,
    pub detail: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepState {
    fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Pending,
            detail: None,
            error: None,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WizardState {
    pub version: u64,
    pub steps: HashMap<&'static str, StepState>,
}

struct Inner {
    state: WizardState,
    /// Per-service installation-domain status, used to re-derive step
    /// aggregation on every `trackServiceStatus` call.
    service_status: HashMap<String, String>,
    step_services: HashMap<&'static str, Vec<String>>,
}

/// Single writer for the wizard's step-state machine; publishes a
/// consolidated snapshot to the external state store after every mutation.
pub struct WizardPublisher {
    inner: Mutex<Inner>,
    tx: watch::Sender<WizardState>,
}

impl WizardPublisher {
    pub fn new(config: &WardenConfig, catalog: &Catalog) -> Self {
        let now = Utc::now();
        let steps: HashMap<&'static str, StepState> = WIZARD_STEPS
            .iter()
            .map(|s| (*s, StepState::pending(now)))
            .collect();

        let step_services: HashMap<&'static str, Vec<String>> = WIZARD_STEPS
            .iter()
            .map(|s| (*s, catalog.wizard_step_services(s).to_vec()))
            .collect();

        let state = WizardState { version: 0, steps };
        let (tx, rx) = watch::channel(state.clone());

        let publisher = Self {
            inner: Mutex::new(Inner {
                state,
                service_status: HashMap::new(),
                step_services,
            }),
            tx,
        };

        spawn_publisher_task(config, rx);
        publisher
    }

    /// Clears the aggregate and marks every step pending for a fresh batch.
    pub fn reset(&self, service_names: &[String]) {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        inner.service_status.clear();
        for name in service_names {
            inner.service_status.insert(name.clone(), "pending".to_owned());
        }

        for step in inner.state.steps.values_mut() {
            *step = StepState::pending(now);
        }

        self.publish(&mut inner);
    }

    /// Re-derives the step(s) containing `service` from the full set of
    /// tracked service statuses (`spec.md` §4.8).
    pub fn track_service_status(&self, service: &str, mapped_status: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        inner
            .service_status
            .insert(service.to_owned(), mapped_status.to_owned());

        let steps_for_service: Vec<&'static str> = inner
            .step_services
            .iter()
            .filter(|(_, services)| services.iter().any(|s| s == service))
            .map(|(step, _)| *step)
            .collect();

        for step_name in steps_for_service {
            let members = inner.step_services[step_name].clone();
            let statuses: Vec<String> = members
                .iter()
                .map(|m| {
                    inner
                        .service_status
                        .get(m)
                        .cloned()
                        .unwrap_or_else(|| "pending".to_owned())
                })
                .collect();

            let step = inner.state.steps.get_mut(step_name).expect("known wizard step");

            if statuses.iter().any(|s| s == "error") {
                step.status = StepStatus::Error;
                step.error = Some(format!("{service} failed"));
                step.updated_at = now;
            } else if statuses.iter().all(|s| s == "installed") {
                step.status = StepStatus::Complete;
                step.completed_at = Some(now);
                step.updated_at = now;
            } else if statuses.iter().any(|s| s == "installing") {
                step.status = StepStatus::InProgress;
                step.updated_at = now;
            }
        }

        self.publish(&mut inner);
    }

    /// Replaces the `raven` step's `detail` without disturbing the
    /// aggregation derived from service statuses.
    pub fn record_raven_detail(&self, detail: String, status_override: Option<StepStatus>) {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        if let Some(step) = inner.state.steps.get_mut("raven") {
            step.detail = Some(detail);
            if let Some(status) = status_override {
                step.status = status;
            }
            step.updated_at = now;
        }

        self.publish(&mut inner);
    }

    /// Consolidates and posts a final update at the end of a batch.
    pub fn complete_install(&self, has_errors: bool) {
        let mut inner = self.inner.lock();

        if has_errors {
            for step in inner.state.steps.values_mut() {
                if step.status != StepStatus::Complete && step.status != StepStatus::Error {
                    step.status = StepStatus::Skipped;
                }
            }
        }

        self.publish(&mut inner);
    }

    fn publish(&self, inner: &mut Inner) {
        inner.state.version += 1;
        let _ = self.tx.send(inner.state.clone());
    }
}

fn spawn_publisher_task(config: &WardenConfig, mut rx: watch::Receiver<WizardState>) {
    // The external state store is the secrets-gateway/vault (`spec.md` §6:
    // "vault base URL and token for WizardPublisher"); fall back to the
    // generic host-service URL/token if no vault endpoint is configured.
    let base_url = config
        .vault_base_url
        .clone()
        .unwrap_or_else(|| config.host_service_url.clone());
    let token = config.vault_token.clone().or_else(|| config.publisher_token.clone());
    let timeout = Duration::from_secs(config.publisher_timeout_secs);
    let retries = config.publisher_retries;

    tokio::spawn(async move {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = &token {
            if let Ok(value) = format!("Bearer {token}").parse() {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        let client = match reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("failed to build wizard publisher client: {e}");
                return;
            }
        };

        let url = format!("{}/api/remote/wizard", base_url.trim_end_matches('/'));

        loop {
            if rx.changed().await.is_err() {
                return;
            }

            let snapshot = rx.borrow_and_update().clone();
            publish_with_retry(&client, &url, &snapshot, retries).await;
        }
    });
}

async fn publish_with_retry(client: &reqwest::Client, url: &str, state: &WizardState, retries: u32) {
    let mut attempt = 0;

    loop {
        attempt += 1;
        match client.patch(url).json(state).send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                tracing::warn!("wizard publish to {url} returned {}", response.status());
            }
            Err(e) => {
                tracing::warn!("wizard publish to {url} failed: {e}");
            }
        }

        if attempt >= retries {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn test_catalog() -> Catalog {
        Catalog::from_parts(vec![], vec![], StdHashMap::new())
    }

    fn test_config() -> WardenConfig {
        WardenConfig {
            debug: crate::config::DebugLevel::Off,
            host_service_url: "http://localhost".to_owned(),
            service_name: "warden".to_owned(),
            host_docker_sockets: vec![],
            docker_host: None,
            vault_base_url: None,
            vault_token: None,
            publisher_token: None,
            history_capacity: 500,
            api_host: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            api_port: 8080,
            health_timeout_secs: 10,
            publisher_timeout_secs: 1,
            publisher_retries: 1,
        }
    }

    #[tokio::test]
    async fn step_becomes_complete_when_all_members_installed() {
        let mut step_services = StdHashMap::new();
        step_services.insert("foundation", vec!["noona-mongo".to_owned()]);
        let catalog = Catalog::from_parts(vec![], vec![], step_services);

        let publisher = WizardPublisher::new(&test_config(), &catalog);
        publisher.track_service_status("noona-mongo", "installed");

        let state = publisher.inner.lock().state.steps.get("foundation").unwrap().status;
        assert_eq!(state, StepStatus::Complete);
    }

    #[tokio::test]
    async fn step_becomes_error_when_any_member_errors() {
        let mut step_services = StdHashMap::new();
        step_services.insert("portal", vec!["noona-portal".to_owned()]);
        let catalog = Catalog::from_parts(vec![], vec![], step_services);

        let publisher = WizardPublisher::new(&test_config(), &catalog);
        publisher.track_service_status("noona-portal", "error");

        let state = publisher.inner.lock().state.steps.get("portal").unwrap().status;
        assert_eq!(state, StepStatus::Error);
    }

    #[tokio::test]
    async fn reset_marks_every_step_pending() {
        let publisher = WizardPublisher::new(&test_config(), &test_catalog());
        publisher.reset(&["noona-mongo".to_owned()]);

        let inner = publisher.inner.lock();
        assert!(inner
            .state
            .steps
            .values()
            .all(|s| s.status == StepStatus::Pending));
    }
}
