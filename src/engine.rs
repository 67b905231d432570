//! Installation control loop: detect mount, merge env, ensure network,
//! pull and run the image, health-check, mark ready; best-effort across a
//! whole batch so one failing service doesn't abort the rest. Only one
//! batch runs at a time — a second request while one is in flight is
//! rejected, not queued (see `DESIGN.md`).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::catalog::{Catalog, RAVEN_SERVICE};
use crate::docker::{DockerError, DockerGateway, LogLine, PullProgress, RunSpec};
use crate::health::HealthProber;
use crate::history::{self, AppendEntry, EntryType, HistoryStore, Level};
use crate::mount::MountDetector;
use crate::planner::{InstallRequestEntry, InstallationPlanner, InvalidEntry, PlanError, PlannedInstall};
use crate::wizard::WizardPublisher;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("another installation batch is already running")]
    Conflict,
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstallResult {
    pub name: String,
    pub status: String,
    pub error: Option<String>,
    pub host_service_url: Option<String>,
    pub image: Option<String>,
    pub port: Option<u16>,
    pub required: bool,
    pub detected_mount: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchResult {
    pub results: Vec<InstallResult>,
    pub invalid: Vec<InvalidEntry>,
    pub status: String,
}

/// Merges per-install env overrides over a descriptor's template,
/// preserving first-appearance order; idempotent by construction.
pub fn merge_env(
    template: &[(String, String)],
    overrides: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut used = std::collections::HashSet::new();
    let mut merged: Vec<(String, String)> = template
        .iter()
        .map(|(k, v)| {
            used.insert(k.clone());
            match overrides.get(k) {
                Some(o) => (k.clone(), o.clone()),
                None => (k.clone(), v.clone()),
            }
        })
        .collect();

    let mut extra: Vec<&String> = overrides.keys().filter(|k| !used.contains(*k)).collect();
    extra.sort();

    for key in extra {
        merged.push((key.clone(), overrides[key].clone()));
    }

    merged
}

fn set_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    match env.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_owned(),
        None => env.push((key.to_owned(), value.to_owned())),
    }
}

fn resolve_host_service_url(
    descriptor: &crate::catalog::ServiceDescriptor,
    base: &str,
) -> Option<String> {
    if let Some(over) = &descriptor.host_service_url_override {
        return Some(over.clone());
    }
    descriptor.port.map(|port| format!("{base}:{port}"))
}

pub struct InstallationEngine {
    catalog: Arc<Catalog>,
    docker: Arc<DockerGateway>,
    history: Arc<HistoryStore>,
    wizard: Arc<WizardPublisher>,
    health: Arc<HealthProber>,
    network_name: String,
    host_service_base: String,
    batch_lock: Arc<Mutex<()>>,
    /// Names of containers this process has started or found running, used
    /// at shutdown to stop exactly what Warden is responsible for.
    tracked: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl InstallationEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        docker: Arc<DockerGateway>,
        history: Arc<HistoryStore>,
        wizard: Arc<WizardPublisher>,
        health: Arc<HealthProber>,
        network_name: String,
        host_service_base: String,
    ) -> Self {
        Self {
            catalog,
            docker,
            history,
            wizard,
            health,
            network_name,
            host_service_base,
            batch_lock: Arc::new(Mutex::new(())),
            tracked: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Snapshot of every service name tracked as installed since startup.
    pub fn tracked_services(&self) -> Vec<String> {
        self.tracked.lock().expect("tracked lock poisoned").iter().cloned().collect()
    }

    fn record(&self, service: &str, entry: AppendEntry) {
        record_history(&self.history, &self.wizard, service, entry);
    }

    /// Claims batch exclusivity without running anything. Callers that need
    /// to report `EngineError::Conflict` as an HTTP 409 *before* committing
    /// to a streamed response (`spec.md` §5, "reject, not queue") call this
    /// first; the returned guard must be held until the batch finishes.
    pub fn try_acquire(&self) -> Result<OwnedMutexGuard<()>, EngineError> {
        Arc::clone(&self.batch_lock)
            .try_lock_owned()
            .map_err(|_| EngineError::Conflict)
    }

    /// Runs a whole batch: seeds required services, then installs the
    /// planned order strictly in sequence.
    pub async fn install(&self, entries: &[InstallRequestEntry]) -> Result<BatchResult, EngineError> {
        let guard = self.try_acquire()?;
        self.install_locked(entries, guard).await
    }

    /// Identical to `install`, but the caller already holds a guard from
    /// `try_acquire` (the HTTP layer uses this to decide the response status
    /// before any NDJSON bytes are written).
    pub async fn install_locked(
        &self,
        entries: &[InstallRequestEntry],
        guard: OwnedMutexGuard<()>,
    ) -> Result<BatchResult, EngineError> {
        let plan = InstallationPlanner::plan(&self.catalog, entries)?;
        let result = self.run_plan(&plan).await;
        drop(guard);
        Ok(result)
    }

    /// Identical to `install`, but the returned batch corresponds to a
    /// single requested name; required services are still installed first.
    pub async fn install_one(&self, name: &str, env: HashMap<String, String>) -> Result<BatchResult, EngineError> {
        let guard = self.try_acquire()?;
        self.install_one_locked(name, env, guard).await
    }

    /// Identical to `install_one`, but the caller already holds a guard from
    /// `try_acquire`.
    pub async fn install_one_locked(
        &self,
        name: &str,
        env: HashMap<String, String>,
        guard: OwnedMutexGuard<()>,
    ) -> Result<BatchResult, EngineError> {
        let entry = if env.is_empty() {
            InstallRequestEntry::Bare(serde_json::Value::String(name.to_owned()))
        } else {
            InstallRequestEntry::WithEnv {
                name: serde_json::Value::String(name.to_owned()),
                env: env.into_iter().map(|(k, v)| (k, serde_json::Value::String(v))).collect(),
            }
        };

        self.install_locked(&[entry], guard).await
    }

    async fn run_plan(&self, plan: &PlannedInstall) -> BatchResult {
        self.history.reset_aggregate(&plan.order);
        self.wizard.reset(&plan.order);

        let required: Vec<String> = self.catalog.required().to_vec();
        let mut results = Vec::with_capacity(plan.order.len());

        for name in &plan.order {
            let overrides = plan.overrides.get(name).cloned().unwrap_or_default();
            let result = self.install_single(name, &overrides, &required).await;
            results.push(result);
        }

        let has_errors = results.iter().any(|r| r.status == "error");
        self.wizard.complete_install(has_errors);

        BatchResult {
            results,
            invalid: plan.invalid.clone(),
            status: if has_errors { "error".to_owned() } else { "complete".to_owned() },
        }
    }

    async fn install_single(
        &self,
        name: &str,
        overrides: &HashMap<String, String>,
        required: &[String],
    ) -> InstallResult {
        let is_required = required.iter().any(|r| r == name);

        let Some(descriptor) = self.catalog.get(name) else {
            let message = format!("Service {name} is not registered");
            self.record(name, AppendEntry::error("error", message.clone()));
            return InstallResult {
                name: name.to_owned(),
                status: "error".to_owned(),
                error: Some(message),
                host_service_url: None,
                image: None,
                port: None,
                required: is_required,
                detected_mount: None,
            };
        };

        let mut env = descriptor.env_template.clone();
        let mut volumes = descriptor.volumes.clone();
        let mut detected_mount = None;

        if name == RAVEN_SERVICE {
            detected_mount = self.detect_and_rewrite_mount(name, &mut env, &mut volumes, overrides).await;
        }

        let merged_env = merge_env(&env, overrides);
        let env_strings: Vec<String> = merged_env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        if let Err(e) = self.ensure_network().await {
            return self.fail(name, is_required, format!("failed to prepare network: {e}"));
        }

        let exists = match self.docker.container_exists(name).await {
            Ok(exists) => exists,
            Err(e) => return self.fail(name, is_required, e.to_string()),
        };

        if exists {
            self.record(name, AppendEntry::status("running", "container already exists").clearing_error());
        } else {
            if let Err(e) = self.pull(name, &descriptor.image).await {
                return self.fail(name, is_required, e.to_string());
            }

            let spec = RunSpec {
                name: name.to_owned(),
                image: descriptor.image.clone(),
                env: env_strings,
                volumes,
            };

            if let Err(e) = self.run(name, &spec).await {
                return self.fail(name, is_required, e.to_string());
            }
        }

        if let Some(health_url) = &descriptor.health_url {
            self.record(name, AppendEntry::status("health-check", "checking service health"));

            let base = resolve_host_service_url(descriptor, &self.host_service_base);
            match self.health.probe(None, None, base.as_deref(), Some(health_url)).await {
                Ok(success) => {
                    self.record(name, AppendEntry::status("healthy", success.detail).clearing_error());
                }
                Err(e) => {
                    return self.fail(name, is_required, e.to_string());
                }
            }
        }

        self.record(name, AppendEntry::status("ready", "service ready").clearing_error());
        self.tracked.lock().expect("tracked lock poisoned").insert(name.to_owned());

        InstallResult {
            name: name.to_owned(),
            status: "installed".to_owned(),
            error: None,
            host_service_url: resolve_host_service_url(descriptor, &self.host_service_base),
            image: Some(descriptor.image.clone()),
            port: descriptor.port,
            required: is_required,
            detected_mount,
        }
    }

    fn fail(&self, name: &str, is_required: bool, message: String) -> InstallResult {
        self.record(name, AppendEntry::error("error", message.clone()));
        InstallResult {
            name: name.to_owned(),
            status: "error".to_owned(),
            error: Some(message),
            host_service_url: None,
            image: None,
            port: None,
            required: is_required,
            detected_mount: None,
        }
    }

    async fn detect_and_rewrite_mount(
        &self,
        name: &str,
        env: &mut Vec<(String, String)>,
        volumes: &mut Vec<String>,
        overrides: &HashMap<String, String>,
    ) -> Option<String> {
        self.record(name, AppendEntry::status("detecting", "looking for host mount"));

        if let Some(detection) = MountDetector::detect(&self.docker, "kavita").await {
            set_env(env, "APPDATA", "/kavita-data");
            set_env(env, "KAVITA_DATA_MOUNT", "/kavita-data");
            volumes.push(format!("{}:/kavita-data", detection.mount_path));
            self.record(
                name,
                AppendEntry::status("detected", "host mount found").clearing_error(),
            );
            return Some(detection.mount_path);
        }

        let host_override = overrides.get("KAVITA_DATA_MOUNT").cloned();
        let container_override = overrides
            .get("APPDATA")
            .cloned()
            .unwrap_or_else(|| "/kavita-data".to_owned());

        if let Some(host_path) = host_override {
            set_env(env, "APPDATA", &container_override);
            set_env(env, "KAVITA_DATA_MOUNT", &host_path);
            volumes.push(format!("{host_path}:{container_override}"));
            self.record(
                name,
                AppendEntry::status("detected", "using caller-supplied host mount").clearing_error(),
            );
            return Some(host_path);
        }

        self.record(name, AppendEntry::status("not-found", "no host mount detected"));
        None
    }

    async fn ensure_network(&self) -> Result<(), DockerError> {
        self.docker.ensure_network(&self.network_name).await?;
        self.docker.attach_self_to_network(&self.network_name).await
    }

    /// Stops every tracked container. Best-effort: a single failure is
    /// logged and does not stop the rest from being attempted.
    pub async fn stop_all_tracked(&self) {
        for name in self.tracked_services() {
            if let Err(e) = self.docker.stop_container(&name).await {
                tracing::warn!("failed to stop tracked container {name}: {e}");
            }
        }
    }

    async fn pull(&self, name: &str, image: &str) -> Result<(), DockerError> {
        self.record(name, AppendEntry::status("pulling", format!("pulling {image}")));

        let (tx, mut rx) = mpsc::channel::<PullProgress>(64);
        let history = Arc::clone(&self.history);
        let wizard = Arc::clone(&self.wizard);
        let service = name.to_owned();

        let drain = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                record_history(
                    &history,
                    &wizard,
                    &service,
                    AppendEntry {
                        entry_type: EntryType::Progress,
                        message: progress.status,
                        status: None,
                        detail: progress.detail,
                        stream: None,
                        level: Some(Level::Info),
                        percent: None,
                        error: None,
                        clear_error: false,
                        mirror_to_installation: true,
                        timestamp: None,
                    },
                );
            }
        });

        let result = self.docker.pull_image(image, tx).await;
        let _ = drain.await;
        result
    }

    async fn run(&self, name: &str, spec: &RunSpec) -> Result<(), DockerError> {
        self.record(name, AppendEntry::status("starting", "starting container"));

        let (tx, mut rx) = mpsc::channel::<LogLine>(256);
        let history = Arc::clone(&self.history);
        let wizard = Arc::clone(&self.wizard);
        let service = name.to_owned();

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let stream = match line.stream {
                    crate::docker::LogStream::Stdout => crate::history::StreamTag::Stdout,
                    crate::docker::LogStream::Stderr => crate::history::StreamTag::Stderr,
                };

                record_history(
                    &history,
                    &wizard,
                    &service,
                    AppendEntry {
                        entry_type: EntryType::Log,
                        message: line.line,
                        status: None,
                        detail: None,
                        stream: Some(stream),
                        level: Some(Level::Info),
                        percent: None,
                        error: None,
                        clear_error: false,
                        mirror_to_installation: false,
                        timestamp: None,
                    },
                );
            }
        });

        self.docker.run_container(spec, &self.network_name, tx).await?;
        Ok(())
    }
}

fn record_history(history: &HistoryStore, wizard: &WizardPublisher, service: &str, entry: AppendEntry) {
    let status = entry.status.clone();
    history.append(service, entry);
    if let Some(status) = status {
        wizard.track_service_status(service, history::map_status_to_installation_domain(&status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_merge_overrides_existing_keys_and_appends_new_ones() {
        let template = vec![("A".to_owned(), "1".to_owned()), ("B".to_owned(), "2".to_owned())];
        let mut overrides = HashMap::new();
        overrides.insert("B".to_owned(), "9".to_owned());
        overrides.insert("C".to_owned(), "3".to_owned());

        let merged = merge_env(&template, &overrides);
        assert_eq!(
            merged,
            vec![
                ("A".to_owned(), "1".to_owned()),
                ("B".to_owned(), "9".to_owned()),
                ("C".to_owned(), "3".to_owned()),
            ]
        );
    }

    #[test]
    fn env_merge_is_idempotent() {
        let template = vec![("A".to_owned(), "1".to_owned())];
        let mut overrides = HashMap::new();
        overrides.insert("A".to_owned(), "9".to_owned());

        let once = merge_env(&template, &overrides);
        let twice = merge_env(&once, &overrides);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_override_yields_empty_value() {
        let template = vec![("KEY".to_owned(), "default".to_owned())];
        let mut overrides = HashMap::new();
        overrides.insert("KEY".to_owned(), String::new());

        let merged = merge_env(&template, &overrides);
        assert_eq!(merged, vec![("KEY".to_owned(), String::new())]);
    }

    fn test_engine() -> InstallationEngine {
        let catalog = Arc::new(Catalog::from_parts(vec![], vec![], HashMap::new()));
        let config = crate::config::WardenConfig {
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
        };
        let docker = Arc::new(DockerGateway::new(&config).expect("docker client builds without dialing"));
        let history = Arc::new(HistoryStore::new(500));
        let wizard = Arc::new(WizardPublisher::new(&config, &catalog));
        let health = Arc::new(HealthProber::new(std::time::Duration::from_secs(1)));

        InstallationEngine::new(
            catalog,
            docker,
            history,
            wizard,
            health,
            "warden-net".to_owned(),
            "http://localhost".to_owned(),
        )
    }

    #[test]
    fn try_acquire_rejects_a_second_concurrent_batch() {
        let engine = test_engine();

        let first = engine.try_acquire().expect("first acquire succeeds");
        let second = engine.try_acquire();
        assert!(matches!(second, Err(EngineError::Conflict)));

        drop(first);
        assert!(engine.try_acquire().is_ok());
    }
}
