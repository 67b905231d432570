//! Per-service event history and the derived installation aggregate.
//! All mutation funnels through a single mutex-guarded writer; state lives
//! in an in-memory ring with no on-disk persistence.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

/// The name of the synthetic global timeline every other service's
/// history is mirrored into.
pub const INSTALLATION_SERVICE: &str = "installation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
    Log,
    Status,
    Progress,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// A stored ring entry.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub message: String,
    pub status: Option<String>,
    pub detail: Option<String>,
    pub stream: Option<StreamTag>,
    pub level: Option<Level>,
    pub percent: Option<u8>,
    pub error: Option<String>,
}

/// The call-time shape `append` accepts: a `HistoryEntry` plus the two
/// control flags that only matter for this one call.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub entry_type: EntryType,
    pub message: String,
    pub status: Option<String>,
    pub detail: Option<String>,
    pub stream: Option<StreamTag>,
    pub level: Option<Level>,
    pub percent: Option<u8>,
    pub error: Option<String>,
    pub clear_error: bool,
    pub mirror_to_installation: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AppendEntry {
    pub fn status(service_status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entry_type: EntryType::Status,
            message: message.into(),
            status: Some(service_status.into()),
            detail: None,
            stream: None,
            level: Some(Level::Info),
            percent: None,
            error: None,
            clear_error: false,
            mirror_to_installation: true,
            timestamp: None,
        }
    }

    pub fn error(service_status: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            entry_type: EntryType::Error,
            error: Some(message.clone()),
            message,
            status: Some(service_status.into()),
            detail: None,
            stream: None,
            level: Some(Level::Error),
            percent: None,
            clear_error: false,
            mirror_to_installation: true,
            timestamp: None,
        }
    }

    pub fn clearing_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub status: String,
    pub percent: Option<u8>,
    pub detail: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ServiceSummary {
    fn default() -> Self {
        Self {
            status: "idle".to_owned(),
            percent: None,
            detail: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    pub entries: Vec<HistoryEntry>,
    pub summary: ServiceSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateItem {
    pub name: String,
    pub label: String,
    pub status: String,
    pub detail: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallationAggregate {
    pub items: Vec<AggregateItem>,
    pub percent: u8,
    pub status: String,
}

/// Maps a raw service status string into the three-way installation
/// domain. Unrecognized statuses are treated as non-terminal
/// (`installing`).
pub(crate) fn map_status_to_installation_domain(status: &str) -> &'static str {
    match status {
        "installed" | "ready" | "healthy" | "running" | "complete" | "detected" | "configured" => {
            "installed"
        }
        "error" | "failed" | "failure" => "error",
        _ => "installing",
    }
}

struct ServiceState {
    ring: VecDeque<HistoryEntry>,
    summary: ServiceSummary,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            ring: VecDeque::new(),
            summary: ServiceSummary::default(),
        }
    }
}

/// Single writer for every service's event ring and the installation
/// aggregate; every mutation funnels through this type.
pub struct HistoryStore {
    capacity: usize,
    services: Mutex<HashMap<String, ServiceState>>,
    aggregate: Mutex<Vec<AggregateItem>>,
    installation_stream: broadcast::Sender<HistoryEntry>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            capacity,
            services: Mutex::new(HashMap::new()),
            aggregate: Mutex::new(Vec::new()),
            installation_stream: tx,
        }
    }

    /// Subscribes to the mirrored installation timeline, for the NDJSON
    /// stream handler.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEntry> {
        self.installation_stream.subscribe()
    }

    /// Clears the aggregate to `pending` for exactly `names`, in order.
    /// Called once per installation batch.
    pub fn reset_aggregate(&self, names: &[String]) {
        let now = Utc::now();
        let mut aggregate = self.aggregate.lock();
        *aggregate = names
            .iter()
            .map(|name| AggregateItem {
                name: name.clone(),
                label: name.clone(),
                status: "pending".to_owned(),
                detail: None,
                updated_at: Some(now),
            })
            .collect();
    }

    pub fn append(&self, service: &str, input: AppendEntry) {
        let normalized = self.record(service, &input);

        let already_global_no_mirror =
            service == INSTALLATION_SERVICE && !input.mirror_to_installation;

        if already_global_no_mirror {
            // Entry already landed in the installation ring via `record`
            // above; still publish it so NDJSON stream subscribers see it.
            let _ = self.installation_stream.send(normalized.clone());
        } else {
            let mirrored = AppendEntry {
                entry_type: normalized.entry_type,
                message: format!("[{service}] {}", normalized.message),
                status: normalized.status.clone(),
                detail: normalized.detail.clone(),
                stream: None,
                level: normalized.level,
                percent: normalized.percent,
                error: normalized.error.clone(),
                clear_error: input.clear_error,
                mirror_to_installation: false,
                timestamp: Some(normalized.timestamp),
            };
            let mirrored_entry = self.record(INSTALLATION_SERVICE, &mirrored);
            let _ = self.installation_stream.send(mirrored_entry);
        }

        if let Some(status) = &normalized.status {
            let domain_status = map_status_to_installation_domain(status);
            self.update_aggregate(service, domain_status, normalized.detail, normalized.timestamp);
        }
    }

    fn record(&self, service: &str, input: &AppendEntry) -> HistoryEntry {
        let timestamp = input.timestamp.unwrap_or_else(Utc::now);

        let entry = HistoryEntry {
            timestamp,
            entry_type: input.entry_type,
            message: input.message.clone(),
            status: input.status.clone(),
            detail: input.detail.clone(),
            stream: input.stream,
            level: input.level,
            percent: input.percent,
            error: input.error.clone(),
        };

        let mut services = self.services.lock();
        let state = services
            .entry(service.to_owned())
            .or_insert_with(ServiceState::new);

        state.ring.push_back(entry.clone());
        while state.ring.len() > self.capacity {
            state.ring.pop_front();
        }

        let summary = &mut state.summary;
        if matches!(
            input.entry_type,
            EntryType::Status | EntryType::Progress | EntryType::Error
        ) {
            if let Some(status) = &input.status {
                summary.status = status.clone();
            }
        }
        if input.entry_type == EntryType::Error {
            summary.error = input.error.clone();
        }
        if input.entry_type == EntryType::Status && input.clear_error {
            summary.error = None;
        }
        if input.detail.is_some() {
            summary.detail = input.detail.clone();
        }
        if input.percent.is_some() {
            summary.percent = input.percent;
        }
        summary.updated_at = timestamp;

        entry
    }

    fn update_aggregate(
        &self,
        name: &str,
        domain_status: &'static str,
        detail: Option<String>,
        timestamp: DateTime<Utc>,
    ) {
        let mut aggregate = self.aggregate.lock();

        if let Some(item) = aggregate.iter_mut().find(|i| i.name == name) {
            let blocked_downgrade = item.status == "installed" && domain_status == "installing";
            let error_preserved = item.status == "error" && domain_status != "error";

            if !blocked_downgrade && !error_preserved {
                item.status = domain_status.to_owned();
                item.detail = detail;
                item.updated_at = Some(timestamp);
            }
        } else {
            aggregate.push(AggregateItem {
                name: name.to_owned(),
                label: name.to_owned(),
                status: domain_status.to_owned(),
                detail,
                updated_at: Some(timestamp),
            });
        }
    }

    pub fn get_history(&self, service: &str, limit: Option<usize>) -> HistoryView {
        let services = self.services.lock();
        match services.get(service) {
            Some(state) => {
                let entries: Vec<HistoryEntry> = match limit {
                    Some(n) => state.ring.iter().rev().take(n).rev().cloned().collect(),
                    None => state.ring.iter().cloned().collect(),
                };
                HistoryView {
                    entries,
                    summary: state.summary.clone(),
                }
            }
            None => HistoryView {
                entries: Vec::new(),
                summary: ServiceSummary::default(),
            },
        }
    }

    pub fn get_installation_aggregate(&self) -> InstallationAggregate {
        let aggregate = self.aggregate.lock();
        let total = aggregate.len();
        let installed = aggregate.iter().filter(|i| i.status == "installed").count();

        let status = if aggregate.iter().any(|i| i.status == "error") {
            "error"
        } else if total > 0 && installed == total {
            "complete"
        } else if aggregate
            .iter()
            .any(|i| i.status == "pending" || i.status == "installing")
        {
            "installing"
        } else {
            "idle"
        };

        let percent = if total == 0 {
            0
        } else {
            ((installed as f64 / total as f64) * 100.0).round() as u8
        };

        InstallationAggregate {
            items: aggregate.clone(),
            percent,
            status: status.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let store = HistoryStore::new(2);
        for i in 0..5 {
            store.append(
                "noona-mongo",
                AppendEntry::status("installing", format!("step {i}")),
            );
        }

        let view = store.get_history("noona-mongo", None);
        assert_eq!(view.entries.len(), 2);
        assert_eq!(view.entries[0].message, "step 3");
        assert_eq!(view.entries[1].message, "step 4");
    }

    #[test]
    fn status_mirrors_into_installation_history() {
        let store = HistoryStore::new(10);
        store.append("noona-mongo", AppendEntry::status("pulling", "pulling image"));

        let view = store.get_history(INSTALLATION_SERVICE, None);
        assert_eq!(view.entries.len(), 1);
        assert_eq!(view.entries[0].message, "[noona-mongo] pulling image");
    }

    #[test]
    fn aggregate_never_downgrades_from_installed() {
        let store = HistoryStore::new(10);
        store.reset_aggregate(&["noona-mongo".to_owned()]);
        store.append("noona-mongo", AppendEntry::status("installed", "ready"));
        store.append("noona-mongo", AppendEntry::status("installing", "pulling"));

        let aggregate = store.get_installation_aggregate();
        let item = aggregate.items.iter().find(|i| i.name == "noona-mongo").unwrap();
        assert_eq!(item.status, "installed");
    }

    #[test]
    fn aggregate_preserves_error_unless_new_status_is_error() {
        let store = HistoryStore::new(10);
        store.reset_aggregate(&["noona-vault".to_owned()]);
        store.append("noona-vault", AppendEntry::error("error", "pull failed"));
        store.append("noona-vault", AppendEntry::status("installing", "retrying"));

        let aggregate = store.get_installation_aggregate();
        let item = aggregate.items.iter().find(|i| i.name == "noona-vault").unwrap();
        assert_eq!(item.status, "error");
    }

    #[test]
    fn aggregate_status_is_error_when_any_item_errored() {
        let store = HistoryStore::new(10);
        store.reset_aggregate(&["a".to_owned(), "b".to_owned()]);
        store.append("a", AppendEntry::status("installed", "done"));
        store.append("b", AppendEntry::error("error", "boom"));

        let aggregate = store.get_installation_aggregate();
        assert_eq!(aggregate.status, "error");
    }

    #[test]
    fn clear_error_flag_clears_summary_error() {
        let store = HistoryStore::new(10);
        store.append("noona-mongo", AppendEntry::error("error", "boom"));
        store.append(
            "noona-mongo",
            AppendEntry::status("running", "recovered").clearing_error(),
        );

        let view = store.get_history("noona-mongo", None);
        assert!(view.summary.error.is_none());
    }
}
