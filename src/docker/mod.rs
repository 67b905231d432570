//! Docker Engine gateway: multi-socket discovery, container lifecycle,
//! network management, image pulls and log draining. Progress and log
//! output are reported through typed `mpsc` channels rather than
//! callbacks.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, Network};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::service::ContainerInspectResponse;
use bollard::Docker;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::config::WardenConfig;

const WARDEN_VERSION_LABEL: &str = "warden.managed-by";

fn warden_labels() -> HashMap<String, String> {
    HashMap::from([(
        WARDEN_VERSION_LABEL.to_owned(),
        env!("CARGO_PKG_VERSION").to_owned(),
    )])
}

/// The `kind` discriminant carried on every `DockerError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerErrorKind {
    Connect,
    NotFound,
    Conflict,
    Transport,
    Other,
}

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to connect to docker endpoint {socket}: {source}")]
    Connect {
        socket: String,
        #[source]
        source: BollardError,
    },
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(#[source] BollardError),
    #[error("{0}")]
    Other(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl DockerError {
    pub fn kind(&self) -> DockerErrorKind {
        match self {
            DockerError::Connect { .. } => DockerErrorKind::Connect,
            DockerError::NotFound => DockerErrorKind::NotFound,
            DockerError::Conflict(_) => DockerErrorKind::Conflict,
            DockerError::Transport(_) => DockerErrorKind::Transport,
            DockerError::Other(_) | DockerError::Io(_) => DockerErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DockerError>;

fn classify(err: BollardError) -> DockerError {
    use bollard::errors::Error::DockerResponseServerError;
    match err {
        DockerResponseServerError {
            status_code: 404, ..
        } => DockerError::NotFound,
        DockerResponseServerError {
            status_code: 409,
            ref message,
        } => DockerError::Conflict(message.clone()),
        other => DockerError::Transport(other),
    }
}

fn is_404(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_409(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

/// Strips bad control characters from a raw log chunk, preserving
/// whitespace.
fn sanitize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .as_ref()
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER && (!c.is_control() || c.is_whitespace()))
        .collect()
}

const WELL_KNOWN_SOCKETS: &[&str] = &[
    "/var/run/docker.sock",
    "/run/docker.sock",
    "/var/run/podman/podman.sock",
    "/run/podman/podman.sock",
];

/// Produces a deduplicated, ordered list of candidate Docker socket paths.
/// The directory scan is POSIX-only; on other platforms discovery stops at
/// well-known paths and configured/`DOCKER_HOST` values (see `DESIGN.md`).
pub fn discover_sockets(config: &WardenConfig) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    let mut push = |raw: &str| {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("tcp://") {
            return;
        }
        let normalized = raw.strip_prefix("unix://").unwrap_or(raw);
        if seen.insert(normalized.to_owned()) {
            out.push(normalized.to_owned());
        }
    };

    for socket in &config.host_docker_sockets {
        push(socket);
    }

    if let Some(host) = &config.docker_host {
        if let Some(path) = host.strip_prefix("unix://") {
            push(path);
        }
    }

    for socket in WELL_KNOWN_SOCKETS {
        push(socket);
    }

    #[cfg(unix)]
    scan_socket_directories(&mut push);

    out
}

#[cfg(unix)]
fn scan_socket_directories(push: &mut impl FnMut(&str)) {
    let parents = ["/var/run", "/run"];
    let subdirs = ["docker", "podman"];

    for parent in parents {
        scan_dir_for_sockets(Path::new(parent), push);
        for sub in subdirs {
            scan_dir_for_sockets(&Path::new(parent).join(sub), push);
        }
    }
}

#[cfg(unix)]
fn scan_dir_for_sockets(dir: &Path, push: &mut impl FnMut(&str)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().to_ascii_lowercase();
        if name.contains("sock") && (name.contains("docker") || name.contains("podman")) {
            if let Some(path) = entry.path().to_str() {
                push(path);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullProgress {
    pub status: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub line: String,
    pub stream: LogStream,
}

/// The inputs `run_container` needs beyond the service name; assembled by
/// `InstallationEngine` from a service descriptor.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MountInfo {
    pub destination: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct ContainerInspection {
    pub id: String,
    pub image: Option<String>,
    pub names: Vec<String>,
    pub mounts: Vec<MountInfo>,
}

/// Gateway to one or more Docker-compatible endpoints. The primary client
/// is the daemon's own endpoint; additional sockets discovered at startup
/// are dialed lazily and cached behind a mutex.
pub struct DockerGateway {
    primary: Docker,
    discovered: Vec<String>,
    clients: Mutex<HashMap<String, Docker>>,
}

impl DockerGateway {
    pub fn new(config: &WardenConfig) -> Result<Self> {
        let primary = connect(config.docker_host.as_deref())?;
        let discovered = discover_sockets(config);

        Ok(Self {
            primary,
            discovered,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Returns `(client, label)` pairs: the primary client first, then one
    /// per discovered socket that connects successfully. Connection errors
    /// are logged and the socket is skipped.
    pub async fn endpoints(&self) -> Vec<(Docker, String)> {
        let mut out = vec![(self.primary.clone(), "primary".to_owned())];

        for socket in &self.discovered {
            match self.client_for(socket).await {
                Ok(client) => out.push((client, socket.clone())),
                Err(e) => tracing::warn!("skipping docker socket {socket}: {e}"),
            }
        }

        out
    }

    async fn client_for(&self, socket: &str) -> Result<Docker> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(socket) {
            return Ok(client.clone());
        }

        let client = connect_socket(socket)?;
        clients.insert(socket.to_owned(), client.clone());
        Ok(client)
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        let opts = InspectContainerOptions { size: false };
        match self.primary.inspect_container(name, Some(opts)).await {
            Ok(_) => Ok(true),
            Err(e) if is_404(&e) => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        let existing = self
            .primary
            .list_networks(Some(ListNetworksOptions {
                filters: HashMap::from([("name".to_owned(), vec![name.to_owned()])]),
            }))
            .await
            .map_err(classify)?;

        if existing.iter().any(|n: &Network| n.name.as_deref() == Some(name)) {
            return Ok(());
        }

        let opts = CreateNetworkOptions {
            name,
            driver: "bridge",
            ..Default::default()
        };

        match self.primary.create_network(opts).await {
            Ok(_) => Ok(()),
            Err(e) if is_409(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    /// Attaches the current process's own container to `name`, so sibling
    /// service containers can reach it by network alias. Best-effort:
    /// already-attached is treated as success.
    pub async fn attach_self_to_network(&self, name: &str) -> Result<()> {
        let Some(self_id) = self_container_id() else {
            tracing::debug!("not running inside a container; skipping self-attach to {name}");
            return Ok(());
        };

        let opts = ConnectNetworkOptions {
            container: self_id,
            ..Default::default()
        };

        match self.primary.connect_network(name, opts).await {
            Ok(()) => Ok(()),
            Err(e) if is_409(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    /// Pulls `image`, forwarding each registry progress event on `tx`.
    /// Resolves once the registry stream ends. No retry at this layer.
    pub async fn pull_image(&self, image: &str, tx: mpsc::Sender<PullProgress>) -> Result<()> {
        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.primary.create_image(Some(opts), None, None);

        while let Some(result) = stream.next().await {
            let info = result.map_err(classify)?;
            let progress = PullProgress {
                status: info.status.unwrap_or_default(),
                detail: info.progress,
            };
            let _ = tx.send(progress).await;
        }

        Ok(())
    }

    /// Creates and starts `spec` on `network`, spawning a background task
    /// that demultiplexes stdout/stderr line-by-line onto `tx`
    /// (CR/NUL-stripped, empty lines dropped). Returns once the container
    /// has started; log draining continues in the background.
    pub async fn run_container(
        &self,
        spec: &RunSpec,
        network: &str,
        tx: mpsc::Sender<LogLine>,
    ) -> Result<String> {
        let mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .filter_map(|v| parse_volume(v))
            .collect();

        let config = ContainerConfig {
            hostname: Some(spec.name.clone()),
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(warden_labels()),
            host_config: Some(HostConfig {
                mounts: if mounts.is_empty() { None } else { Some(mounts) },
                network_mode: Some(network.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .primary
            .create_container(Some(create_opts), config)
            .await
            .map_err(classify)?;

        for warning in &response.warnings {
            tracing::warn!("docker warning creating {}: {warning}", spec.name);
        }

        let attach_opts = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };

        let AttachContainerResults { output, .. } = self
            .primary
            .attach_container(&response.id, Some(attach_opts))
            .await
            .map_err(classify)?;

        self.primary
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)?;

        tokio::spawn(drain_logs(output, tx));

        Ok(response.id)
    }

    pub async fn stop_container(&self, name: &str) -> Result<()> {
        match self
            .primary
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_404(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn remove_container(&self, name: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.primary.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(e) if is_404(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspection> {
        let response = self
            .primary
            .inspect_container(name, None)
            .await
            .map_err(classify)?;

        Ok(to_inspection(response))
    }
}

fn to_inspection(response: ContainerInspectResponse) -> ContainerInspection {
    let mounts = response
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| Some(MountInfo {
            destination: m.destination?,
            source: m.source?,
        }))
        .collect();

    ContainerInspection {
        id: response.id.unwrap_or_default(),
        image: response.config.and_then(|c| c.image),
        names: response.name.into_iter().collect(),
        mounts,
    }
}

async fn drain_logs(
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>,
    tx: mpsc::Sender<LogLine>,
) {
    while let Some(result) = stream.next().await {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("error reading container output: {e}");
                break;
            }
        };

        let stream_tag = match &output {
            LogOutput::StdOut { .. } => LogStream::Stdout,
            LogOutput::StdErr { .. } => LogStream::Stderr,
            _ => LogStream::Stdout,
        };

        let bytes = output.into_bytes();
        let sanitized = sanitize_output(&bytes);

        for line in sanitized.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.replace('\0', "").trim().is_empty() {
                continue;
            }
            let clean = line.replace('\0', "");
            if tx
                .send(LogLine {
                    line: clean,
                    stream: stream_tag,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

fn parse_volume(raw: &str) -> Option<Mount> {
    let mut parts = raw.splitn(3, ':');
    let source = parts.next()?.to_owned();
    let target = parts.next()?.to_owned();
    let read_only = matches!(parts.next(), Some(opts) if opts.contains("ro"));

    let typ = if source.starts_with('/') || source.starts_with('.') {
        MountTypeEnum::BIND
    } else {
        MountTypeEnum::VOLUME
    };

    Some(Mount {
        source: Some(source),
        target: Some(target),
        typ: Some(typ),
        read_only: Some(read_only),
        ..Default::default()
    })
}

fn connect(docker_host: Option<&str>) -> Result<Docker> {
    match docker_host {
        Some(host) => connect_socket(host),
        None => Docker::connect_with_local_defaults().map_err(|e| DockerError::Connect {
            socket: "local-defaults".to_owned(),
            source: e,
        }),
    }
}

fn connect_socket(socket: &str) -> Result<Docker> {
    let map_err = |e| DockerError::Connect {
        socket: socket.to_owned(),
        source: e,
    };

    if let Some(path) = socket.strip_prefix("unix://") {
        return Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(map_err);
    }

    if socket.starts_with("http://") || socket.starts_with("https://") || socket.starts_with("tcp://") {
        return Docker::connect_with_http(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(map_err);
    }

    if socket.starts_with('/') || socket.starts_with('.') {
        return Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(map_err);
    }

    Docker::connect_with_local_defaults().map_err(map_err)
}

/// Best-effort own-container id, read the way `/proc/self/cgroup` exposes
/// it on Linux cgroup v1/v2 hosts. Returns `None` outside a container.
#[cfg(unix)]
fn self_container_id() -> Option<String> {
    let contents = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    contents.lines().find_map(|line| {
        let id = line.rsplit('/').next()?;
        if id.len() >= 12 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(id.to_owned())
        } else {
            None
        }
    })
}

#[cfg(not(unix))]
fn self_container_id() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(sockets: Vec<&str>, docker_host: Option<&str>) -> WardenConfig {
        WardenConfig {
            debug: crate::config::DebugLevel::Off,
            host_service_url: "http://localhost".to_owned(),
            service_name: "warden".to_owned(),
            host_docker_sockets: sockets.into_iter().map(str::to_owned).collect(),
            docker_host: docker_host.map(str::to_owned),
            vault_base_url: None,
            vault_token: None,
            publisher_token: None,
            history_capacity: 500,
            api_host: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            api_port: 8080,
            health_timeout_secs: 10,
            publisher_timeout_secs: 10,
            publisher_retries: 3,
        }
    }

    #[test]
    fn discovery_strips_unix_prefix_and_dedupes() {
        let cfg = config_with(
            vec!["unix:///custom/docker.sock", "/custom/docker.sock"],
            None,
        );
        let sockets = discover_sockets(&cfg);
        assert_eq!(sockets.iter().filter(|s| *s == "/custom/docker.sock").count(), 1);
    }

    #[test]
    fn discovery_rejects_tcp_entries() {
        let cfg = config_with(vec!["tcp://127.0.0.1:2375"], None);
        let sockets = discover_sockets(&cfg);
        assert!(!sockets.iter().any(|s| s.starts_with("tcp://")));
    }

    #[test]
    fn discovery_includes_well_known_paths() {
        let cfg = config_with(vec![], None);
        let sockets = discover_sockets(&cfg);
        assert!(sockets.contains(&"/var/run/docker.sock".to_owned()));
    }

    #[test]
    fn volume_parsing_handles_read_only_suffix() {
        let mount = parse_volume("noona_mongo_data:/data/db").unwrap();
        assert_eq!(mount.read_only, Some(false));

        let mount = parse_volume("/srv/kavita:/kavita-data:ro").unwrap();
        assert_eq!(mount.read_only, Some(true));
    }

    #[test]
    fn volume_parsing_selects_bind_for_absolute_host_path() {
        let mount = parse_volume("/srv/kavita:/kavita-data").unwrap();
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));

        let mount = parse_volume("./relative-data:/kavita-data").unwrap();
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));
    }

    #[test]
    fn volume_parsing_selects_volume_for_named_volume() {
        let mount = parse_volume("noona_mongo_data:/data/db").unwrap();
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
    }
}
