//! NDJSON-streaming HTTP surface (`spec.md` §4.9, §6). Grounded on the
//! teacher's `webserver.rs` route composition (`poem::Route`, `#[handler]`
//! functions, `EndpointExt::with` middleware), generalized from the
//! teacher's single `/api/system` + websocket endpoints to Warden's
//! catalog/install/history/test surface.

mod tracing_mw;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::web::{Data, Json, Path, Query};
use poem::{get, handler, post, Body, EndpointExt, IntoResponse, Response, Route, Server};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, RAVEN_SERVICE};
use crate::docker::DockerGateway;
use crate::engine::{BatchResult, InstallationEngine};
use crate::history::{HistoryEntry, HistoryStore, INSTALLATION_SERVICE};
use crate::mount::MountDetector;
use crate::planner::InstallRequestEntry;
use crate::wizard::WizardPublisher;

pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub docker: Arc<DockerGateway>,
    pub history: Arc<HistoryStore>,
    pub engine: Arc<InstallationEngine>,
    pub wizard: Arc<WizardPublisher>,
    pub host_service_base: String,
}

/// `ServiceView` (`spec.md` §6 `GET /services`).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvConfigView {
    key: String,
    label: String,
    default_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    required: bool,
    read_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceView {
    name: String,
    category: crate::catalog::ServiceCategory,
    image: String,
    port: Option<u16>,
    host_service_url: Option<String>,
    description: Option<String>,
    health: Option<String>,
    env_config: Vec<EnvConfigView>,
    required: bool,
    installed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicesQuery {
    #[serde(default = "default_true")]
    include_installed: bool,
}

fn default_true() -> bool {
    true
}

fn resolve_host_service_url(
    descriptor: &crate::catalog::ServiceDescriptor,
    base: &str,
) -> Option<String> {
    descriptor
        .host_service_url_override
        .clone()
        .or_else(|| descriptor.port.map(|port| format!("{base}:{port}")))
}

#[handler]
async fn list_services(
    Query(query): Query<ServicesQuery>,
    state: Data<&Arc<AppState>>,
) -> impl IntoResponse {
    let required = state.catalog.required();
    let mut any_error = false;
    let mut views = Vec::new();

    for descriptor in state.catalog.list() {
        let installed = match state.docker.container_exists(&descriptor.name).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!("failed to check {}: {e}", descriptor.name);
                any_error = true;
                false
            }
        };

        if !query.include_installed && installed {
            continue;
        }

        views.push(ServiceView {
            name: descriptor.name.clone(),
            category: descriptor.category,
            image: descriptor.image.clone(),
            port: descriptor.port,
            host_service_url: resolve_host_service_url(descriptor, &state.host_service_base),
            description: descriptor.env_config.first().and_then(|c| c.description.clone()),
            health: descriptor.health_url.clone(),
            env_config: descriptor
                .env_config
                .iter()
                .map(|c| EnvConfigView {
                    key: c.key.clone(),
                    label: c.label.clone(),
                    default_value: c.default_value.clone(),
                    description: c.description.clone(),
                    warning: c.warning.clone(),
                    required: c.required,
                    read_only: c.read_only,
                })
                .collect(),
            required: descriptor.is_required(required),
            installed,
        });
    }

    let status = if any_error { StatusCode::from_u16(207).unwrap() } else { StatusCode::OK };
    Response::builder()
        .status(status)
        .header(poem::http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&serde_json::json!({ "services": views })).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct InstallBody {
    #[serde(default)]
    services: Vec<InstallRequestEntry>,
}

/// Encodes a value as one NDJSON line (`spec.md` §4.9: "a single JSON
/// object followed by `\n`").
fn ndjson_line<T: Serialize>(value: &T) -> Bytes {
    let mut buf = serde_json::to_vec(value).unwrap_or_default();
    buf.push(b'\n');
    Bytes::from(buf)
}

fn batch_final_line(result: &BatchResult) -> Bytes {
    ndjson_line(&serde_json::json!({
        "type": "status",
        "status": result.status,
        "results": result.results,
        "invalid": result.invalid,
    }))
}

fn single_final_line(name: &str, result: &BatchResult) -> Bytes {
    let matched = result.results.iter().find(|r| r.name == name);
    ndjson_line(&serde_json::json!({
        "type": "status",
        "status": matched.map(|r| r.status.clone()).unwrap_or_else(|| result.status.clone()),
        "service": name,
        "result": matched,
    }))
}

/// Drives an install batch in the background while streaming every
/// mirrored `HistoryEntry` as NDJSON to the client, terminated by a
/// synthetic final status line built from the batch's own result
/// (`spec.md` §4.9, §6).
fn stream_install<F>(
    history: Arc<HistoryStore>,
    run: F,
    final_line: impl FnOnce(&BatchResult) -> Bytes + Send + 'static,
) -> Response
where
    F: std::future::Future<Output = Result<BatchResult, crate::engine::EngineError>> + Send + 'static,
{
    let mut rx = history.subscribe();
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let result = run.await;
        let _ = done_tx.send(result);
    });

    let body_stream = async_stream::stream! {
        loop {
            tokio::select! {
                biased;
                entry = rx.recv() => {
                    match entry {
                        Ok(entry) => yield Ok::<Bytes, io::Error>(ndjson_line(&entry)),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                result = &mut done_rx => {
                    match result {
                        Ok(Ok(batch)) => yield Ok(final_line(&batch)),
                        Ok(Err(e)) => {
                            yield Ok(ndjson_line(&serde_json::json!({
                                "type": "status",
                                "status": "error",
                                "error": e.to_string(),
                            })));
                        }
                        Err(_) => {}
                    }
                    break;
                }
            }
        }
    };

    Response::builder()
        .header(poem::http::header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_bytes_stream(body_stream))
}

/// A plain, non-streamed conflict response: `spec.md` §5/§9 rejects a
/// second concurrent batch rather than queuing it, and does so before any
/// NDJSON bytes are committed to the wire.
fn conflict_response() -> Response {
    Response::builder()
        .status(StatusCode::CONFLICT)
        .header(poem::http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&serde_json::json!({
            "error": "another installation batch is already running",
        })).unwrap_or_default())
}

#[handler]
async fn install_batch(Json(body): Json<InstallBody>, state: Data<&Arc<AppState>>) -> impl IntoResponse {
    let guard = match state.engine.try_acquire() {
        Ok(guard) => guard,
        Err(_) => return conflict_response(),
    };

    let engine = Arc::clone(&state.engine);
    let history = Arc::clone(&state.history);
    let entries = body.services;

    stream_install(
        history,
        async move { engine.install_locked(&entries, guard).await },
        |batch| batch_final_line(batch),
    )
}

#[derive(Debug, Deserialize, Default)]
struct InstallOneBody {
    #[serde(default)]
    env: HashMap<String, String>,
}

#[handler]
async fn install_one(
    Path(name): Path<String>,
    body: Option<Json<InstallOneBody>>,
    state: Data<&Arc<AppState>>,
) -> impl IntoResponse {
    let guard = match state.engine.try_acquire() {
        Ok(guard) => guard,
        Err(_) => return conflict_response(),
    };

    let engine = Arc::clone(&state.engine);
    let history = Arc::clone(&state.history);
    let env = body.map(|Json(b)| b.env).unwrap_or_default();
    let service_name = name.clone();

    stream_install(
        history,
        async move { engine.install_one_locked(&name, env, guard).await },
        move |batch| single_final_line(&service_name, batch),
    )
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse<'a> {
    service: &'a str,
    entries: Vec<HistoryEntry>,
    summary: crate::history::ServiceSummary,
}

#[handler]
async fn service_history(
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
    state: Data<&Arc<AppState>>,
) -> impl IntoResponse {
    let view = state.history.get_history(&name, query.limit);
    Json(HistoryResponse {
        service: &name,
        entries: view.entries,
        summary: view.summary,
    })
}

#[handler]
async fn installation_history(
    Query(query): Query<HistoryQuery>,
    state: Data<&Arc<AppState>>,
) -> impl IntoResponse {
    let view = state.history.get_history(INSTALLATION_SERVICE, query.limit);
    Json(HistoryResponse {
        service: INSTALLATION_SERVICE,
        entries: view.entries,
        summary: view.summary,
    })
}

#[derive(Debug, Deserialize, Default)]
struct TestBody {
    url: Option<String>,
    path: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    body: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TestResponse {
    service: String,
    success: bool,
    supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `POST /services/{name}/test` (`spec.md` §6): an explicit, caller-shaped
/// HTTP probe, distinct from `HealthProber`'s candidate-fallback GET.
#[handler]
async fn test_service(
    Path(name): Path<String>,
    body: Option<Json<TestBody>>,
    state: Data<&Arc<AppState>>,
) -> impl IntoResponse {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let Some(descriptor) = state.catalog.get(&name) else {
        return Json(TestResponse {
            service: name,
            success: false,
            supported: false,
            status: None,
            duration_ms: None,
            body: None,
            error: Some("Service is not registered".to_owned()),
        });
    };

    let url = body
        .url
        .clone()
        .or_else(|| {
            body.path.as_ref().map(|p| {
                let base = state.host_service_base.trim_end_matches('/');
                let path = p.trim_start_matches('/');
                format!("{base}/{path}")
            })
        })
        .or_else(|| descriptor.health_url.clone());

    let Some(url) = url else {
        return Json(TestResponse {
            service: name,
            success: false,
            supported: false,
            status: None,
            duration_ms: None,
            body: None,
            error: None,
        });
    };

    let method = body
        .method
        .as_deref()
        .unwrap_or("GET")
        .parse::<poem::http::Method>()
        .unwrap_or(poem::http::Method::GET);

    let client = reqwest::Client::new();
    let mut request = client.request(
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET),
        &url,
    );
    for (k, v) in &body.headers {
        request = request.header(k, v);
    }
    if let Some(payload) = &body.body {
        request = request.body(payload.clone());
    }

    let started = Instant::now();
    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let success = response.status().is_success();
            let text = response.text().await.unwrap_or_default();
            Json(TestResponse {
                service: name,
                success,
                supported: true,
                status: Some(status),
                duration_ms: Some(started.elapsed().as_millis()),
                body: Some(text),
                error: None,
            })
        }
        Err(e) => Json(TestResponse {
            service: name,
            success: false,
            supported: true,
            status: None,
            duration_ms: Some(started.elapsed().as_millis()),
            body: None,
            error: Some(e.to_string()),
        }),
    }
}

#[derive(Debug, Serialize)]
struct DetectionView {
    mount_path: String,
    socket_path: String,
    container_id: String,
    container_name: String,
}

#[derive(Debug, Serialize)]
struct DetectResponse {
    detection: Option<DetectionView>,
}

/// `POST /services/noona-raven/detect` (`spec.md` §6). Runs `MountDetector`
/// ad hoc, outside an install batch, and mirrors the result into the
/// `raven` wizard step the same way `InstallationEngine` would during an
/// install (`spec.md` §4.8 `recordRavenDetail`).
#[handler]
async fn detect_raven_mount(state: Data<&Arc<AppState>>) -> impl IntoResponse {
    let detection = MountDetector::detect(&state.docker, "kavita").await;

    let payload = serde_json::json!({
        "detection": detection.as_ref().map(|d| serde_json::json!({
            "mountPath": d.mount_path,
            "socketPath": d.socket_path,
            "containerId": d.container_id,
            "containerName": d.container_name,
        })),
    });

    state.wizard.record_raven_detail(payload.to_string(), None);

    Json(DetectResponse {
        detection: detection.map(|d| DetectionView {
            mount_path: d.mount_path,
            socket_path: d.socket_path,
            container_id: d.container_id,
            container_name: d.container_name,
        }),
    })
}

fn routes() -> Route {
    Route::new()
        .at("/services", get(list_services))
        .at("/install", post(install_batch))
        .at("/services/:name/install", post(install_one))
        .at("/services/:name/history", get(service_history))
        .at("/installation/logs", get(installation_history))
        .at("/services/:name/test", post(test_service))
        .at(
            format!("/services/{RAVEN_SERVICE}/detect"),
            post(detect_raven_mount),
        )
}

/// Binds and serves the HTTP surface until the process is asked to shut
/// down. Matches the teacher's `webserver::serve` shape: build a `Route`,
/// attach middleware, hand it to `poem::Server`.
pub async fn serve(
    host: std::net::IpAddr,
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let app = routes()
        .with(Cors::new())
        .with(tracing_mw::RequestTracing)
        .data(state);

    Server::new(TcpListener::bind((host, port)))
        .run_with_graceful_shutdown(app, shutdown, Some(Duration::from_secs(10)))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_line_ends_with_newline() {
        let line = ndjson_line(&serde_json::json!({"a": 1}));
        assert!(line.ends_with(b"\n"));
    }

    #[test]
    fn conflict_response_carries_409_with_no_stream_body() {
        let response = conflict_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
