//! HTTP health probing with candidate URL fallback, built on a configured
//! `reqwest::Client` with a timeout and a typed error path.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("all health check candidates failed: {}", format_candidates(&.0))]
pub struct HealthCheckError(pub Vec<CandidateFailure>);

fn format_candidates(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.url, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct HealthSuccess {
    pub detail: String,
    pub url: String,
}

pub struct HealthProber {
    http: reqwest::Client,
}

impl HealthProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("reqwest client configuration is valid"),
        }
    }

    /// Builds the ordered candidate URL list and probes each in turn:
    /// caller-supplied test URL, caller-supplied path joined against the
    /// host-service base, base + `/health`, and the descriptor's
    /// `healthUrl`.
    pub async fn probe(
        &self,
        test_url: Option<&str>,
        test_path: Option<&str>,
        host_service_base: Option<&str>,
        health_url: Option<&str>,
    ) -> Result<HealthSuccess, HealthCheckError> {
        let mut candidates = Vec::new();

        if let Some(url) = test_url {
            candidates.push(url.to_owned());
        }
        if let (Some(path), Some(base)) = (test_path, host_service_base) {
            candidates.push(join_url(base, path));
        }
        if let Some(base) = host_service_base {
            candidates.push(join_url(base, "/health"));
        }
        if let Some(url) = health_url {
            candidates.push(url.to_owned());
        }

        let mut failures = Vec::new();

        for url in candidates {
            match self.try_candidate(&url).await {
                Ok(detail) => return Ok(HealthSuccess { detail, url }),
                Err(reason) => failures.push(CandidateFailure { url, reason }),
            }
        }

        Err(HealthCheckError(failures))
    }

    async fn try_candidate(&self, url: &str) -> Result<String, String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;

        Ok(match serde_json::from_str::<Value>(&body) {
            Ok(json) => extract_detail(&json).unwrap_or(body),
            Err(_) => body,
        })
    }
}

fn extract_detail(json: &Value) -> Option<String> {
    for key in ["status", "message", "detail"] {
        if let Some(value) = json.get(key).and_then(Value::as_str) {
            return Some(value.to_owned());
        }
    }
    None
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_avoids_double_slash() {
        assert_eq!(join_url("http://host:3000/", "/health"), "http://host:3000/health");
        assert_eq!(join_url("http://host:3000", "health"), "http://host:3000/health");
    }

    #[test]
    fn extract_detail_prefers_status_then_message_then_detail() {
        let json = serde_json::json!({"message": "m", "detail": "d"});
        assert_eq!(extract_detail(&json), Some("m".to_owned()));

        let json = serde_json::json!({"detail": "d"});
        assert_eq!(extract_detail(&json), Some("d".to_owned()));

        let json = serde_json::json!({"other": "x"});
        assert_eq!(extract_detail(&json), None);
    }
}
