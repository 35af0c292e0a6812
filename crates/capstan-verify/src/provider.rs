//! Measurement providers.
//!
//! A provider produces one result document per invocation. Provider
//! failures never surface as errors; they become documents with
//! `ok=false` so the metric's conditions decide how to classify them.
//! Result documents carry the fields conditions may read: `ok`,
//! `statusCode`, `body`, `json`, `value`, `results`, `duration`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{VerifyError, VerifyResult};

fn default_timeout() -> u64 {
    10
}

/// Prometheus query settings. `range_seconds` with `step_seconds`
/// selects a range query; otherwise an instant query at `now`.
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    /// `host:port` of the Prometheus API.
    pub address: String,
    pub query: String,
    #[serde(default)]
    pub range_seconds: Option<u64>,
    #[serde(default)]
    pub step_seconds: Option<u64>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// The provider config union, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Provider {
    Prometheus(PrometheusConfig),
    /// Waits, then reports a trivial successful payload. Test use.
    Sleep {
        #[serde(default)]
        duration_seconds: u64,
    },
}

impl Provider {
    pub fn from_config(config: &serde_json::Value) -> VerifyResult<Self> {
        serde_json::from_value(config.clone())
            .map_err(|e| VerifyError::InvalidProvider(e.to_string()))
    }

    /// Take one measurement. `scope` feeds the `{{path}}` templates in
    /// the query, headers, and bearer token.
    pub async fn measure(&self, scope: &serde_json::Value, now: DateTime<Utc>) -> serde_json::Value {
        match self {
            Provider::Sleep { duration_seconds } => {
                tokio::time::sleep(Duration::from_secs(*duration_seconds)).await;
                serde_json::json!({
                    "ok": true,
                    "duration": *duration_seconds as f64,
                })
            }
            Provider::Prometheus(config) => prometheus_measure(config, scope, now).await,
        }
    }
}

async fn prometheus_measure(
    config: &PrometheusConfig,
    scope: &serde_json::Value,
    now: DateTime<Utc>,
) -> serde_json::Value {
    let path = query_path(config, scope, now);
    let timeout = Duration::from_secs(config.timeout_seconds);
    let started = Instant::now();

    let outcome = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&config.address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, address = %config.address, "prometheus connection failed");
                return None;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "prometheus handshake failed");
                return None;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method("GET")
            .uri(&path)
            .header("host", &config.address)
            .header("user-agent", "capstan-verify/0.1");
        for (name, value) in &config.headers {
            builder = builder.header(name, template(value, scope));
        }
        if let Some(token) = &config.bearer_token {
            builder = builder.header("authorization", format!("Bearer {}", template(token, scope)));
        }
        let request = match builder.body(http_body_util::Empty::<bytes::Bytes>::new()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "prometheus request build failed");
                return None;
            }
        };

        let response = match sender.send_request(request).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "prometheus request failed");
                return None;
            }
        };

        let status = response.status().as_u16();
        use http_body_util::BodyExt;
        let body = match response.into_body().collect().await {
            Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            Err(e) => {
                debug!(error = %e, "prometheus body read failed");
                return Some((status, String::new()));
            }
        };
        Some((status, body))
    })
    .await;

    let duration = started.elapsed().as_secs_f64();
    let Ok(Some((status, body))) = outcome else {
        return serde_json::json!({
            "ok": false,
            "duration": duration,
        });
    };

    let json: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
    let ok = (200..300).contains(&status) && json["status"] == "success";
    let results = series_values(&json);
    serde_json::json!({
        "ok": ok,
        "statusCode": status,
        "body": body,
        "json": json,
        "value": results.first().copied(),
        "results": results,
        "duration": duration,
    })
}

/// Build the query path, templated against the scope. Range queries
/// use `query_range` with `[now - range, now]`.
pub fn query_path(config: &PrometheusConfig, scope: &serde_json::Value, now: DateTime<Utc>) -> String {
    let query = urlencode(&template(&config.query, scope));
    match (config.range_seconds, config.step_seconds) {
        (Some(range), step) => format!(
            "/api/v1/query_range?query={query}&start={}&end={}&step={}",
            now.timestamp() - range as i64,
            now.timestamp(),
            step.unwrap_or(60),
        ),
        (None, _) => format!("/api/v1/query?query={query}&time={}", now.timestamp()),
    }
}

/// Per-series float values from a Prometheus response body.
fn series_values(json: &serde_json::Value) -> Vec<f64> {
    let Some(result) = json["data"]["result"].as_array() else {
        return Vec::new();
    };
    result
        .iter()
        .filter_map(|series| {
            // Instant queries carry `value`, range queries `values`.
            let pair = if series["value"].is_array() {
                &series["value"]
            } else {
                series["values"].as_array()?.last()?
            };
            pair.get(1)?.as_str()?.parse().ok()
        })
        .collect()
}

/// Substitute `{{dotted.path}}` placeholders with values from the
/// scope document. Unknown paths render empty; string values render
/// unquoted, everything else as JSON.
pub fn template(input: &str, scope: &serde_json::Value) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let path = after[..close].trim();
        let mut current = scope;
        for segment in path.split('.') {
            current = &current[segment];
        }
        match current {
            serde_json::Value::String(s) => out.push_str(s),
            serde_json::Value::Null => {}
            other => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scope() -> serde_json::Value {
        serde_json::json!({
            "variables": {"region": "us-east-1", "replicas": 3},
            "target": {"deploymentId": "dep-1"},
        })
    }

    #[test]
    fn template_substitutes_dotted_paths() {
        assert_eq!(
            template("rate(errors{region=\"{{variables.region}}\"}[5m])", &scope()),
            "rate(errors{region=\"us-east-1\"}[5m])"
        );
        assert_eq!(template("n={{variables.replicas}}", &scope()), "n=3");
        assert_eq!(template("x={{missing.path}}", &scope()), "x=");
        assert_eq!(template("no placeholders", &scope()), "no placeholders");
    }

    #[test]
    fn instant_query_path() {
        let config = PrometheusConfig {
            address: "prom:9090".into(),
            query: "up{job=\"{{target.deploymentId}}\"}".into(),
            range_seconds: None,
            step_seconds: None,
            timeout_seconds: 10,
            headers: HashMap::new(),
            bearer_token: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let path = query_path(&config, &scope(), now);
        assert!(path.starts_with("/api/v1/query?query=up%7Bjob%3D%22dep-1%22%7D&time="));
    }

    #[test]
    fn range_query_path() {
        let config = PrometheusConfig {
            address: "prom:9090".into(),
            query: "up".into(),
            range_seconds: Some(300),
            step_seconds: Some(30),
            timeout_seconds: 10,
            headers: HashMap::new(),
            bearer_token: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 5, 0).unwrap();
        let path = query_path(&config, &scope(), now);
        let start = now.timestamp() - 300;
        let end = now.timestamp();
        assert_eq!(
            path,
            format!("/api/v1/query_range?query=up&start={start}&end={end}&step=30")
        );
    }

    #[test]
    fn series_values_from_instant_response() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"pod": "a"}, "value": [1717200000, "0.25"]},
                    {"metric": {"pod": "b"}, "value": [1717200000, "0.75"]},
                ],
            },
        });
        assert_eq!(series_values(&body), vec![0.25, 0.75]);
    }

    #[test]
    fn series_values_from_range_response() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {"metric": {}, "values": [[1717200000, "1"], [1717200060, "2"]]},
                ],
            },
        });
        assert_eq!(series_values(&body), vec![2.0]);
    }

    #[test]
    fn provider_config_tagged_by_type() {
        let provider = Provider::from_config(&serde_json::json!({
            "type": "prometheus",
            "address": "prom:9090",
            "query": "up",
        }))
        .unwrap();
        assert!(matches!(provider, Provider::Prometheus(_)));

        let provider = Provider::from_config(&serde_json::json!({"type": "sleep"})).unwrap();
        assert!(matches!(provider, Provider::Sleep { duration_seconds: 0 }));

        assert!(Provider::from_config(&serde_json::json!({"type": "nope"})).is_err());
    }

    #[tokio::test]
    async fn sleep_provider_reports_ok() {
        let provider = Provider::Sleep { duration_seconds: 0 };
        let data = provider.measure(&scope(), Utc::now()).await;
        assert_eq!(data["ok"], true);
    }

    #[tokio::test]
    async fn prometheus_connection_failure_is_not_ok() {
        // Reserved port with nothing listening.
        let provider = Provider::Prometheus(PrometheusConfig {
            address: "127.0.0.1:1".into(),
            query: "up".into(),
            range_seconds: None,
            step_seconds: None,
            timeout_seconds: 1,
            headers: HashMap::new(),
            bearer_token: None,
        });
        let data = provider.measure(&scope(), Utc::now()).await;
        assert_eq!(data["ok"], false);
    }
}
