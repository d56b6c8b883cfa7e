//! Prometheus-backed metric source.
//!
//! Each metric name maps to a PromQL template. `{namespace}` and `{name}`
//! are substituted with the target's namespace and name before the instant
//! query is sent to `/api/v1/query`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{MetricSource, SourceError};
use crate::config::MetricsConfig;
use crate::types::ResolvedTarget;

/// Built-in queries for the common utilization metrics.
const BUILTIN_QUERIES: &[(&str, &str)] = &[
    (
        "cpu",
        r#"100 * sum(rate(container_cpu_usage_seconds_total{namespace="{namespace}",pod=~"{name}-.*",container!=""}[5m])) / sum(kube_pod_container_resource_requests{namespace="{namespace}",pod=~"{name}-.*",resource="cpu"})"#,
    ),
    (
        "memory",
        r#"100 * sum(container_memory_working_set_bytes{namespace="{namespace}",pod=~"{name}-.*",container!=""}) / sum(kube_pod_container_resource_requests{namespace="{namespace}",pod=~"{name}-.*",resource="memory"})"#,
    ),
];

/// Configuration for the Prometheus source
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// PromQL templates keyed by metric name
    pub queries: BTreeMap<String, String>,
}

impl PrometheusConfig {
    /// Build from controller config; `None` when no URL is configured.
    pub fn from_metrics_config(config: &MetricsConfig) -> Option<Self> {
        let base_url = config.prometheus_url.clone()?;
        Some(Self {
            base_url,
            timeout: Duration::from_secs(config.timeout_seconds),
            queries: config.queries.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    value: (f64, String),
}

pub struct PrometheusSource {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusSource {
    pub fn new(config: PrometheusConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Render the PromQL for `name` against `target`.
    pub fn render_query(&self, target: &ResolvedTarget, name: &str) -> String {
        let template = self
            .config
            .queries
            .get(name)
            .map(String::as_str)
            .or_else(|| {
                BUILTIN_QUERIES
                    .iter()
                    .find(|(builtin, _)| *builtin == name)
                    .map(|(_, q)| *q)
            });

        match template {
            Some(template) => template
                .replace("{namespace}", &target.namespace)
                .replace("{name}", &target.name),
            None => format!("sum({name}{{namespace=\"{}\"}})", target.namespace),
        }
    }

    fn parse_value(
        target: &ResolvedTarget,
        data: PrometheusData,
    ) -> Result<Option<f64>, SourceError> {
        let raw = match data.result_type.as_str() {
            "vector" => {
                let samples: Vec<VectorSample> = serde_json::from_value(data.result)
                    .map_err(|e| SourceError::malformed(target, e))?;
                match samples.first() {
                    Some(sample) => sample.value.1.clone(),
                    None => return Ok(None),
                }
            }
            "scalar" => {
                let (_, value): (f64, String) = serde_json::from_value(data.result)
                    .map_err(|e| SourceError::malformed(target, e))?;
                value
            }
            other => {
                return Err(SourceError::malformed(
                    target,
                    format!("unsupported result type '{other}'"),
                ))
            }
        };

        let value: f64 = raw
            .parse()
            .map_err(|_| SourceError::malformed(target, format!("non-numeric sample '{raw}'")))?;
        Ok(value.is_finite().then_some(value))
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn get_metric(
        &self,
        target: &ResolvedTarget,
        name: &str,
    ) -> Result<Option<f64>, SourceError> {
        let url = format!("{}/api/v1/query", self.config.base_url.trim_end_matches('/'));
        let query = self.render_query(target, name);

        debug!(target = %target, metric = name, query = %query, "Executing Prometheus query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| SourceError::transient(target, e))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::transient(
                target,
                format!("Prometheus returned {status}"),
            ));
        }

        let body: PrometheusResponse = response
            .json()
            .await
            .map_err(|e| SourceError::malformed(target, e))?;

        if body.status != "success" {
            return Err(SourceError::malformed(
                target,
                body.error.unwrap_or_else(|| format!("query status {}", body.status)),
            ));
        }

        match body.data {
            Some(data) => Self::parse_value(target, data),
            None => Ok(None),
        }
    }
}
