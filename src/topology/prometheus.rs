//! Prometheus instant-query client.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{MetricSample, MetricsSource};
use crate::error::{MeshError, MeshResult};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    // [unix_ts, "value"]
    value: (f64, String),
}

fn parse_response(body: &[u8]) -> MeshResult<Vec<MetricSample>> {
    let response: QueryResponse = serde_json::from_slice(body)?;
    for warning in &response.warnings {
        warn!(%warning, "Prometheus query warning");
    }

    if response.status != "success" {
        return Err(MeshError::Metrics(format!(
            "query failed ({}): {}",
            response.error_type.as_deref().unwrap_or("unknown"),
            response.error.as_deref().unwrap_or("no error message")
        )));
    }

    let data = response
        .data
        .ok_or_else(|| MeshError::Metrics("response has no data".to_string()))?;
    if data.result_type != "vector" {
        return Err(MeshError::Metrics(format!(
            "expected vector result, got {}",
            data.result_type
        )));
    }

    let result: Vec<VectorSample> = serde_json::from_value(data.result)?;
    result
        .into_iter()
        .map(|sample| {
            let value = sample.value.1.parse::<f64>().map_err(|e| {
                MeshError::Metrics(format!("bad sample value {:?}: {e}", sample.value.1))
            })?;
            Ok(MetricSample {
                labels: sample.metric,
                value,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: &str, timeout: Duration) -> MeshResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn query_url(&self) -> String {
        format!("{}/api/v1/query", self.base_url)
    }
}

#[async_trait]
impl MetricsSource for PrometheusClient {
    async fn query(&self, query: &str) -> MeshResult<Vec<MetricSample>> {
        let response = self
            .http
            .get(self.query_url())
            .query(&[("query", query)])
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        // Prometheus returns a JSON error envelope on 4xx/5xx too.
        match parse_response(&body) {
            Ok(samples) => {
                debug!(samples = samples.len(), "Prometheus query returned");
                Ok(samples)
            }
            Err(e) if status.is_success() => Err(e),
            Err(e) => Err(MeshError::Metrics(format!("HTTP {status}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector_result() {
        let body = br#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {
                        "metric": {"dst_namespace": "ns", "dst_deployment": "service-b"},
                        "value": [1712000000.123, "2.5"]
                    },
                    {
                        "metric": {"dst_namespace": "ns", "dst_deployment": "idle"},
                        "value": [1712000000.123, "0"]
                    }
                ]
            }
        }"#;
        let samples = parse_response(body).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label("dst_deployment"), "service-b");
        assert_eq!(samples[0].value, 2.5);
        assert_eq!(samples[1].value, 0.0);
    }

    #[test]
    fn test_parse_empty_vector() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(parse_response(body).unwrap().is_empty());
    }

    #[test]
    fn test_parse_error_envelope() {
        let body = br#"{"status":"error","errorType":"bad_data","error":"parse error at char 4"}"#;
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("bad_data"));
    }

    #[test]
    fn test_parse_rejects_non_vector() {
        let body = br#"{"status":"success","data":{"resultType":"scalar","result":[1.0,"3"]}}"#;
        assert!(matches!(parse_response(body), Err(MeshError::Metrics(_))));
    }

    #[test]
    fn test_parse_nan_value_passes_through() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{},"value":[1.0,"NaN"]}
        ]}}"#;
        let samples = parse_response(body).unwrap();
        assert!(samples[0].value.is_nan());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = PrometheusClient::new("http://prom:9090/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.query_url(), "http://prom:9090/api/v1/query");
    }
}
