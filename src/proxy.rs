use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::errors::{internal, ApiError};

/// Hop-by-hop headers never copied across the proxy boundary, plus the
/// ones the outbound client owns.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Streams requests to the upstream Prometheus and relays the responses
/// unchanged. Rewritten requests go through the `*_with` variants, which
/// replace the query string or body before forwarding.
#[derive(Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
    upstream: Url,
}

impl ReverseProxy {
    pub fn new(upstream: Url) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(internal)?;
        Ok(Self { client, upstream })
    }

    /// Forwards the request as received.
    pub async fn forward(&self, req: &HttpRequest, body: Bytes) -> Result<HttpResponse, ApiError> {
        let query = req.uri().query().map(str::to_string);
        self.send(req, req.method().as_str(), query.as_deref(), body)
            .await
    }

    /// Forwards a GET for the same path with a replaced query string.
    /// Rewritten form values travel in the URL, never in the body.
    pub async fn forward_with_query(
        &self,
        req: &HttpRequest,
        query: String,
    ) -> Result<HttpResponse, ApiError> {
        self.send(req, "GET", Some(&query), Bytes::new()).await
    }

    /// Forwards the same method and path with a replaced body.
    pub async fn forward_with_body(
        &self,
        req: &HttpRequest,
        body: Vec<u8>,
    ) -> Result<HttpResponse, ApiError> {
        let query = req.uri().query().map(str::to_string);
        self.send(req, req.method().as_str(), query.as_deref(), Bytes::from(body))
            .await
    }

    async fn send(
        &self,
        req: &HttpRequest,
        method: &str,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<HttpResponse, ApiError> {
        let mut target = self
            .upstream
            .join(req.uri().path())
            .map_err(internal)?;
        target.set_query(query.filter(|q| !q.is_empty()));

        debug!(%target, method, "forwarding to upstream");

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(internal)?;
        let mut outbound = self.client.request(method, target).body(body);

        for (name, value) in req.headers() {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            outbound = outbound.header(name.as_str(), value.as_bytes());
        }

        let upstream_response = outbound
            .send()
            .await
            .map_err(|err| ApiError::Internal(format!("upstream request failed: {err}")))?;

        let mut response = HttpResponse::build(
            actix_web::http::StatusCode::from_u16(upstream_response.status().as_u16())
                .map_err(internal)?,
        );
        for (name, value) in upstream_response.headers() {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            response.insert_header((name.as_str(), value.as_bytes()));
        }

        Ok(response.streaming(upstream_response.bytes_stream()))
    }
}

#[derive(Deserialize)]
struct InstantQueryResponse {
    status: String,
    #[serde(default)]
    data: Option<InstantQueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct InstantQueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: HashMap<String, String>,
}

/// Minimal Prometheus API client for the queries this proxy issues on its
/// own behalf (the synthesised label-values endpoint).
#[derive(Clone)]
pub struct PromApiClient {
    client: reqwest::Client,
    base: Url,
}

impl PromApiClient {
    pub fn new(base: Url) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(internal)?;
        Ok(Self { client, base })
    }

    /// Runs an instant query and returns the label sets of the vector
    /// result.
    pub async fn instant_query_vector(
        &self,
        expr: &str,
    ) -> Result<Vec<HashMap<String, String>>, ApiError> {
        let target = self.base.join("/api/v1/query").map_err(internal)?;

        let response = self
            .client
            .get(target)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|err| ApiError::Execution(format!("unable to query {expr}: {err}")))?;

        let parsed: InstantQueryResponse = response
            .json()
            .await
            .map_err(|err| ApiError::Execution(format!("unable to query {expr}: {err}")))?;

        if parsed.status != "success" {
            return Err(ApiError::Execution(format!(
                "unable to query {expr}: {}",
                parsed.error.unwrap_or_default()
            )));
        }

        let data = match parsed.data {
            Some(data) if data.result_type == "vector" => data,
            _ => {
                return Err(ApiError::Execution(format!(
                    "{expr} returned a non-vector result"
                )))
            }
        };

        Ok(data.result.into_iter().map(|sample| sample.metric).collect())
    }
}
