use actix_web::guard::{self, Guard};
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use tracing::debug;
use url::Url;

use crate::errors::{internal, ApiError};
use crate::routes::AgentState;

/// Matches requests announcing themselves as gRPC. Everything matched is
/// handed to [`passthrough`], which refuses all but the agent's own
/// token.
pub fn grpc_content_type() -> impl Guard {
    guard::fn_guard(|ctx| {
        ctx.head()
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/grpc"))
            .unwrap_or(false)
    })
}

/// Forwards gRPC frames to the upstream over cleartext HTTP/2 without
/// looking inside them. Only self-directed traffic is allowed through;
/// any other caller is refused at this boundary.
pub async fn passthrough(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {}", state.self_token))
        .unwrap_or(false);
    if !authorized {
        return Err(ApiError::Unauthorized);
    }

    debug!(path = req.uri().path(), "forwarding grpc call");
    state.grpc_proxy.forward(&req, body).await
}

/// HTTP/2 prior-knowledge client for the gRPC leg; the regular proxy
/// client would try HTTP/1.1 first and break framing.
#[derive(Clone)]
pub struct GrpcProxy {
    client: reqwest::Client,
    upstream: Url,
}

impl GrpcProxy {
    pub fn new(upstream: Url) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .build()
            .map_err(internal)?;
        Ok(Self { client, upstream })
    }

    pub async fn forward(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
    ) -> Result<HttpResponse, ApiError> {
        let target = self.upstream.join(req.uri().path()).map_err(internal)?;
        let method =
            reqwest::Method::from_bytes(req.method().as_str().as_bytes()).map_err(internal)?;

        let mut outbound = self.client.request(method, target).body(body);
        for (name, value) in req.headers() {
            let name = name.as_str();
            if name == "host" || name == "content-length" || name == "connection" {
                continue;
            }
            outbound = outbound.header(name, value.as_bytes());
        }

        let upstream_response = outbound
            .send()
            .await
            .map_err(|err| ApiError::Internal(format!("grpc upstream unavailable: {err}")))?;

        let mut response = HttpResponse::build(
            actix_web::http::StatusCode::from_u16(upstream_response.status().as_u16())
                .map_err(internal)?,
        );
        for (name, value) in upstream_response.headers() {
            response.insert_header((name.as_str(), value.as_bytes()));
        }

        Ok(response.streaming(upstream_response.bytes_stream()))
    }
}
