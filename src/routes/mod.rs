//! Request classification and dispatch: every endpoint's sensitivity
//! decides whether it is rewritten, synthesised, passed through, or
//! refused.

pub mod labels;
pub mod params;
pub mod query;
pub mod read;
pub mod respond;
pub mod series;

use std::sync::Arc;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use k8s_openapi::api::authentication::v1::UserInfo;
use tracing::debug;

use crate::auth::{matching_users, TokenAuthenticator};
use crate::data::StringSet;
use crate::errors::ApiError;
use crate::grpc::{self, GrpcProxy};
use crate::proxy::{PromApiClient, ReverseProxy};
use crate::rbac::{NamespacesView, OwnedNamespaces};

/// Shared per-request dependencies of the dispatcher.
pub struct AgentState {
    pub self_token: String,
    pub self_user: UserInfo,
    pub filter_reader_labels: StringSet,
    pub tokens: Arc<dyn TokenAuthenticator>,
    pub namespaces: Arc<dyn NamespacesView>,
    pub proxy: ReverseProxy,
    pub grpc_proxy: GrpcProxy,
    pub backend: PromApiClient,
}

/// What an authenticated caller is allowed to see.
pub enum Access {
    /// The agent's own identity; requests bypass rewriting entirely.
    SelfCall,
    /// Cluster-wide reader, no rewrite required.
    Unrestricted,
    /// Restricted to the given namespaces; possibly none.
    Scoped(StringSet),
}

impl AgentState {
    /// Extracts and authenticates the bearer token, then resolves what
    /// the caller may observe. Missing or rejected tokens are refused
    /// before any endpoint logic runs.
    pub async fn authorize(&self, req: &HttpRequest) -> Result<Access, ApiError> {
        let token = bearer_token(req).ok_or(ApiError::Unauthorized)?;

        let user = self.tokens.authenticate(&token).await.map_err(|err| {
            debug!("token rejected: {err}");
            ApiError::Unauthorized
        })?;

        if matching_users(&self.self_user, &user) {
            return Ok(Access::SelfCall);
        }

        match self.namespaces.own(&token) {
            OwnedNamespaces::All => Ok(Access::Unrestricted),
            OwnedNamespaces::Set(set) => Ok(Access::Scoped(set)),
        }
    }

    /// True when the raw bearer token is the agent's own, which is what
    /// gates the privileged admin and delete surface.
    pub fn is_self_token(&self, req: &HttpRequest) -> bool {
        bearer_token(req).as_deref() == Some(self.self_token.as_str())
    }
}

pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = header.strip_prefix("Bearer ").unwrap_or(header);
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Wires the full endpoint table. gRPC passthrough is matched first by
/// content type; the UI whitelist forwards without rewriting; everything
/// else is access-controlled, with the fallback refusing whatever no
/// handler claims.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/{grpc_tail:.*}")
            .guard(grpc::grpc_content_type())
            .route(web::route().to(grpc::passthrough)),
    );

    for path in [
        "/alerts",
        "/graph",
        "/status",
        "/flags",
        "/config",
        "/rules",
        "/targets",
        "/version",
        "/service-discovery",
        "/metrics",
        "/-/healthy",
        "/-/ready",
        "/consoles/{tail:.*}",
        "/static/{tail:.*}",
        "/user/{tail:.*}",
        "/debug/{tail:.*}",
    ] {
        cfg.service(
            web::resource(path)
                .route(web::get().to(passthrough))
                .default_service(web::to(fallback)),
        );
    }

    cfg.service(
        web::resource("/api/v1/query")
            .route(web::get().to(query::query))
            .route(web::post().to(query::query))
            .default_service(web::to(fallback)),
    );
    cfg.service(
        web::resource("/api/v1/query_range")
            .route(web::get().to(query::query_range))
            .route(web::post().to(query::query_range))
            .default_service(web::to(fallback)),
    );
    cfg.service(
        web::resource("/api/v1/series")
            .route(web::get().to(series::series))
            .default_service(web::to(fallback)),
    );
    cfg.service(
        web::resource("/api/v1/read")
            .route(web::post().to(read::read))
            .default_service(web::to(fallback)),
    );
    cfg.service(
        web::resource("/api/v1/label/{name}/values")
            .route(web::get().to(labels::label_values))
            .default_service(web::to(fallback)),
    );
    cfg.service(
        web::resource("/federate")
            .route(web::get().to(series::federate))
            .default_service(web::to(fallback)),
    );

    cfg.default_service(web::to(fallback));
}

/// Whitelisted UI and debug paths go straight to the upstream.
async fn passthrough(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    state.proxy.forward(&req, body).await
}

/// Everything outside the endpoint table: admin paths, deletes, unknown
/// API surface. Only the agent's own token may pass, unrewritten.
async fn fallback(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    if state.is_self_token(&req) {
        if let Access::SelfCall = state.authorize(&req).await? {
            return state.proxy.forward(&req, body).await;
        }
    }

    Err(ApiError::Unauthorized)
}
