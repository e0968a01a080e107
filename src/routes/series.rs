use actix_web::{web, HttpRequest, HttpResponse};
use promql_parser::parser::{self, Expr};
use serde_json::json;
use tracing::debug;

use crate::data::StringSet;
use crate::errors::{bad_data, ApiError};
use crate::metrics::expression::rewrite_expression;
use crate::routes::params::{parse_time, Params};
use crate::routes::{respond, Access, AgentState};

/// `/api/v1/series`: every `match[]` selector is scoped before the
/// request goes anywhere near the backend.
pub async fn series(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    let access = state.authorize(&req).await?;
    let namespace_set = match access {
        Access::SelfCall | Access::Unrestricted => return state.proxy.forward(&req, body).await,
        Access::Scoped(set) => set,
    };

    let mut params = Params::parse(&req, &body)?;
    for field in ["start", "end"] {
        if let Some(value) = params.first(field) {
            parse_time(value)?;
        }
    }

    let matches: Vec<String> = params.all("match[]").iter().map(|s| s.to_string()).collect();
    if matches.is_empty() {
        return Err(bad_data("no match[] parameter provided"));
    }
    for raw in &matches {
        parse_metric_selector(raw)?;
    }

    if namespace_set.is_empty() {
        return Ok(respond::success_json(json!([])));
    }

    params.replace("match[]", rewrite_all(&matches, &namespace_set)?);
    state.proxy.forward_with_query(&req, params.encode()).await
}

/// `/federate`: like series, but an empty `match[]` is fine and yields an
/// empty exposition body, as does an empty namespace set.
pub async fn federate(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    let access = state.authorize(&req).await?;
    let namespace_set = match access {
        Access::SelfCall | Access::Unrestricted => return state.proxy.forward(&req, body).await,
        Access::Scoped(set) => set,
    };

    let mut params = Params::parse(&req, &body)?;
    let matches: Vec<String> = params.all("match[]").iter().map(|s| s.to_string()).collect();
    for raw in &matches {
        parse_metric_selector(raw)?;
    }

    if matches.is_empty() || namespace_set.is_empty() {
        return Ok(respond::empty_metrics());
    }

    params.replace("match[]", rewrite_all(&matches, &namespace_set)?);
    state.proxy.forward_with_query(&req, params.encode()).await
}

fn rewrite_all(matches: &[String], namespace_set: &StringSet) -> Result<Vec<String>, ApiError> {
    let mut rewritten = Vec::with_capacity(matches.len());
    for raw in matches {
        let mut expr = parser::parse(raw).map_err(bad_data)?;
        rewrite_expression(&mut expr, namespace_set);
        let scoped = expr.to_string();
        debug!(%raw, %scoped, "scoped series selector");
        rewritten.push(scoped);
    }
    Ok(rewritten)
}

/// A `match[]` entry must be a plain metric selector, not an arbitrary
/// expression.
fn parse_metric_selector(raw: &str) -> Result<(), ApiError> {
    match parser::parse(raw).map_err(bad_data)? {
        Expr::VectorSelector(_) => Ok(()),
        _ => Err(bad_data(format!(
            "invalid metric selector {raw:?}"
        ))),
    }
}
