use actix_web::{web, HttpRequest, HttpResponse};
use promql_parser::parser::value::ValueType;
use promql_parser::parser::{self, Expr};
use tracing::debug;

use crate::data::StringSet;
use crate::errors::{bad_data, ApiError};
use crate::metrics::expression::rewrite_expression;
use crate::routes::params::{parse_duration, parse_time, Params};
use crate::routes::{respond, Access, AgentState};

/// `/api/v1/query`: validate, scope the expression, forward. Callers
/// without any namespace get an empty result of the right type without a
/// backend round trip.
pub async fn query(
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
    validate_timeout(&params)?;

    let raw = params
        .first("query")
        .ok_or_else(|| bad_data("unable to get 'query' value from request"))?
        .to_string();
    let mut expr = parser::parse(&raw).map_err(bad_data)?;

    if namespace_set.is_empty() {
        if let Some(response) = empty_instant_response(&expr)? {
            return Ok(response);
        }
    }

    let rewritten = rewrite(&mut expr, &namespace_set, &raw);
    params.replace("query", vec![rewritten]);
    state.proxy.forward_with_query(&req, params.encode()).await
}

/// `/api/v1/query_range`: the same flow with range pre-validation. Range
/// results are always matrices, so the quick response is one too.
pub async fn query_range(
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
    validate_timeout(&params)?;
    validate_range(&params)?;

    let raw = params
        .first("query")
        .ok_or_else(|| bad_data("unable to get 'query' value from request"))?
        .to_string();
    let mut expr = parser::parse(&raw).map_err(bad_data)?;

    if namespace_set.is_empty() && expr.value_type() != ValueType::Scalar {
        check_instant_type(&expr)?;
        return Ok(respond::empty_query_result("matrix"));
    }

    let rewritten = rewrite(&mut expr, &namespace_set, &raw);
    params.replace("query", vec![rewritten]);
    state.proxy.forward_with_query(&req, params.encode()).await
}

fn rewrite(expr: &mut Expr, namespace_set: &StringSet, raw: &str) -> String {
    rewrite_expression(expr, namespace_set);
    let rewritten = expr.to_string();
    debug!(%raw, %rewritten, "scoped query expression");
    rewritten
}

fn validate_timeout(params: &Params) -> Result<(), ApiError> {
    if let Some(timeout) = params.first("timeout") {
        parse_duration(timeout)?;
    }
    Ok(())
}

fn validate_range(params: &Params) -> Result<(), ApiError> {
    let start = parse_time(params.first("start").unwrap_or_default())?;
    let end = parse_time(params.first("end").unwrap_or_default())?;
    if end < start {
        return Err(bad_data("end timestamp must not be before start time"));
    }

    let step = parse_duration(params.first("step").unwrap_or_default())?;
    if step <= 0.0 {
        return Err(bad_data(
            "zero or negative query resolution step widths are not accepted. Try a positive integer",
        ));
    }

    if (end - start) / step > 11_000.0 {
        return Err(bad_data(
            "exceeded maximum resolution of 11,000 points per timeseries. \
             Try decreasing the query resolution (?step=XX)",
        ));
    }

    Ok(())
}

/// Empty-set instant response: scalars still go to the backend (they
/// select no series), everything selectable returns its empty shape.
fn empty_instant_response(expr: &Expr) -> Result<Option<HttpResponse>, ApiError> {
    match expr.value_type() {
        ValueType::Scalar => Ok(None),
        ValueType::Vector => Ok(Some(respond::empty_query_result("vector"))),
        ValueType::Matrix => Ok(Some(respond::empty_query_result("matrix"))),
        other => Err(bad_data(format!(
            "unexpected expression type {other:?}"
        ))),
    }
}

fn check_instant_type(expr: &Expr) -> Result<(), ApiError> {
    match expr.value_type() {
        ValueType::Vector | ValueType::Matrix => Ok(()),
        other => Err(bad_data(format!(
            "unexpected expression type {other:?}"
        ))),
    }
}
