use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::debug;

use crate::errors::{bad_data, ApiError};
use crate::metrics::expression::count_metric_names_query;
use crate::metrics::matchers::NAMESPACE_LABEL;
use crate::routes::{respond, Access, AgentState};

const METRIC_NAME_LABEL: &str = "__name__";

/// `/api/v1/label/{name}/values`. The namespace and metric-name labels
/// would leak other tenants' values, so their answers are synthesised;
/// every other label passes through.
pub async fn label_values(
    req: HttpRequest,
    body: web::Bytes,
    path: web::Path<(String,)>,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    let (name,) = path.into_inner();
    if !super::params::valid_label_name(&name) {
        return Err(bad_data(format!("invalid label name: {name:?}")));
    }

    let access = state.authorize(&req).await?;
    let namespace_set = match access {
        Access::SelfCall | Access::Unrestricted => return state.proxy.forward(&req, body).await,
        Access::Scoped(set) => set,
    };

    match name.as_str() {
        NAMESPACE_LABEL => {
            // Owned namespaces are already the answer; the backend may
            // additionally know stale ones this caller must not see.
            Ok(respond::success_json(namespace_set.values()))
        }
        METRIC_NAME_LABEL => {
            if namespace_set.is_empty() {
                return Ok(respond::success_json(json!([])));
            }

            let expr = count_metric_names_query(namespace_set.values());
            debug!(%expr, "synthesising metric name listing");
            let samples = state.backend.instant_query_vector(&expr).await?;

            let mut names: Vec<String> = samples
                .into_iter()
                .filter_map(|mut metric| metric.remove(METRIC_NAME_LABEL))
                .collect();
            names.sort_unstable();
            Ok(respond::success_json(names))
        }
        _ => state.proxy.forward(&req, body).await,
    }
}
