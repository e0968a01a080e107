use promql_parser::parser::{self, Expr};
use tracing::warn;

use crate::data::StringSet;
use crate::errors::{bad_data, ApiError};
use crate::metrics::matchers::{filter_matchers, namespace_matcher};

/// Parses a PromQL expression, scopes every selector to `namespace_set`,
/// and returns the canonical serialisation for the upstream to re-parse.
pub fn rewrite_query(namespace_set: &StringSet, raw: &str) -> Result<String, ApiError> {
    let mut expr = parser::parse(raw).map_err(bad_data)?;
    rewrite_expression(&mut expr, namespace_set);
    Ok(expr.to_string())
}

/// Depth-first traversal mutating every vector and matrix selector in
/// place. Aggregations, binary operators, function calls and subqueries
/// are transparent to the rewrite.
pub fn rewrite_expression(expr: &mut Expr, namespace_set: &StringSet) {
    match expr {
        Expr::VectorSelector(vs) => {
            filter_matchers(namespace_set, &mut vs.matchers.matchers);
        }
        Expr::MatrixSelector(ms) => {
            filter_matchers(namespace_set, &mut ms.vs.matchers.matchers);
        }
        Expr::Aggregate(agg) => {
            rewrite_expression(&mut agg.expr, namespace_set);
            if let Some(param) = agg.param.as_mut() {
                rewrite_expression(param, namespace_set);
            }
        }
        Expr::Unary(unary) => {
            rewrite_expression(&mut unary.expr, namespace_set);
        }
        Expr::Binary(binary) => {
            rewrite_expression(&mut binary.lhs, namespace_set);
            rewrite_expression(&mut binary.rhs, namespace_set);
        }
        Expr::Paren(paren) => {
            rewrite_expression(&mut paren.expr, namespace_set);
        }
        Expr::Subquery(subquery) => {
            rewrite_expression(&mut subquery.expr, namespace_set);
        }
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                rewrite_expression(arg, namespace_set);
            }
        }
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) => {}
        Expr::Extension(_) => {
            // Extension nodes carry shapes this rewriter cannot see into.
            warn!("skipping extension node during namespace rewrite");
        }
    }
}

/// Instant selector over exactly the given namespaces, e.g.
/// `{namespace=~"ns-a|ns-b"}`.
pub fn selector_for_namespaces(namespaces: Vec<&str>) -> String {
    let matcher = namespace_matcher(namespaces);
    let op = match &matcher.op {
        promql_parser::label::MatchOp::Re(_) => "=~",
        _ => "=",
    };
    format!("{{{}{}\"{}\"}}", matcher.name, op, matcher.value)
}

/// Query counting every metric name visible inside the given namespaces.
/// Backs the synthesised `/api/v1/label/__name__/values` endpoint.
pub fn count_metric_names_query(namespaces: Vec<&str>) -> String {
    format!(
        "count ({}) by (__name__)",
        selector_for_namespaces(namespaces)
    )
}
