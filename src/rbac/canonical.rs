//! Canonical string forms for RBAC objects. Informer resyncs redeliver
//! unchanged objects; comparing canonicalised content lets the worker skip
//! rebuilds that would churn the graph for nothing.

use k8s_openapi::api::rbac::v1::{AggregationRule, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Canonical form of a binding: its role reference plus sorted subjects.
pub fn binding(role_ref: &RoleRef, subjects: Option<&[Subject]>) -> String {
    let mut parts: Vec<String> = subjects
        .unwrap_or_default()
        .iter()
        .map(subject)
        .collect();
    parts.sort();

    format!(
        "RoleRef:{}-{}-{};Subjects:{};",
        role_ref.api_group,
        role_ref.kind,
        role_ref.name,
        parts.join("|")
    )
}

/// Canonical form of a role's policy rules, order-insensitive.
pub fn rules(rules: Option<&[PolicyRule]>) -> String {
    let mut parts: Vec<String> = rules.unwrap_or_default().iter().map(policy_rule).collect();
    parts.sort();
    parts.join("&")
}

/// Canonical form of a cluster role: rules plus the aggregation rule's
/// selectors, both order-insensitive.
pub fn cluster_role(
    role_rules: Option<&[PolicyRule]>,
    aggregation: Option<&AggregationRule>,
) -> String {
    let selectors = aggregation
        .and_then(|rule| rule.cluster_role_selectors.as_deref())
        .unwrap_or_default();

    let mut parts: Vec<String> = selectors.iter().map(label_selector).collect();
    parts.sort();

    format!("{};Aggregation:{};", rules(role_rules), parts.join("|"))
}

fn subject(subject: &Subject) -> String {
    format!(
        "{}-{}-{}-{}",
        subject.api_group.as_deref().unwrap_or_default(),
        subject.kind,
        subject.name,
        subject.namespace.as_deref().unwrap_or_default()
    )
}

fn policy_rule(rule: &PolicyRule) -> String {
    let mut out = String::new();
    let mut section = |label: &str, values: Option<&[String]>| {
        if let Some(values) = values {
            if !values.is_empty() {
                let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                out.push_str(label);
                out.push(':');
                out.push_str(&sorted.join("|"));
                out.push(';');
            }
        }
    };

    section("APIGroups", rule.api_groups.as_deref());
    section("NonResourceURLs", rule.non_resource_urls.as_deref());
    section("ResourceNames", rule.resource_names.as_deref());
    section("Resources", rule.resources.as_deref());
    section("Verbs", Some(&rule.verbs));
    out
}

fn label_selector(selector: &LabelSelector) -> String {
    let mut out = String::new();

    if let Some(labels) = &selector.match_labels {
        out.push_str("MatchLabels:");
        // BTreeMap iteration is already key-sorted
        for (key, value) in labels {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push(',');
        }
        out.push(';');
    }

    if let Some(expressions) = &selector.match_expressions {
        if !expressions.is_empty() {
            let mut parts: Vec<String> = expressions
                .iter()
                .map(|expr| {
                    let mut values: Vec<&str> = expr
                        .values
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .map(String::as_str)
                        .collect();
                    values.sort_unstable();
                    if values.is_empty() {
                        format!("{}-{}", expr.key, expr.operator)
                    } else {
                        format!("{}-{}-{}", expr.key, expr.operator, values.join("|"))
                    }
                })
                .collect();
            parts.sort();

            out.push_str("MatchExpressions:");
            out.push_str(&parts.join("|"));
            out.push(';');
        }
    }

    out
}
