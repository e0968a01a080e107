use promql_parser::label::{MatchOp, Matcher};
use regex::Regex;
use tracing::warn;

use crate::data::StringSet;

/// Label carrying the tenant namespace on every series.
pub const NAMESPACE_LABEL: &str = "namespace";

/// Reserved value matching no real namespace. Ingestion policy guarantees
/// no tenant namespace ever carries this name.
pub const NONE_NAMESPACE: &str = "______";

/// Restricts the `namespace` matcher of a selector's matcher list to the
/// given set. If the list already carries a `namespace` matcher it is
/// rewritten in place, otherwise one is appended; the output always
/// contains exactly one.
pub fn filter_matchers(namespace_set: &StringSet, matchers: &mut Vec<Matcher>) {
    for matcher in matchers.iter_mut() {
        if matcher.name == NAMESPACE_LABEL {
            translate_matcher(namespace_set, matcher);
            return;
        }
    }

    matchers.push(namespace_matcher(namespace_set.values()));
}

/// Builds a fresh `namespace` matcher covering the given namespaces.
pub fn namespace_matcher(namespaces: Vec<&str>) -> Matcher {
    let mut matcher = Matcher {
        op: MatchOp::Equal,
        name: NAMESPACE_LABEL.to_string(),
        value: String::new(),
    };
    modify_matcher(&mut matcher, namespaces);
    matcher
}

/// Rewrites an existing `namespace` matcher so that its satisfying values,
/// intersected with the universe of real namespaces, equal the conjunction
/// of the original predicate with membership in `namespace_set`.
fn translate_matcher(namespace_set: &StringSet, matcher: &mut Matcher) {
    match &matcher.op {
        MatchOp::Equal => {
            if !namespace_set.contains(&matcher.value) {
                matcher.value = NONE_NAMESPACE.to_string();
            }
        }
        MatchOp::NotEqual => {
            let excluded = matcher.value.clone();
            let namespaces: Vec<&str> = namespace_set
                .iter()
                .filter(|ns| *ns != excluded)
                .collect();
            modify_matcher(matcher, namespaces);
        }
        MatchOp::Re(_) => {
            let Some(pattern) = anchored_regex(&matcher.value) else {
                return;
            };
            let namespaces: Vec<&str> = namespace_set
                .iter()
                .filter(|ns| pattern.is_match(ns))
                .collect();
            modify_matcher(matcher, namespaces);
        }
        MatchOp::NotRe(_) => {
            let Some(pattern) = anchored_regex(&matcher.value) else {
                return;
            };
            let namespaces: Vec<&str> = namespace_set
                .iter()
                .filter(|ns| !pattern.is_match(ns))
                .collect();
            modify_matcher(matcher, namespaces);
        }
    }
}

/// Collapses a namespace list onto the matcher: `= ______` when empty,
/// `= value` for a single entry, `=~ a|b|…` otherwise.
fn modify_matcher(matcher: &mut Matcher, namespaces: Vec<&str>) {
    match namespaces.len() {
        0 => {
            matcher.op = MatchOp::Equal;
            matcher.value = NONE_NAMESPACE.to_string();
        }
        1 => {
            matcher.op = MatchOp::Equal;
            matcher.value = namespaces[0].to_string();
        }
        _ => {
            let joined = join(&namespaces);
            match anchored_regex(&joined) {
                Some(re) => {
                    matcher.op = MatchOp::Re(re);
                    matcher.value = joined;
                }
                None => {
                    // Namespace names are DNS labels, so the alternation is
                    // always a valid pattern; deny on the impossible branch.
                    warn!(value = %joined, "unable to compile namespace alternation");
                    matcher.op = MatchOp::Equal;
                    matcher.value = NONE_NAMESPACE.to_string();
                }
            }
        }
    }
}

/// Prometheus regex matchers are fully anchored: `p` behaves as `^(?:p)$`.
/// The empty pattern therefore matches no namespace at all.
pub fn anchored_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(%pattern, %err, "unable to compile label matcher pattern");
            None
        }
    }
}

/// Alternation over sorted values, `a|b|c`.
pub fn join(values: &[&str]) -> String {
    values.join("|")
}
