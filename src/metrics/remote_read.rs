use prost::Message;

use crate::data::StringSet;
use crate::errors::{bad_data, internal, ApiError};
use crate::metrics::matchers::{anchored_regex, join, NAMESPACE_LABEL, NONE_NAMESPACE};
use crate::metrics::prompb::{LabelMatcher, MatcherType, Query, ReadRequest, ReadResponse};

/// Decodes a snappy-compressed, protobuf-encoded remote-read request body.
pub fn decode_read_request(body: &[u8]) -> Result<ReadRequest, ApiError> {
    let decompressed = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|err| bad_data(format!("unable to decompress read request: {err}")))?;

    ReadRequest::decode(decompressed.as_slice())
        .map_err(|err| bad_data(format!("unable to decode read request: {err}")))
}

/// Re-encodes and re-compresses a read request for forwarding.
pub fn encode_read_request(request: &ReadRequest) -> Result<Vec<u8>, ApiError> {
    snap::raw::Encoder::new()
        .compress_vec(&request.encode_to_vec())
        .map_err(internal)
}

pub fn encode_read_response(response: &ReadResponse) -> Result<Vec<u8>, ApiError> {
    snap::raw::Encoder::new()
        .compress_vec(&response.encode_to_vec())
        .map_err(internal)
}

/// Scopes a single remote-read query: federation-marker matchers from
/// `reader_ignore_set` are dropped entirely, then the remaining matchers
/// are restricted to the namespace set like any other selector.
pub fn rewrite_read_query(
    query: &mut Query,
    namespace_set: &StringSet,
    reader_ignore_set: &StringSet,
) {
    let matchers = std::mem::take(&mut query.matchers);
    let mut kept: Vec<LabelMatcher> = matchers
        .into_iter()
        .filter(|m| !reader_ignore_set.contains(&m.name))
        .collect();

    filter_label_matchers(namespace_set, &mut kept);
    query.matchers = kept;
}

/// `filter_matchers` for the protobuf matcher encoding.
pub fn filter_label_matchers(namespace_set: &StringSet, matchers: &mut Vec<LabelMatcher>) {
    for matcher in matchers.iter_mut() {
        if matcher.name == NAMESPACE_LABEL {
            translate_label_matcher(namespace_set, matcher);
            return;
        }
    }

    let mut appended = LabelMatcher {
        r#type: MatcherType::Eq as i32,
        name: NAMESPACE_LABEL.to_string(),
        value: String::new(),
    };
    modify_label_matcher(&mut appended, namespace_set.values());
    matchers.push(appended);
}

fn translate_label_matcher(namespace_set: &StringSet, matcher: &mut LabelMatcher) {
    match MatcherType::try_from(matcher.r#type) {
        Ok(MatcherType::Eq) => {
            if !namespace_set.contains(&matcher.value) {
                matcher.value = NONE_NAMESPACE.to_string();
            }
        }
        Ok(MatcherType::Neq) => {
            let excluded = matcher.value.clone();
            let namespaces: Vec<&str> = namespace_set
                .iter()
                .filter(|ns| *ns != excluded)
                .collect();
            modify_label_matcher(matcher, namespaces);
        }
        Ok(MatcherType::Re) => {
            let Some(pattern) = anchored_regex(&matcher.value) else {
                return;
            };
            let namespaces: Vec<&str> = namespace_set
                .iter()
                .filter(|ns| pattern.is_match(ns))
                .collect();
            modify_label_matcher(matcher, namespaces);
        }
        Ok(MatcherType::Nre) => {
            let Some(pattern) = anchored_regex(&matcher.value) else {
                return;
            };
            let namespaces: Vec<&str> = namespace_set
                .iter()
                .filter(|ns| !pattern.is_match(ns))
                .collect();
            modify_label_matcher(matcher, namespaces);
        }
        Err(_) => {}
    }
}

fn modify_label_matcher(matcher: &mut LabelMatcher, namespaces: Vec<&str>) {
    match namespaces.len() {
        0 => {
            matcher.r#type = MatcherType::Eq as i32;
            matcher.value = NONE_NAMESPACE.to_string();
        }
        1 => {
            matcher.r#type = MatcherType::Eq as i32;
            matcher.value = namespaces[0].to_string();
        }
        _ => {
            matcher.r#type = MatcherType::Re as i32;
            matcher.value = join(&namespaces);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prompb::QueryResult;

    fn namespace_set() -> StringSet {
        ["ns-a", "ns-b"].iter().copied().collect()
    }

    fn eq_matcher(name: &str, value: &str) -> LabelMatcher {
        LabelMatcher {
            r#type: MatcherType::Eq as i32,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn reader_labels_are_dropped_and_namespace_appended() {
        let mut query = Query {
            start_timestamp_ms: 0,
            end_timestamp_ms: 1,
            matchers: vec![
                eq_matcher("prometheus", "cluster-level/test"),
                eq_matcher("__name__", "test_metric1"),
            ],
            hints: None,
        };
        let ignore: StringSet = ["prometheus", "prometheus_replica"].iter().copied().collect();

        rewrite_read_query(&mut query, &namespace_set(), &ignore);

        assert!(query.matchers.iter().all(|m| m.name != "prometheus"));
        assert_eq!(query.matchers.len(), 2);

        let ns = query
            .matchers
            .iter()
            .find(|m| m.name == NAMESPACE_LABEL)
            .expect("namespace matcher appended");
        assert_eq!(ns.r#type, MatcherType::Re as i32);
        assert_eq!(ns.value, "ns-a|ns-b");
    }

    #[test]
    fn foreign_namespace_matcher_is_fenced_off() {
        let mut query = Query {
            start_timestamp_ms: 0,
            end_timestamp_ms: 1,
            matchers: vec![
                eq_matcher("__name__", "test_metric1"),
                eq_matcher(NAMESPACE_LABEL, "ns-c"),
            ],
            hints: None,
        };

        rewrite_read_query(&mut query, &namespace_set(), &StringSet::new());

        let ns = query
            .matchers
            .iter()
            .find(|m| m.name == NAMESPACE_LABEL)
            .unwrap();
        assert_eq!(ns.r#type, MatcherType::Eq as i32);
        assert_eq!(ns.value, NONE_NAMESPACE);
    }

    #[test]
    fn negated_regex_matcher_keeps_complement() {
        let mut matchers = vec![LabelMatcher {
            r#type: MatcherType::Nre as i32,
            name: NAMESPACE_LABEL.to_string(),
            value: "ns-a".to_string(),
        }];

        filter_label_matchers(&namespace_set(), &mut matchers);

        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].r#type, MatcherType::Eq as i32);
        assert_eq!(matchers[0].value, "ns-b");
    }

    #[test]
    fn request_round_trips_through_snappy_and_protobuf() {
        let request = ReadRequest {
            queries: vec![Query {
                start_timestamp_ms: 0,
                end_timestamp_ms: 60_000,
                matchers: vec![eq_matcher("__name__", "test_metric1")],
                hints: None,
            }],
        };

        let encoded = encode_read_request(&request).unwrap();
        let decoded = decode_read_request(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn garbage_body_is_bad_data() {
        let err = decode_read_request(b"not snappy").unwrap_err();
        assert!(matches!(err, crate::errors::ApiError::BadData(_)));
    }

    #[test]
    fn empty_response_has_one_result_per_query() {
        let response = ReadResponse {
            results: vec![QueryResult::default(), QueryResult::default()],
        };
        let encoded = encode_read_response(&response).unwrap();

        let decompressed = snap::raw::Decoder::new().decompress_vec(&encoded).unwrap();
        let decoded = ReadResponse::decode(decompressed.as_slice()).unwrap();
        assert_eq!(decoded.results.len(), 2);
    }
}
