use actix_web::http::header::CONTENT_TYPE;
use actix_web::{web, HttpRequest};
use regex::Regex;
use std::sync::OnceLock;
use url::form_urlencoded;

use crate::errors::{bad_data, ApiError};

/// Ordered multimap over the request's query string and, for form posts,
/// its body. Mirrors how Prometheus reads `FormValue`-style parameters
/// from either location.
#[derive(Debug, Default)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn parse(req: &HttpRequest, body: &web::Bytes) -> Result<Self, ApiError> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        if let Some(query) = req.uri().query() {
            pairs.extend(
                form_urlencoded::parse(query.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }

        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form && !body.is_empty() {
            pairs.extend(
                form_urlencoded::parse(body)
                    .map(|(k, v)| (k.into_owned(), v.into_owned())),
            );
        }

        Ok(Self { pairs })
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Drops every value under `name` and appends the replacements.
    pub fn replace(&mut self, name: &str, values: Vec<String>) {
        self.pairs.retain(|(k, _)| k != name);
        for value in values {
            self.pairs.push((name.to_string(), value));
        }
    }

    /// URL-encoded form, suitable for a forwarded query string.
    pub fn encode(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.pairs {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }
}

/// Accepts fractional seconds since epoch or RFC3339 with optional
/// nanoseconds, returning seconds since epoch.
pub fn parse_time(value: &str) -> Result<f64, ApiError> {
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() {
            return Ok(seconds);
        }
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(value) {
        let nanos = parsed.timestamp_subsec_nanos() as f64;
        return Ok(parsed.timestamp() as f64 + nanos / 1e9);
    }

    Err(bad_data(format!(
        "cannot parse {value:?} to a valid timestamp"
    )))
}

/// Accepts fractional seconds or a Prometheus duration literal such as
/// `5m` or `1h30m`, returning seconds. Plain numbers keep their sign so
/// callers can report non-positive steps precisely.
pub fn parse_duration(value: &str) -> Result<f64, ApiError> {
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() {
            return Ok(seconds);
        }
        return Err(bad_data(format!(
            "cannot parse {value:?} to a valid duration. It overflows int64"
        )));
    }

    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^((\d+)y)?((\d+)w)?((\d+)d)?((\d+)h)?((\d+)m)?((\d+)s)?((\d+)ms)?$")
            .expect("duration pattern is valid")
    });

    let captures = pattern
        .captures(value)
        .filter(|_| !value.is_empty())
        .ok_or_else(|| bad_data(format!("cannot parse {value:?} to a valid duration")))?;

    let unit = |index: usize, factor: f64| -> f64 {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
            * factor
    };

    let seconds = unit(2, 365.0 * 24.0 * 3600.0)
        + unit(4, 7.0 * 24.0 * 3600.0)
        + unit(6, 24.0 * 3600.0)
        + unit(8, 3600.0)
        + unit(10, 60.0)
        + unit(12, 1.0)
        + unit(14, 0.001);
    Ok(seconds)
}

/// Prometheus label-name shape, `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn valid_label_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label pattern is valid"));
    pattern.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn parses_fractional_epoch_seconds() {
        assert_eq!(parse_time("123.4").unwrap(), 123.4);
        assert_eq!(parse_time("2").unwrap(), 2.0);
    }

    #[test]
    fn parses_rfc3339() {
        assert_eq!(parse_time("1970-01-01T00:02:03Z").unwrap(), 123.0);
        assert_eq!(
            parse_time("1970-01-01T00:00:01.500000000Z").unwrap(),
            1.5
        );
    }

    #[test]
    fn rejects_garbage_timestamps() {
        let err = parse_time("not-a-time").unwrap_err();
        assert!(err.to_string().contains("valid timestamp"));
    }

    #[test]
    fn parses_prometheus_duration_literals() {
        assert_eq!(parse_duration("1m").unwrap(), 60.0);
        assert_eq!(parse_duration("2h").unwrap(), 7200.0);
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("500ms").unwrap(), 0.5);
    }

    #[test]
    fn parses_fractional_second_durations() {
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
        assert_eq!(parse_duration("-1").unwrap(), -1.0);
    }

    #[test]
    fn rejects_garbage_durations() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn label_names_are_validated() {
        assert!(valid_label_name("__name__"));
        assert!(valid_label_name("namespace"));
        assert!(!valid_label_name("invalid][query"));
        assert!(!valid_label_name("0leading"));
    }

    #[actix_web::test]
    async fn merges_query_string_and_form_body() {
        let req = TestRequest::post()
            .uri("/api/v1/query?time=5")
            .insert_header((CONTENT_TYPE, "application/x-www-form-urlencoded"))
            .to_http_request();
        let body = web::Bytes::from_static(b"query=up");

        let params = Params::parse(&req, &body).unwrap();
        assert_eq!(params.first("time"), Some("5"));
        assert_eq!(params.first("query"), Some("up"));
    }

    #[actix_web::test]
    async fn replace_substitutes_all_values() {
        let req = TestRequest::get()
            .uri("/federate?match%5B%5D=a&match%5B%5D=b")
            .to_http_request();
        let mut params = Params::parse(&req, &web::Bytes::new()).unwrap();
        assert_eq!(params.all("match[]").len(), 2);

        params.replace("match[]", vec!["c".to_string()]);
        assert_eq!(params.all("match[]"), vec!["c"]);
        assert!(params.encode().contains("match%5B%5D=c"));
    }
}
