use actix_web::http::header::{self, ContentType};
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to API clients, mapped onto the Prometheus error
/// envelope. Anything that happens after a request has been forwarded is
/// the upstream's to report, not ours.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input detected during pre-validation.
    #[error("{0}")]
    BadData(String),

    /// Missing or invalid token, or a privileged endpoint without the
    /// agent's own token.
    #[error("unauthorized")]
    Unauthorized,

    /// A synthesised query against the backend failed.
    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    status: &'a str,
    #[serde(rename = "errorType", skip_serializing_if = "str::is_empty")]
    error_type: &'a str,
    error: String,
}

impl ApiError {
    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadData(_) => "bad_data",
            ApiError::Execution(_) => "execution",
            ApiError::Unauthorized | ApiError::Internal(_) => "",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::BadData(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Unauthorized responses stay plain text, matching what the
        // upstream Prometheus UI expects from its proxies.
        if matches!(self, ApiError::Unauthorized) {
            return HttpResponse::Unauthorized()
                .content_type(ContentType::plaintext())
                .body("unauthorized");
        }

        HttpResponse::build(self.status_code())
            .insert_header(header::ContentType::json())
            .json(ErrorEnvelope {
                status: "error",
                error_type: self.error_type(),
                error: self.to_string(),
            })
    }
}

pub fn bad_data(msg: impl Into<String>) -> ApiError {
    ApiError::BadData(msg.into())
}

pub fn internal(msg: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn bad_data_renders_prometheus_envelope() {
        let resp = bad_data("no match[] parameter provided").error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "error");
        assert_eq!(parsed["errorType"], "bad_data");
        assert_eq!(parsed["error"], "no match[] parameter provided");
    }

    #[actix_web::test]
    async fn unauthorized_is_plain_text() {
        let resp = ApiError::Unauthorized.error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);

        let body = to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"unauthorized");
    }
}
