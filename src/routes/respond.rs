use actix_web::http::header::{self, ContentType};
use actix_web::HttpResponse;
use serde::Serialize;
use serde_json::json;

/// Content type of an empty federation body; real scrapes negotiate, an
/// empty result has nothing to negotiate over.
const EXPOSITION_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Serialize)]
struct SuccessEnvelope<T: Serialize> {
    status: &'static str,
    data: T,
}

/// `{"status":"success","data":...}` with a JSON content type.
pub fn success_json<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header(ContentType::json())
        .json(SuccessEnvelope {
            status: "success",
            data,
        })
}

/// Empty query result of the given type, e.g. `vector` for instant
/// queries against an empty authorization set.
pub fn empty_query_result(result_type: &str) -> HttpResponse {
    success_json(json!({
        "resultType": result_type,
        "result": [],
    }))
}

/// Empty federation body in exposition format.
pub fn empty_metrics() -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, EXPOSITION_TEXT))
        .body("")
}

/// Snappy-compressed protobuf payload for remote-read responses.
pub fn proto_snappy(body: Vec<u8>) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "application/x-protobuf"))
        .insert_header((header::CONTENT_ENCODING, "snappy"))
        .body(body)
}
