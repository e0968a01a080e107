use actix_web::{web, HttpRequest, HttpResponse};
use tracing::debug;

use crate::errors::ApiError;
use crate::metrics::prompb::{QueryResult, ReadResponse};
use crate::metrics::remote_read::{
    decode_read_request, encode_read_request, encode_read_response, rewrite_read_query,
};
use crate::routes::{respond, Access, AgentState};

/// `/api/v1/read`: decode the snappy/protobuf frame, scope each query's
/// matchers, re-encode, forward. An empty namespace set answers with one
/// empty result per query, skipping the backend.
pub async fn read(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AgentState>,
) -> Result<HttpResponse, ApiError> {
    let access = state.authorize(&req).await?;
    let namespace_set = match access {
        Access::SelfCall | Access::Unrestricted => return state.proxy.forward(&req, body).await,
        Access::Scoped(set) => set,
    };

    let mut request = decode_read_request(&body)?;

    if namespace_set.is_empty() {
        let response = ReadResponse {
            results: vec![QueryResult::default(); request.queries.len()],
        };
        return Ok(respond::proto_snappy(encode_read_response(&response)?));
    }

    for query in request.queries.iter_mut() {
        rewrite_read_query(query, &namespace_set, &state.filter_reader_labels);
    }
    debug!(queries = request.queries.len(), "scoped remote-read request");

    let encoded = encode_read_request(&request)?;
    state.proxy.forward_with_body(&req, encoded).await
}
