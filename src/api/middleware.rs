//! Middleware Components
//!
//! CORS and request tracking. Request ids come from tower-http: an id
//! supplied by the client is kept, otherwise a UUID is minted, and the
//! id is echoed on the response.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderName, HeaderValue, Method},
};
use std::convert::Infallible;
use tower_http::{
    cors::{Any, CorsLayer, ExposeHeaders},
    request_id::{self, MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};

/// Request ID header key
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// CORS for the configured origins; `*` or an empty list allows any origin
pub fn create_cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    let expose = ExposeHeaders::list([HeaderName::from_static(REQUEST_ID_HEADER)]);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(expose)
    } else {
        CorsLayer::new()
            .allow_origin(
                allowed_origins
                    .into_iter()
                    .filter_map(|o| o.parse::<HeaderValue>().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers(expose)
    }
}

/// Assigns `x-request-id` to requests that arrive without one
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::x_request_id(MakeRequestUuid)
}

/// Copies the request's `x-request-id` onto the response
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Request id as a plain string, for error bodies and log fields.
/// Reads the id placed by [`set_request_id_layer`]; `unknown` when the
/// layer is not installed.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .extensions
            .get::<request_id::RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .unwrap_or("unknown");
        Ok(RequestId(id.to_string()))
    }
}
