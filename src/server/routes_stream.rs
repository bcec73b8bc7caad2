//! `GET /stream`: the live fMP4 byte stream.

use crate::broadcast::{StreamError, Subscription};
use crate::server::AppContext;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::convert::Infallible;

pub fn stream_routes() -> Router<AppContext> {
    Router::new().route("/stream", get(stream_handler))
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            StreamError::InitTimeout(_) | StreamError::AtCapacity(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            StreamError::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Stream the cached init segment, then every media segment published
/// while the connection stays open.
///
/// The response has no length and never ends on its own; it finishes when
/// the viewer disconnects or the server closes the viewer (new encoder
/// session, stalled viewer, shutdown).
pub async fn stream_handler(State(ctx): State<AppContext>) -> Result<Response, StreamError> {
    let subscription = ctx
        .broadcaster
        .subscribe(ctx.config.stream.init_timeout())
        .await?;

    let client_id = subscription.id();
    let init = subscription.init().data.clone();
    tracing::debug!(client_id = %client_id, init_bytes = init.len(), "Streaming to client");

    let body = Body::from_stream(segment_stream(init, subscription));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header("X-Content-Type-Options", "nosniff")
        .body(body)
        .map_err(|e| StreamError::Response(e.to_string()))
}

/// Init bytes first, then media bytes until the subscription closes.
///
/// The subscription lives inside the stream, so dropping the response body
/// unregisters the viewer.
fn segment_stream(
    init: Bytes,
    subscription: Subscription,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let media = stream::unfold(subscription, |subscription| async move {
        let segment = subscription.next().await?;
        Some((Ok(segment.data.clone()), subscription))
    });
    stream::once(async move { Ok(init) }).chain(media)
}
