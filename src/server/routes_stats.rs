use crate::broadcast::BroadcastStats;
use crate::encoder::EncoderStatus;
use crate::server::AppContext;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{IntervalStream, WatchStream};
use tokio_stream::StreamExt;

pub fn stats_routes() -> Router<AppContext> {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/stats/events", get(stats_events_handler))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub encoder: EncoderStatus,
    #[serde(flatten)]
    pub stream: BroadcastStats,
}

fn snapshot(ctx: &AppContext) -> StatsResponse {
    StatsResponse {
        encoder: *ctx.encoder.borrow(),
        stream: ctx.broadcaster.stats(),
    }
}

pub async fn stats_handler(State(ctx): State<AppContext>) -> Json<StatsResponse> {
    Json(snapshot(&ctx))
}

/// Stats pushed as SSE: once a second and whenever the encoder changes state.
pub async fn stats_events_handler(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ticks = IntervalStream::new(tokio::time::interval(Duration::from_secs(1))).map(|_| ());
    let encoder_changes = WatchStream::new(ctx.encoder.clone()).map(|_| ());

    let stream = ticks.merge(encoder_changes).map(move |_| {
        let data = serde_json::to_string(&snapshot(&ctx))
            .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {}"}}"#, e));
        Ok(Event::default().event("stats").data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
