//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which builds an [`AppContext`] with the encoder
//! disabled, so tests publish segments straight into the broadcaster. The
//! [`with_server`] constructor starts Axum on a random port for HTTP-level
//! testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use livecast::config::Config;
use livecast::server::{create_router, AppContext};
use livecast_media::{fixtures, Segment, SegmentParser};

/// Test harness wrapping an [`AppContext`] with no encoder attached.
pub struct TestHarness {
    pub ctx: AppContext,
}

impl TestHarness {
    /// Config used by every harness unless a test overrides it.
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.encoder.enabled = false;
        config.stream.queue_capacity = 64;
        config.stream.init_timeout_ms = 2_000;
        config
    }

    pub fn new() -> Self {
        Self::with_config(Self::test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            ctx: AppContext::new(config),
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::with_server_config(Self::test_config()).await
    }

    /// Start an Axum server with custom config on a random port.
    pub async fn with_server_config(config: Config) -> (Self, SocketAddr) {
        Self::with_server_context(AppContext::new(config)).await
    }

    /// Start an Axum server around an already-built context, e.g. one with
    /// an encoder supervisor attached.
    pub async fn with_server_context(ctx: AppContext) -> (Self, SocketAddr) {
        let harness = Self { ctx };
        let app = create_router(harness.ctx.clone(), None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }

    /// Cache the init segment of encoder session `variant`.
    pub fn publish_init(&self, variant: u8) {
        self.ctx.broadcaster.publish(init_segment(variant));
    }

    /// Publish media segment `sequence`.
    pub fn publish_media(&self, sequence: u32) {
        self.ctx.broadcaster.publish(media_segment(sequence));
    }

    /// Wait until the broadcaster reports `count` clients.
    pub async fn wait_for_clients(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.ctx.broadcaster.client_count() != count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} clients, have {}",
                count,
                self.ctx.broadcaster.client_count()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn init_segment(variant: u8) -> Segment {
    SegmentParser::new()
        .feed(&fixtures::init_segment_variant(variant))
        .expect("valid init segment")
        .remove(0)
}

pub fn media_segment(sequence: u32) -> Segment {
    SegmentParser::new()
        .feed(&fixtures::media_segment(sequence, 256))
        .expect("valid media segment")
        .remove(0)
}

/// Open `/stream` and assert the response looks like a live stream.
pub async fn open_stream(addr: SocketAddr) -> reqwest::Response {
    let resp = reqwest::get(format!("http://{addr}/stream"))
        .await
        .expect("stream request failed");
    assert_eq!(resp.status(), 200);
    resp
}

/// Read from a stream response until `count` segments have been parsed.
pub async fn read_segments(resp: &mut reqwest::Response, count: usize) -> Vec<Segment> {
    let mut parser = SegmentParser::new();
    let mut segments = Vec::new();
    let read = async {
        while segments.len() < count {
            let chunk = resp
                .chunk()
                .await
                .expect("stream read failed")
                .expect("stream ended early");
            segments.extend(parser.feed(&chunk).expect("malformed stream"));
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out reading stream");
    segments
}

/// Read until the server closes the stream; returns the bytes received.
pub async fn read_to_end(resp: &mut reqwest::Response) -> Vec<u8> {
    let mut data = Vec::new();
    let read = async {
        while let Some(chunk) = resp.chunk().await.expect("stream read failed") {
            data.extend_from_slice(&chunk);
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("stream did not end");
    data
}

/// `mfhd` sequence numbers of the media segments in `segments`.
pub fn fragment_sequences(segments: &[Segment]) -> Vec<u32> {
    segments
        .iter()
        .filter_map(|s| s.fragment_sequence())
        .collect()
}
