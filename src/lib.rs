//! Livecast - live fragmented-MP4 broadcast server
//!
//! One encoder process writes fMP4 to stdout; the server splits it into init
//! and media segments and fans them out to any number of HTTP viewers. This
//! library crate exposes the core functionality for integration testing.

pub mod broadcast;
pub mod config;
pub mod encoder;
pub mod ingest;
pub mod server;
