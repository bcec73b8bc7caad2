use livecast_media::DEFAULT_MAX_BOX_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory of player assets served at `/`. Nothing is served when unset.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Segments buffered per viewer before the oldest is dropped (default: 4)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Concurrent viewers accepted before new ones get 503 (default: 100)
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// How long a new viewer waits for the first init segment (default: 10s)
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// A viewer whose queue stays full this long is disconnected (default: 30s)
    #[serde(default = "default_slow_client_timeout_secs")]
    pub slow_client_timeout_secs: u64,

    /// Largest single box accepted from the encoder
    #[serde(default = "default_max_box_size")]
    pub max_box_size: u64,

    /// Bytes requested from the encoder pipe per read (default: 64 KiB)
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_queue_capacity() -> usize {
    4
}

fn default_max_clients() -> usize {
    100
}

fn default_init_timeout_ms() -> u64 {
    10_000
}

fn default_slow_client_timeout_secs() -> u64 {
    30
}

fn default_max_box_size() -> u64 {
    DEFAULT_MAX_BOX_SIZE
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

impl StreamConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn slow_client_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_client_timeout_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_clients: default_max_clients(),
            init_timeout_ms: default_init_timeout_ms(),
            slow_client_timeout_secs: default_slow_client_timeout_secs(),
            max_box_size: default_max_box_size(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    /// Spawn the encoder when the server starts
    #[serde(default = "default_encoder_enabled")]
    pub enabled: bool,

    /// Encoder executable, looked up on PATH
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments passed to the encoder. It must write fragmented MP4 to stdout.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Pause between an encoder exit and the next launch (default: 1s)
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Pass the encoder's stderr through instead of discarding it
    #[serde(default)]
    pub log_stderr: bool,
}

fn default_encoder_enabled() -> bool {
    true
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-re",
        "-stream_loop",
        "-1",
        "-i",
        "video.mp4",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-tune",
        "zerolatency",
        "-profile:v",
        "baseline",
        "-g",
        "60",
        "-c:a",
        "aac",
        "-b:a",
        "128k",
        "-f",
        "mp4",
        "-movflags",
        "frag_keyframe+empty_moov+default_base_moof",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

impl EncoderConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            enabled: default_encoder_enabled(),
            program: default_program(),
            args: default_args(),
            restart_delay_ms: default_restart_delay_ms(),
            log_stderr: false,
        }
    }
}
