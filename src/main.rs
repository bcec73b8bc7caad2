mod cli;

use livecast::{config, server};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use livecast_media::{SegmentKind, SegmentParser};
use serde::Serialize;
use std::io::Read;
use std::path::Path;

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    no_encoder: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    // Load config
    let mut config = config::load_config_or_default(config_path)?;

    // Override from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if no_encoder {
        config.encoder.enabled = false;
    }
    config::validate_config(&config)?;

    tracing::info!("Starting livecast server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );
    if config.encoder.enabled {
        tracing::info!(
            "Encoder: {} {}",
            config.encoder.program,
            config.encoder.args.join(" ")
        );
    }

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "livecast=trace,livecast_media=trace,tower_http=debug".to_string()
        } else {
            "livecast=info,livecast_media=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start {
            host,
            port,
            no_encoder,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, no_encoder, cli.config.as_deref()))
        }
        Commands::Inspect { file, json } => inspect_file(&file, json),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("livecast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct SegmentInfo {
    kind: SegmentKind,
    sequence: u64,
    fragment_sequence: Option<u32>,
    bytes: usize,
    boxes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    file: String,
    bytes: u64,
    init_segments: usize,
    media_segments: usize,
    discarded_bytes: usize,
    segments: Vec<SegmentInfo>,
}

fn inspect_file(file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let mut input =
        std::fs::File::open(file).with_context(|| format!("Failed to open {:?}", file))?;
    let mut parser = SegmentParser::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut segments = Vec::new();
    let mut bytes = 0u64;

    loop {
        let n = input
            .read(&mut buf)
            .with_context(|| format!("Failed to read {:?}", file))?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        for segment in parser
            .feed(&buf[..n])
            .with_context(|| format!("Malformed fragmented MP4 at byte {}", bytes))?
        {
            segments.push(SegmentInfo {
                kind: segment.kind,
                sequence: segment.sequence,
                fragment_sequence: segment.fragment_sequence(),
                bytes: segment.len(),
                boxes: segment.box_types.iter().map(|t| t.to_string()).collect(),
            });
        }
    }

    let report = InspectReport {
        file: file.display().to_string(),
        bytes,
        init_segments: segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Init)
            .count(),
        media_segments: segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Media)
            .count(),
        discarded_bytes: parser.finish(),
        segments,
    };

    if json {
        let json_str = serde_json::to_string_pretty(&report)?;
        println!("{}", json_str);
    } else {
        println!("File: {}", report.file);
        println!("Size: {} bytes", report.bytes);
        println!("Init segments: {}", report.init_segments);
        println!("Media segments: {}", report.media_segments);
        if report.discarded_bytes > 0 {
            println!("Trailing partial data: {} bytes", report.discarded_bytes);
        }
        println!();
        for segment in &report.segments {
            print!(
                "  {:>5} {:<5} {:>9} bytes  [{}]",
                segment.sequence,
                segment.kind.to_string(),
                segment.bytes,
                segment.boxes.join(" ")
            );
            if let Some(seq) = segment.fragment_sequence {
                print!("  mfhd={}", seq);
            }
            println!();
        }
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!(
                "  Queue capacity: {} segments",
                config.stream.queue_capacity
            );
            println!("  Max clients: {}", config.stream.max_clients);
            println!("  Encoder enabled: {}", config.encoder.enabled);
            if config.encoder.enabled {
                println!("  Encoder program: {}", config.encoder.program);
            }
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Encoder program: {}", config.encoder.program);
        }
    }

    Ok(())
}
