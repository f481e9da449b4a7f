use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use wsstream::{Codec, Server, ServerConfig, DEFAULT_PORT};

#[derive(Parser)]
#[command(
    name = "wsstream-server",
    about = "Streams H.264/H.265 or MP4 media to browsers over TLS WebSockets"
)]
struct Args {
    /// Listen port
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Codec of raw bitstream inputs: h264, h265 (hevc)
    #[arg(short = 'c', long, env = "CODEC_TYPE", default_value = "h264")]
    codec: String,

    /// Media file path (.h264, .h265 or .mp4)
    #[arg(short = 'f', long)]
    file: PathBuf,

    /// TLS certificate file (PEM); requires --key
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key file (PEM); requires --cert
    #[arg(long)]
    key: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.cert.is_some() != args.key.is_some() {
        eprintln!("Error: --cert and --key must be specified together");
        std::process::exit(1);
    }

    let codec = match args.codec.as_str() {
        "h265" | "hevc" => Codec::H265,
        _ => Codec::H264,
    };

    let mut config = ServerConfig::new(args.file, codec);
    config.port = args.port;
    config.cert_path = args.cert;
    config.key_path = args.key;

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        }) {
            tracing::error!(error = %e, "failed to install signal handler");
            std::process::exit(1);
        }
    }

    println!("WebSocket server running on port {}", args.port);
    println!("Press Ctrl+C to stop");

    if let Err(e) = server.run(&running) {
        tracing::error!(error = %e, "server loop failed");
        std::process::exit(1);
    }
}
