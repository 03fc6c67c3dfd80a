//! tinycam-player - command-line mirror of the `/stream` WebSocket
//! protocol, used to smoke-test a running `tinycam-server`.
//!
//! Connects, completes the handshake, and prints a running tally of
//! decrypted frames and buffered bytes as they arrive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tinycam_core::keys::KeyMaterial;
use tinycam_core::player::{MediaBuffer, Player, Retention};
use tinycam_core::utils::now_unix_secs;

/// tinycam-player - exercises a running tinycam-server's `/stream` endpoint.
#[derive(Parser, Debug)]
#[command(name = "tinycam-player")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket origin of the server, e.g. `ws://127.0.0.1:9191`.
    #[arg(long, default_value = "ws://127.0.0.1:9191")]
    origin: String,

    /// Path to the server's key file (`keys.json`); the access key is read
    /// from it. Mutually exclusive with `--access-key-b64`.
    #[arg(long, value_name = "FILE")]
    key_file: Option<PathBuf>,

    /// Base64-encoded 32-byte access key, used instead of `--key-file`.
    #[arg(long)]
    access_key_b64: Option<String>,

    /// Seconds from now the handshake token should expire in.
    #[arg(long, default_value_t = 60)]
    ttl_secs: u64,

    /// Retention mode: `grow`, or `window:<minutes>`.
    #[arg(long, default_value = "grow")]
    retention: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TINYCAM_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

fn parse_retention(spec: &str) -> Result<Retention> {
    if spec == "grow" {
        return Ok(Retention::Grow);
    }
    if let Some(minutes) = spec.strip_prefix("window:") {
        let minutes: u64 = minutes
            .parse()
            .with_context(|| format!("invalid window minutes in '{spec}'"))?;
        return Ok(Retention::Window { minutes });
    }
    anyhow::bail!("retention must be 'grow' or 'window:<minutes>', got '{spec}'")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    let access_key = match (&args.key_file, &args.access_key_b64) {
        (Some(path), None) => KeyMaterial::load(path)
            .context("Failed to load key file")?
            .access_key()
            .context("Access key in key file is malformed")?,
        (None, Some(b64)) => tinycam_core::utils::b64_decode(b64)
            .context("Failed to decode --access-key-b64")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("access key must decode to 32 bytes"))?,
        _ => anyhow::bail!("exactly one of --key-file or --access-key-b64 is required"),
    };

    let retention = parse_retention(&args.retention)?;

    let cnonce = tinycam_core::crypto::random_handshake_nonce();
    let exp = now_unix_secs() + args.ttl_secs;
    let url = Player::build_url(&args.origin, &access_key, exp, &cnonce);
    log::info!("connecting to {url}");

    let player = Player::new(url, access_key);
    let mut buffer = MediaBuffer::new(retention);

    let result = player.run(cnonce, &mut buffer).await;

    log::info!(
        "session ended: {} frames, {} bytes buffered",
        buffer.frame_count(),
        buffer.total_len()
    );

    result.map_err(|e| anyhow::anyhow!("player session failed: {e}"))
}
