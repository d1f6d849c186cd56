use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod audio;
mod buttons;
mod discovery;
mod session;
mod state;

use buttons::{HardwareEvent, LedSink, LogLedSink};
use session::SessionOptions;
use state::PackState;

#[derive(Parser)]
#[command(name = "lancomm-beltpack", about = "LAN intercom beltpack client")]
struct Args {
    /// Profile to bind on the server
    #[arg(short, long)]
    profile: String,

    /// Shared secret for the handshake
    #[arg(long, default_value = "changeme")]
    secret: String,

    /// Fallback server address (host:port) if discovery times out
    #[arg(long)]
    server: Option<String>,

    /// Capture device index (default device if omitted)
    #[arg(long)]
    input_device: Option<usize>,

    /// Playback device index (default device if omitted)
    #[arg(long)]
    output_device: Option<usize>,

    /// Initial LED brightness percent: 25, 50, 75 or 100
    #[arg(long, default_value_t = 100)]
    brightness: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lancomm_beltpack=info".into()),
        )
        .init();

    let args = Args::parse();

    let fallback: Option<SocketAddr> = match &args.server {
        Some(spec) => Some(
            spec.parse()
                .with_context(|| format!("invalid server address {spec:?}"))?,
        ),
        None => None,
    };

    let state = Arc::new(PackState::new());
    if matches!(args.brightness, 25 | 50 | 75 | 100) {
        state.brightness.store(args.brightness, Ordering::Relaxed);
    } else {
        warn!("ignoring brightness {}, keeping 100%", args.brightness);
    }

    // One UDP socket shared by the send and receive paths; its ephemeral
    // port is what SET_UDP announces.
    let udp = std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind UDP")?;
    let udp_port = udp.local_addr()?.port();
    let _ = socket2::SockRef::from(&udp).set_tos(0x88); // DSCP AF41
    info!(udp_port, "audio socket bound");

    let stop = Arc::new(AtomicBool::new(false));

    // Audio plane on dedicated threads (the device contract blocks).
    // Each thread opens its own device; cpal streams never move.
    {
        let state = state.clone();
        let socket = udp.try_clone()?;
        let stop = stop.clone();
        let input_device = args.input_device;
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || match lancomm_audio::capture::open_frame_source(input_device) {
                Ok(source) => audio::run_capture_loop(state, socket, Box::new(source), stop),
                Err(e) => error!("capture unavailable, pack is receive-only: {e:#}"),
            })?;
    }
    {
        let state = state.clone();
        let socket = udp.try_clone()?;
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("receive".into())
            .spawn(move || audio::run_receive_loop(state, socket, stop))?;
    }
    {
        let state = state.clone();
        let stop = stop.clone();
        let output_device = args.output_device;
        std::thread::Builder::new()
            .name("playback".into())
            .spawn(move || match lancomm_audio::playback::open_frame_sink(output_device) {
                Ok(sink) => audio::run_playback_loop(state, Box::new(sink), stop),
                Err(e) => error!("playback unavailable: {e:#}"),
            })?;
    }

    // Hardware glue (GPIO buttons, encoders, brightness switch) feeds
    // this channel; without hardware the pack still runs receive-only.
    let (hw_tx, hw_rx) = mpsc::channel::<HardwareEvent>(32);
    let led: Box<dyn LedSink> = Box::new(LogLedSink);

    let opts = SessionOptions {
        profile: args.profile,
        secret: args.secret,
        fallback,
        udp_port,
    };

    let session_state = state.clone();
    tokio::select! {
        _ = session::run_session(session_state, opts, hw_rx, led) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    stop.store(true, Ordering::Relaxed);
    drop(hw_tx);
    Ok(())
}
