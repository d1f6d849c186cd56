//! The beltpack control session: discover, authenticate, bind a profile,
//! announce the UDP port, then hold the line handling pushes, button
//! traffic, and liveness pings. Reconnects with backoff on any error.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lancomm_protocol::auth;
use lancomm_protocol::control::{encode_line, take_line, ClientVerb, ServerVerb};
use lancomm_protocol::types::SessionConfig;

use crate::buttons::{led_color, scaled_rgb, talk_transition, HardwareEvent, LedSink};
use crate::discovery::{self, DISCOVERY_TIMEOUT};
use crate::state::PackState;

/// The client pings after this much server silence.
pub const PING_IDLE: Duration = Duration::from_secs(10);

const BACKOFF_START: Duration = Duration::from_secs(2);
const BACKOFF_STEP: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

pub struct SessionOptions {
    /// Profile to bind on connect.
    pub profile: String,
    /// Shared secret for the challenge handshake.
    pub secret: String,
    /// Used when discovery times out.
    pub fallback: Option<SocketAddr>,
    /// Local UDP port announced via SET_UDP.
    pub udp_port: u16,
}

/// Linear reconnect schedule: start 2 s, step 1 s, cap 5 s.
pub fn next_backoff(current: Duration) -> Duration {
    (current + BACKOFF_STEP).min(BACKOFF_CAP)
}

/// Run the session forever, reconnecting on any control-plane failure.
/// Capture pauses while disconnected; playback keeps draining.
pub async fn run_session(
    state: Arc<PackState>,
    opts: SessionOptions,
    mut events: mpsc::Receiver<HardwareEvent>,
    mut led: Box<dyn LedSink>,
) {
    let mut backoff = BACKOFF_START;
    loop {
        let connected = async {
            let addr = resolve_server(&opts).await?;
            connect_once(&state, addr, &opts, &mut events, led.as_mut()).await
        }
        .await;

        state.connected.store(false, Ordering::Relaxed);
        state.clear_keyed();
        refresh_leds(&state, led.as_mut());

        match connected {
            Ok(()) => {
                info!("server closed the connection, reconnecting");
                backoff = BACKOFF_START;
            }
            Err(e) => warn!("session ended: {e:#}"),
        }

        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

/// mDNS first, configured fallback second.
async fn resolve_server(opts: &SessionOptions) -> Result<SocketAddr> {
    let browsed =
        tokio::task::spawn_blocking(|| discovery::resolve(DISCOVERY_TIMEOUT)).await?;
    match browsed {
        Ok((ip, port)) => Ok(SocketAddr::new(ip, port)),
        Err(e) => match opts.fallback {
            Some(addr) => {
                info!("discovery failed ({e:#}); using configured {addr}");
                Ok(addr)
            }
            None => Err(e),
        },
    }
}

/// One full session: handshake → bind → SET_UDP → steady state. Returns
/// Ok on server EOF, Err on anything that warrants backoff.
pub(crate) async fn connect_once(
    state: &PackState,
    addr: SocketAddr,
    opts: &SessionOptions,
    events: &mut mpsc::Receiver<HardwareEvent>,
    led: &mut dyn LedSink,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("could not connect to {addr}"))?;
    let mut buf = BytesMut::with_capacity(4096);

    // Challenge handshake.
    let nonce = match parse_verb(&read_line(&mut stream, &mut buf).await?)? {
        ServerVerb::AuthChallenge(nonce) => nonce,
        other => bail!("expected challenge, got {other:?}"),
    };
    let response = auth::challenge_response(&nonce, &opts.secret);
    stream.write_all(&encode_line(&response)).await?;
    let user_id = match parse_verb(&read_line(&mut stream, &mut buf).await?)? {
        ServerVerb::UserId(id) => id,
        ServerVerb::AuthFail => bail!("server rejected the shared secret"),
        other => bail!("expected user id, got {other:?}"),
    };
    state.user_id.store(user_id, Ordering::Relaxed);

    // Upstream audio goes to the same host and port as control.
    *state.server_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);

    // Enumerate profiles, then bind ours.
    stream
        .write_all(&encode_line(&ClientVerb::GetUsers.encode()))
        .await?;
    match parse_verb(&read_line(&mut stream, &mut buf).await?)? {
        ServerVerb::Users(names) => {
            if !names.iter().any(|n| n == &opts.profile) {
                warn!(profile = %opts.profile, "profile not on the server (yet)");
            }
        }
        other => bail!("expected user list, got {other:?}"),
    }

    stream
        .write_all(&encode_line(
            &ClientVerb::SelectUser(opts.profile.clone()).encode(),
        ))
        .await?;
    match parse_verb(&read_line(&mut stream, &mut buf).await?)? {
        ServerVerb::Config(json) => {
            let config = SessionConfig::from_json(&json).context("bad session config")?;
            state.apply_config(&config);
        }
        ServerVerb::Error(code) => bail!("bind rejected: {code:?}"),
        other => bail!("expected config, got {other:?}"),
    }

    stream
        .write_all(&encode_line(&ClientVerb::SetUdp(opts.udp_port).encode()))
        .await?;
    match parse_verb(&read_line(&mut stream, &mut buf).await?)? {
        ServerVerb::UdpOk => {}
        other => bail!("UDP registration failed: {other:?}"),
    }

    state.connected.store(true, Ordering::Relaxed);
    refresh_leds(state, led);
    info!(user_id, profile = %opts.profile, "session ready");

    // Steady state: reads and writes on separate halves so pushes and
    // button traffic interleave freely.
    let (mut read_half, mut write_half) = stream.into_split();
    let mut last_traffic = Instant::now();
    loop {
        let ping_at =
            tokio::time::Instant::from_std(last_traffic + PING_IDLE);
        tokio::select! {
            read = read_half.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
                last_traffic = Instant::now();
                while let Some(line) = take_line(&mut buf)? {
                    handle_server_line(state, &line, led);
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("hardware event channel closed");
                };
                if let Some(line) = handle_hardware_event(state, event, led) {
                    write_half.write_all(&line).await?;
                }
            }
            _ = tokio::time::sleep_until(ping_at) => {
                write_half.write_all(&encode_line(&ClientVerb::Ping.encode())).await?;
                last_traffic = Instant::now();
            }
        }
    }
}

fn parse_verb(line: &str) -> Result<ServerVerb> {
    ServerVerb::parse(line).map_err(Into::into)
}

async fn read_line(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(line) = take_line(buf)? {
            return Ok(line);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            bail!("connection closed");
        }
    }
}

fn handle_server_line(state: &PackState, line: &str, led: &mut dyn LedSink) {
    match ServerVerb::parse(line) {
        Ok(ServerVerb::UpdateConfig(json)) | Ok(ServerVerb::Config(json)) => {
            match SessionConfig::from_json(&json) {
                Ok(config) => {
                    info!("profile updated by operator");
                    state.apply_config(&config);
                    refresh_leds(state, led);
                }
                Err(e) => warn!("unusable config push: {}", e),
            }
        }
        Ok(ServerVerb::FlashPack) => {
            info!("identify request");
            led.flash_all();
        }
        Ok(ServerVerb::Pong) => {}
        Ok(other) => debug!("ignoring {other:?}"),
        Err(e) => debug!("ignoring unparseable line: {}", e),
    }
}

/// Translate a hardware edge into state changes and, for talk buttons,
/// the control line to send.
fn handle_hardware_event(
    state: &PackState,
    event: HardwareEvent,
    led: &mut dyn LedSink,
) -> Option<Vec<u8>> {
    match event {
        HardwareEvent::Button { slot, pressed } => {
            let assignment = state.slot(slot as usize)?;
            let talking = state.is_keyed(assignment.channel);
            let on = talk_transition(assignment.mode, talking, pressed)?;
            state.set_keyed(assignment.channel, on);
            refresh_leds(state, led);
            Some(encode_line(
                &ClientVerb::ToggleTalk { channel: assignment.channel, on }.encode(),
            ))
        }
        HardwareEvent::Encoder { slot, delta } => {
            state.nudge_volume(slot as usize, delta);
            None
        }
        HardwareEvent::Brightness(pct) => {
            if matches!(pct, 25 | 50 | 75 | 100) {
                state.brightness.store(pct, Ordering::Relaxed);
                refresh_leds(state, led);
            }
            None
        }
    }
}

/// Recompute all four slot LEDs from the current state.
pub fn refresh_leds(state: &PackState, led: &mut dyn LedSink) {
    let brightness = state.brightness.load(Ordering::Relaxed);
    for (index, slot) in state.slots().iter().enumerate() {
        let (assigned, talking) = match slot {
            Some(slot) => (true, state.is_keyed(slot.channel)),
            None => (false, false),
        };
        let color = led_color(assigned, talking);
        led.set_slot(index as u8, scaled_rgb(color, brightness));
    }
}
