//! The 20 ms mixer tick: per enabled channel, consume one frame per
//! keyed talker, compute each listener's mix-minus, and emit downstream
//! datagrams. Mixing happens under the audio lock; socket sends happen
//! after it is released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use lancomm_audio::{mixer, Frame};
use lancomm_protocol::frame::DownstreamFrame;
use lancomm_protocol::types::{ChannelId, UserId, FRAME_MILLIS};

use crate::state::{AudioInner, ServerState};
use crate::store::FabricConfig;

pub const TICK: Duration = Duration::from_millis(FRAME_MILLIS);

/// Sessions silent past this are reaped.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Channels without upstream traffic past this lose their queues.
pub const CHANNEL_IDLE: Duration = Duration::from_secs(60);

pub const CLEANUP_PERIOD: Duration = Duration::from_secs(30);

/// Everything one tick produces: datagrams to send once the lock is
/// released, and the per-channel pre-gain RMS levels.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub datagrams: Vec<(SocketAddr, Vec<u8>)>,
    pub levels: Vec<(ChannelId, f32)>,
}

/// Run one mixer tick over the audio plane.
///
/// `addrs` maps user ids to their cached UDP return addresses, collected
/// from the registry before the audio lock is taken. Listeners without
/// an entry are skipped silently until they announce one.
pub fn run_tick(
    inner: &mut AudioInner,
    cfg: &FabricConfig,
    addrs: &HashMap<UserId, SocketAddr>,
) -> TickOutput {
    let mut out = TickOutput::default();

    for channel in cfg.enabled_channels() {
        let talkers: Vec<UserId> = inner
            .talkers
            .get(&channel)
            .map(|t| {
                let mut v: Vec<UserId> = t.iter().copied().collect();
                v.sort_unstable();
                v
            })
            .unwrap_or_default();
        let listeners: Vec<UserId> = inner
            .listeners
            .get(&channel)
            .map(|l| l.iter().copied().collect())
            .unwrap_or_default();

        if talkers.is_empty() || listeners.is_empty() {
            // Keep queues from growing while the channel is quiet.
            for ((ch, _), queue) in inner.buffers.iter_mut() {
                if *ch == channel && !queue.is_empty() {
                    queue.pop();
                }
            }
            out.levels.push((channel, 0.0));
            continue;
        }

        // One frame per talker; silence stands in on underrun.
        let mut frames: HashMap<UserId, Frame> = HashMap::with_capacity(talkers.len());
        for &talker in &talkers {
            let frame = inner
                .buffers
                .get_mut(&(channel, talker))
                .and_then(|q| q.pop())
                .unwrap_or_else(Frame::silence);
            frames.insert(talker, frame);
        }

        let refs: Vec<&Frame> = talkers.iter().map(|t| &frames[t]).collect();
        let sum = mixer::sum_frames(&refs);
        let full_mix = mixer::average(&sum, talkers.len());
        out.levels.push((channel, full_mix.rms()));

        let gain = cfg.gain(channel as i32);
        for &listener in &listeners {
            let own = frames.get(&listener);
            let Some(mix) = mixer::mix_minus(&sum, own, talkers.len(), gain) else {
                // The only talker is the listener; nothing to send.
                continue;
            };
            let Some(&addr) = addrs.get(&listener) else {
                continue;
            };
            let datagram = DownstreamFrame { channel_id: channel, pcm: mix.to_vec() };
            out.datagrams.push((addr, datagram.to_bytes()));
        }
    }

    out
}

/// Drive [`run_tick`] on a fixed 20 ms cadence. Missed deadlines drop
/// the tick rather than catching up.
pub async fn run_mixer_loop(socket: Arc<UdpSocket>, state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("mixer tick running at {}ms", FRAME_MILLIS);

    loop {
        interval.tick().await;

        let cfg = state.config.snapshot();
        let addrs = state.registry.udp_returns();
        let output = {
            let mut inner = state.audio.lock();
            run_tick(&mut inner, &cfg, &addrs)
        };

        for (channel, rms) in &output.levels {
            state.metering.set_level(*channel, *rms);
        }
        for (addr, datagram) in output.datagrams {
            if let Err(e) = socket.send_to(&datagram, addr).await {
                debug!(%addr, "downstream send failed: {}", e);
            }
        }
    }
}

/// Background reaper: stale sessions and idle channel buffers.
pub async fn run_cleanup_loop(state: Arc<ServerState>) {
    let mut interval = tokio::time::interval(CLEANUP_PERIOD);
    loop {
        interval.tick().await;

        for user_id in state.registry.idle_sessions(SESSION_TIMEOUT) {
            warn!(user_id, "dropping session idle for over {:?}", SESSION_TIMEOUT);
            state.registry.drop_session(user_id, &state.audio);
        }

        state.audio.lock().idle_cleanup(CHANNEL_IDLE);
    }
}
