//! Upstream UDP demux: parse, validate, and buffer incoming talker
//! frames, learning return addresses as a side effect.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

use lancomm_audio::Frame;
use lancomm_protocol::frame::{UpstreamFrame, HEADER_SIZE};
use lancomm_protocol::types::{MAX_CHANNELS, MAX_WIRE_USER_ID};

use crate::state::ServerState;

/// Upstream datagrams are a 12-byte header plus at most one full frame.
const MAX_UDP_PACKET_SIZE: usize = 2048;

/// Why a datagram was refused; surfaced in logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    TooShort,
    BadChannel,
    ChannelDisabled,
    BadUserId,
    NotTalker,
}

/// Validate one upstream datagram and, if it passes, append its PCM to
/// the sender's jitter queue and refresh the sender's return address.
///
/// The gate, in order: length, channel range, channel enabled, on-wire
/// user id range, sender currently keyed on the channel.
pub fn accept_frame(
    state: &ServerState,
    data: &[u8],
    src: SocketAddr,
) -> Result<(), Reject> {
    if data.len() < HEADER_SIZE {
        return Err(Reject::TooShort);
    }
    let frame = UpstreamFrame::from_bytes(data).map_err(|_| Reject::TooShort)?;

    if frame.channel_id >= MAX_CHANNELS {
        return Err(Reject::BadChannel);
    }
    if !state.config.channel_enabled(frame.channel_id) {
        return Err(Reject::ChannelDisabled);
    }
    if frame.user_id > MAX_WIRE_USER_ID {
        return Err(Reject::BadUserId);
    }

    let pcm = Frame::from_pcm(&frame.pcm);
    let sequence = frame.sequence as u16;
    {
        let mut audio = state.audio.lock();
        if !audio.is_talker(frame.channel_id, frame.user_id) {
            return Err(Reject::NotTalker);
        }
        let lost = audio.track_sequence(frame.channel_id, frame.user_id, sequence);
        if lost > 0 {
            debug!(
                channel = frame.channel_id,
                user_id = frame.user_id,
                lost,
                "upstream sequence gap"
            );
        }
        audio.push_frame(frame.channel_id, frame.user_id, pcm);
    }

    // Secondary learning path for clients that skipped SET_UDP.
    state.registry.learn_udp(frame.user_id, src);

    Ok(())
}

/// Run the upstream receive loop.
pub async fn run_udp_loop(socket: Arc<UdpSocket>, state: Arc<ServerState>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                error!("UDP recv error: {}", e);
                continue;
            }
        };

        if let Err(reject) = accept_frame(&state, &buf[..len], src_addr) {
            trace!(src = %src_addr, ?reject, "dropped upstream datagram");
        }
    }
}
