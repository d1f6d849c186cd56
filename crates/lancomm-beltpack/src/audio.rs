//! The beltpack audio plane: capture fan-out per keyed channel,
//! downstream demux into per-channel jitter queues, and the local 20 ms
//! playback mix with sidetone.
//!
//! All three loops run on plain threads because the device contract
//! blocks; they coordinate with the control task only through
//! [`PackState`].

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use lancomm_audio::device::{FrameSink, FrameSource};
use lancomm_audio::{mixer, Frame, JitterQueue};
use lancomm_protocol::frame::DownstreamFrame;
use lancomm_protocol::types::{FRAME_MILLIS, MAX_CHANNELS};

use crate::state::{PackState, SIDETONE_LEVEL};

pub const TICK: Duration = Duration::from_millis(FRAME_MILLIS);

/// Capture loop, paced by the blocking device read. The last mic frame
/// always feeds sidetone; datagrams go out only while connected and
/// keyed. One datagram per keyed channel, same PCM, advancing sequence.
pub fn run_capture_loop(
    state: Arc<PackState>,
    socket: UdpSocket,
    mut source: Box<dyn FrameSource>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("capture read failed: {e:#}");
                break;
            }
        };
        *state.last_mic.lock().unwrap_or_else(|e| e.into_inner()) = frame.clone();

        // Reconnect in progress: capture is paused.
        if !state.connected.load(Ordering::Relaxed) {
            continue;
        }
        let server = {
            let guard = state.server_addr.lock().unwrap_or_else(|e| e.into_inner());
            *guard
        };
        let Some(server) = server else { continue };

        for datagram in state.upstream_datagrams(&frame) {
            if let Err(e) = socket.send_to(&datagram, server) {
                debug!("upstream send failed: {}", e);
            }
        }
    }
}

/// Queue one downstream datagram. Frames for channels outside the
/// current profile are dropped; a full queue drops the new arrival.
pub fn handle_downstream(state: &PackState, data: &[u8]) -> bool {
    let Ok(frame) = DownstreamFrame::from_bytes(data) else {
        return false;
    };
    if frame.channel_id >= MAX_CHANNELS {
        return false;
    }
    let assigned = state
        .slots()
        .iter()
        .flatten()
        .any(|slot| slot.channel == frame.channel_id);
    if !assigned {
        return false;
    }

    let pcm = Frame::from_pcm(&frame.pcm);
    state
        .queues
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .entry(frame.channel_id)
        .or_insert_with(JitterQueue::new)
        .push(pcm)
}

/// Downstream receive loop over the shared UDP socket.
pub fn run_receive_loop(state: Arc<PackState>, socket: UdpSocket, stop: Arc<AtomicBool>) {
    if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(100))) {
        warn!("could not set receive timeout: {}", e);
    }
    let mut buf = [0u8; 2048];
    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _src)) => {
                handle_downstream(&state, &buf[..len]);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("downstream recv error: {}", e);
                break;
            }
        }
    }
}

/// One playback tick: head frame per assigned channel at its slot
/// volume, plus sidetone while keyed, clipped.
pub fn mix_playback(state: &PackState) -> Frame {
    let slots = state.slots();
    let mut inputs: Vec<(Frame, f32)> = Vec::new();
    {
        let mut queues = state.queues.lock().unwrap_or_else(|e| e.into_inner());
        for (index, slot) in slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if let Some(queue) = queues.get_mut(&slot.channel) {
                if let Some(frame) = queue.pop() {
                    inputs.push((frame, state.volume(index)));
                }
            }
        }
    }
    if !state.keyed_channels().is_empty() {
        let mic = state
            .last_mic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        inputs.push((mic, SIDETONE_LEVEL));
    }

    let refs: Vec<(&Frame, f32)> = inputs.iter().map(|(f, g)| (f, *g)).collect();
    mixer::mix_scaled(&refs)
}

/// Playback loop on a 20 ms deadline schedule; a missed deadline drops
/// the tick instead of catching up. Keeps draining queues during
/// reconnects so audio in flight still plays out.
pub fn run_playback_loop(
    state: Arc<PackState>,
    mut sink: Box<dyn FrameSink>,
    stop: Arc<AtomicBool>,
) {
    let mut next = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        next += TICK;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }

        let frame = mix_playback(&state);
        if let Err(e) = sink.write_frame(&frame) {
            warn!("playback write failed: {e:#}");
            break;
        }
    }
}
