//! 4-wire bridges: two virtual participants, each binding a local audio
//! input/output device pair to one channel as both talker and listener.
//!
//! Each enabled bridge gets a dedicated worker thread because the device
//! contract blocks; the blocking input read paces the loop at the frame
//! cadence. Virtual participant ids live at the top of the u32 space and
//! never appear on the wire (ingress rejects anything above 10 000 long
//! before these).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use lancomm_audio::device::{FrameSink, FrameSource};
use lancomm_audio::{capture, mixer, playback, Frame};
use lancomm_protocol::types::UserId;

use crate::state::ServerState;
use crate::store::FourWireSettings;

/// Internal-only id space for bridge participants: `BASE - index`.
pub const FOURWIRE_USER_BASE: UserId = 0xFFFF_FFFE;

pub fn virtual_user_id(index: usize) -> UserId {
    FOURWIRE_USER_BASE - index as UserId
}

struct Bridge {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// Owns the two bridge workers and restarts them on settings changes.
pub struct FourWireManager {
    state: Arc<ServerState>,
    bridges: Mutex<[Option<Bridge>; 2]>,
}

impl FourWireManager {
    pub fn new(state: Arc<ServerState>) -> Arc<Self> {
        Arc::new(Self { state, bridges: Mutex::new([None, None]) })
    }

    /// Reconcile one bridge with its current settings: any change fully
    /// stops the worker, then starts a fresh one if still enabled.
    pub fn apply(&self, index: usize) {
        let Some(settings) = self.state.config.fourwire_settings(index) else {
            return;
        };
        let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bridge) = bridges[index].take() {
            bridge.stop.store(true, Ordering::Relaxed);
            let _ = bridge.handle.join();
        }
        if settings.enabled {
            bridges[index] = Some(start_bridge(self.state.clone(), index, settings));
        }
    }

    pub fn apply_all(&self) {
        for index in 0..2 {
            self.apply(index);
        }
    }

    pub fn stop_all(&self) {
        let mut bridges = self.bridges.lock().unwrap_or_else(|e| e.into_inner());
        for bridge in bridges.iter_mut().filter_map(Option::take) {
            bridge.stop.store(true, Ordering::Relaxed);
            let _ = bridge.handle.join();
        }
    }
}

fn start_bridge(state: Arc<ServerState>, index: usize, settings: FourWireSettings) -> Bridge {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let handle = std::thread::Builder::new()
        .name(format!("fourwire-{index}"))
        .spawn(move || {
            // Devices are opened on the worker thread; cpal streams stay here.
            let source = capture::open_frame_source(settings.input_device);
            let sink = playback::open_frame_sink(settings.output_device);
            match (source, sink) {
                (Ok(source), Ok(sink)) => {
                    info!(index, channel = settings.channel, "4-wire bridge up");
                    state.metering.set_fourwire_fault(index, false);
                    run_worker(
                        &state,
                        index,
                        settings,
                        Box::new(source),
                        Box::new(sink),
                        &worker_stop,
                    );
                }
                (source, sink) => {
                    if let Err(e) = &source {
                        error!(index, "4-wire input open failed: {e:#}");
                    }
                    if let Err(e) = &sink {
                        error!(index, "4-wire output open failed: {e:#}");
                    }
                    state.metering.set_fourwire_fault(index, true);
                    state.config.clear_fourwire_enabled(index);
                }
            }
        })
        .expect("failed to spawn 4-wire worker");
    Bridge { stop, handle }
}

/// The bridge loop, paced by the blocking input read: inject the input
/// frame as a talker, tap the mix-minus of every other sender's head
/// frame, and write it out.
pub(crate) fn run_worker(
    state: &ServerState,
    index: usize,
    settings: FourWireSettings,
    mut source: Box<dyn FrameSource>,
    mut sink: Box<dyn FrameSink>,
    stop: &AtomicBool,
) {
    let channel = settings.channel;
    let vid = virtual_user_id(index);

    while !stop.load(Ordering::Relaxed) {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(index, "4-wire input read failed: {e:#}");
                state.metering.set_fourwire_fault(index, true);
                break;
            }
        };
        let inbound = frame.scaled(settings.input_gain);

        let heads: Vec<Frame> = {
            let mut audio = state.audio.lock();
            if !audio.is_talker(channel, vid) {
                audio.rebind_user(vid, &[channel]);
                audio.set_talk(channel, vid, true);
            }
            audio.push_frame(channel, vid, inbound);

            let talkers: Vec<UserId> = audio
                .talkers
                .get(&channel)
                .map(|t| t.iter().copied().filter(|&u| u != vid).collect())
                .unwrap_or_default();
            talkers
                .iter()
                .filter_map(|&u| audio.buffers.get(&(channel, u)))
                .filter_map(|q| q.peek().cloned())
                .collect()
        };

        let gain = settings.output_gain * state.config.channel_gain(channel as i32);
        let out = mix_heads(&heads, gain);
        if let Err(e) = sink.write_frame(&out) {
            warn!(index, "4-wire output write failed: {e:#}");
            state.metering.set_fourwire_fault(index, true);
            break;
        }
    }

    // Teardown drains both directions and removes the virtual participant.
    state.audio.lock().drop_user(vid);
    info!(index, "4-wire bridge stopped");
}

/// Average the head frames (divide only past one source) and scale.
fn mix_heads(heads: &[Frame], gain: f32) -> Frame {
    if heads.is_empty() {
        return Frame::silence();
    }
    let refs: Vec<&Frame> = heads.iter().collect();
    let sum = mixer::sum_frames(&refs);
    mixer::average(&sum, heads.len()).scaled(gain)
}
