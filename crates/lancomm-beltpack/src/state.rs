use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use lancomm_audio::{Frame, JitterQueue};
use lancomm_protocol::frame::UpstreamFrame;
use lancomm_protocol::types::{ButtonMode, ChannelId, SessionConfig, MAX_USER_CHANNELS};

/// Sidetone injection level for the local mic path.
pub const SIDETONE_LEVEL: f32 = 0.18;

/// One button slot as configured by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAssignment {
    pub channel: ChannelId,
    /// Channel display name, for the (out-of-scope) display layer.
    #[allow(dead_code)]
    pub name: String,
    pub mode: ButtonMode,
}

/// Shared beltpack state, touched by the control task and the audio
/// threads. Every lock here is held only across constant-time work.
pub struct PackState {
    /// Server-assigned id; zero until the first successful handshake.
    pub user_id: AtomicU32,
    /// False during (re)connect: capture is paused, playback drains.
    pub connected: AtomicBool,
    /// Rolling upstream sequence; low 16 bits go on the wire.
    sequence: AtomicU32,
    /// Global LED brightness in percent: 25/50/75/100.
    pub brightness: AtomicU8,
    /// Where upstream audio goes; refreshed on every (re)connect.
    pub server_addr: Mutex<Option<SocketAddr>>,
    /// Slot table from the last CONFIG/UPDATE_CONFIG.
    slots: Mutex<[Option<SlotAssignment>; MAX_USER_CHANNELS]>,
    /// Channels currently keyed.
    keyed: Mutex<HashSet<ChannelId>>,
    /// Per-channel downstream jitter queues (drop-new on overflow).
    pub queues: Mutex<HashMap<ChannelId, JitterQueue>>,
    /// Per-slot volumes in [0, 1], f32 bit patterns (encoder-driven).
    volumes: [AtomicU32; MAX_USER_CHANNELS],
    /// Last captured mic frame, for sidetone.
    pub last_mic: Mutex<Frame>,
}

impl PackState {
    pub fn new() -> Self {
        Self {
            user_id: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            sequence: AtomicU32::new(0),
            brightness: AtomicU8::new(100),
            server_addr: Mutex::new(None),
            slots: Mutex::new(std::array::from_fn(|_| None)),
            keyed: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashMap::new()),
            volumes: std::array::from_fn(|_| AtomicU32::new(1.0f32.to_bits())),
            last_mic: Mutex::new(Frame::silence()),
        }
    }

    fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a server-sent configuration: rebuild the slot table and
    /// drop keyed state and queues for channels that went away.
    pub fn apply_config(&self, config: &SessionConfig) {
        let mut slots = Self::lock(&self.slots);
        *slots = std::array::from_fn(|_| None);
        for (&slot, &channel) in &config.slots {
            if (slot as usize) < MAX_USER_CHANNELS {
                slots[slot as usize] = Some(SlotAssignment {
                    channel,
                    name: config
                        .channels
                        .get(&channel)
                        .cloned()
                        .unwrap_or_default(),
                    mode: config.mode_for_slot(slot),
                });
            }
        }
        let live: HashSet<ChannelId> =
            slots.iter().flatten().map(|s| s.channel).collect();
        drop(slots);

        Self::lock(&self.keyed).retain(|ch| live.contains(ch));
        Self::lock(&self.queues).retain(|ch, _| live.contains(ch));
    }

    pub fn slot(&self, slot: usize) -> Option<SlotAssignment> {
        Self::lock(&self.slots).get(slot).and_then(|s| s.clone())
    }

    pub fn slots(&self) -> [Option<SlotAssignment>; MAX_USER_CHANNELS] {
        Self::lock(&self.slots).clone()
    }

    pub fn set_keyed(&self, channel: ChannelId, on: bool) {
        let mut keyed = Self::lock(&self.keyed);
        if on {
            keyed.insert(channel);
        } else {
            keyed.remove(&channel);
        }
    }

    pub fn is_keyed(&self, channel: ChannelId) -> bool {
        Self::lock(&self.keyed).contains(&channel)
    }

    pub fn keyed_channels(&self) -> Vec<ChannelId> {
        Self::lock(&self.keyed).iter().copied().collect()
    }

    pub fn clear_keyed(&self) {
        Self::lock(&self.keyed).clear();
    }

    pub fn volume(&self, slot: usize) -> f32 {
        self.volumes
            .get(slot)
            .map(|v| f32::from_bits(v.load(Ordering::Relaxed)))
            .unwrap_or(1.0)
    }

    /// Encoder delta applied to a slot volume, clamped to [0, 1].
    pub fn nudge_volume(&self, slot: usize, delta: f32) {
        if let Some(v) = self.volumes.get(slot) {
            let current = f32::from_bits(v.load(Ordering::Relaxed));
            v.store((current + delta).clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        }
    }

    /// Build one upstream datagram per keyed channel for a captured
    /// frame. The sequence advances once per datagram sent.
    pub fn upstream_datagrams(&self, frame: &Frame) -> Vec<Vec<u8>> {
        let user_id = self.user_id.load(Ordering::Relaxed);
        let mut keyed = self.keyed_channels();
        keyed.sort_unstable();
        keyed
            .into_iter()
            .map(|channel| {
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
                UpstreamFrame {
                    channel_id: channel,
                    user_id,
                    sequence,
                    pcm: frame.to_vec(),
                }
                .to_bytes()
            })
            .collect()
    }
}

impl Default for PackState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(slots: &[(u8, ChannelId)]) -> SessionConfig {
        let mut cfg = SessionConfig::default();
        for &(slot, channel) in slots {
            cfg.slots.insert(slot, channel);
            cfg.channels.insert(channel, format!("Ch {channel}"));
            cfg.button_modes.insert(slot, "latch".into());
        }
        cfg
    }

    #[test]
    fn apply_config_builds_slot_table() {
        let state = PackState::new();
        state.apply_config(&config(&[(0, 2), (2, 5)]));
        assert_eq!(state.slot(0).unwrap().channel, 2);
        assert_eq!(state.slot(0).unwrap().mode, ButtonMode::Latch);
        assert!(state.slot(1).is_none());
        assert_eq!(state.slot(2).unwrap().channel, 5);
    }

    #[test]
    fn apply_config_prunes_stale_state() {
        let state = PackState::new();
        state.apply_config(&config(&[(0, 2), (1, 3)]));
        state.set_keyed(2, true);
        state.set_keyed(3, true);
        state.queues.lock().unwrap().insert(3, JitterQueue::new());

        // Channel 3 disappears from the profile.
        state.apply_config(&config(&[(0, 2)]));
        assert!(state.is_keyed(2));
        assert!(!state.is_keyed(3));
        assert!(!state.queues.lock().unwrap().contains_key(&3));
    }

    #[test]
    fn volume_nudges_clamp() {
        let state = PackState::new();
        assert_eq!(state.volume(1), 1.0);
        state.nudge_volume(1, 0.5);
        assert_eq!(state.volume(1), 1.0);
        state.nudge_volume(1, -0.3);
        assert!((state.volume(1) - 0.7).abs() < 1e-6);
        state.nudge_volume(1, -2.0);
        assert_eq!(state.volume(1), 0.0);
        assert_eq!(state.volume(9), 1.0);
    }

    #[test]
    fn upstream_fans_out_per_keyed_channel() {
        let state = PackState::new();
        state.user_id.store(7, Ordering::Relaxed);
        state.set_keyed(2, true);
        state.set_keyed(5, true);

        let frame = Frame::constant(1000);
        let datagrams = state.upstream_datagrams(&frame);
        assert_eq!(datagrams.len(), 2);

        let decoded: Vec<UpstreamFrame> = datagrams
            .iter()
            .map(|d| UpstreamFrame::from_bytes(d).unwrap())
            .collect();
        let channels: BTreeMap<ChannelId, u32> =
            decoded.iter().map(|f| (f.channel_id, f.sequence)).collect();
        assert!(channels.contains_key(&2));
        assert!(channels.contains_key(&5));
        for frame_out in &decoded {
            assert_eq!(frame_out.user_id, 7);
            assert!(frame_out.pcm.iter().all(|&s| s == 1000));
        }
        // One sequence step per datagram.
        let seqs: Vec<u32> = decoded.iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);

        // Nothing keyed, nothing sent.
        state.clear_keyed();
        assert!(state.upstream_datagrams(&frame).is_empty());
    }

    #[test]
    fn sequence_wraps_at_16_bits() {
        let state = PackState::new();
        state.set_keyed(0, true);
        state.sequence.store(0xFFFF, Ordering::Relaxed);
        let dg = state.upstream_datagrams(&Frame::silence());
        assert_eq!(UpstreamFrame::from_bytes(&dg[0]).unwrap().sequence, 0xFFFF);
        let dg = state.upstream_datagrams(&Frame::silence());
        assert_eq!(UpstreamFrame::from_bytes(&dg[0]).unwrap().sequence, 0);
    }
}
