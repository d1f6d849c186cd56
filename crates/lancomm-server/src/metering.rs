use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lancomm_protocol::types::{ChannelId, MAX_CHANNELS};

/// Per-channel RMS gauges plus 4-wire fault flags.
///
/// Written by the mixer tick and the bridge workers, sampled by an
/// operator surface at display cadence (peak-hold decay is the reader's
/// business). Levels are f32 bit patterns in atomics so readers never
/// take a lock.
pub struct Metering {
    levels: [AtomicU32; MAX_CHANNELS as usize],
    fourwire_fault: [AtomicBool; 2],
}

impl Metering {
    pub fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| AtomicU32::new(0f32.to_bits())),
            fourwire_fault: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    /// Publish the pre-gain RMS of a channel's full mix for this tick.
    pub fn set_level(&self, channel: ChannelId, rms: f32) {
        if let Some(slot) = self.levels.get(channel as usize) {
            slot.store(rms.to_bits(), Ordering::Relaxed);
        }
    }

    #[allow(dead_code)]
    pub fn level(&self, channel: ChannelId) -> f32 {
        self.levels
            .get(channel as usize)
            .map(|slot| f32::from_bits(slot.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    #[allow(dead_code)]
    pub fn levels(&self) -> [f32; MAX_CHANNELS as usize] {
        std::array::from_fn(|i| f32::from_bits(self.levels[i].load(Ordering::Relaxed)))
    }

    /// Raised when a bridge fails to open its devices, cleared on stop/start.
    pub fn set_fourwire_fault(&self, index: usize, faulted: bool) {
        if let Some(flag) = self.fourwire_fault.get(index) {
            flag.store(faulted, Ordering::Relaxed);
        }
    }

    #[allow(dead_code)]
    pub fn fourwire_fault(&self, index: usize) -> bool {
        self.fourwire_fault
            .get(index)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl Default for Metering {
    fn default() -> Self {
        Self::new()
    }
}
