use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique user identifier assigned by the server at accept time.
/// Monotonically increasing, never reused for the server's lifetime.
pub type UserId = u32;

/// Channel identifier. Real channels occupy `[0, MAX_CHANNELS)`.
pub type ChannelId = u32;

/// Number of talk-group channels the fabric carries.
pub const MAX_CHANNELS: u32 = 10;

/// Slots on a beltpack profile (one per physical button).
pub const MAX_USER_CHANNELS: usize = 4;

/// Maximum concurrently bound sessions across the fleet.
pub const MAX_USERS: usize = 20;

/// Reserved pseudo-channel for the external program feed. Config-level
/// only; it never appears in any datagram or membership set.
pub const PROGRAM_CHANNEL: i32 = -1;

/// Audio format: 48 kHz mono, 16-bit LE, 20 ms frames.
pub const SAMPLE_RATE: u32 = 48_000;
pub const FRAME_MILLIS: u64 = 20;
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// TCP control and UDP audio share this port.
pub const DEFAULT_PORT: u16 = 6001;

/// mDNS service type the server advertises.
pub const SERVICE_TYPE: &str = "_lancomm._tcp.local.";

/// Largest on-wire user id ingress will accept. The internal 4-wire id
/// space lives far above this, so the two can never collide.
pub const MAX_WIRE_USER_ID: u32 = 10_000;

/// Per-slot talk button behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonMode {
    /// Press toggles the talk state.
    Latch,
    /// Press enters talk; release exits.
    Momentary,
}

impl ButtonMode {
    /// Name used in CONFIG/UPDATE_CONFIG payloads ("latch" / "non-latch").
    pub fn wire_name(self) -> &'static str {
        match self {
            ButtonMode::Latch => "latch",
            ButtonMode::Momentary => "non-latch",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "latch" => Some(ButtonMode::Latch),
            "non-latch" => Some(ButtonMode::Momentary),
            _ => None,
        }
    }
}

impl Default for ButtonMode {
    fn default() -> Self {
        ButtonMode::Momentary
    }
}

/// A beltpack user profile: up to four slot assignments plus per-slot
/// button modes. The profile is the unit a beltpack binds to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Slot → channel, `None` for an empty slot.
    pub channels: [Option<ChannelId>; MAX_USER_CHANNELS],
    /// Slot → button behavior.
    #[serde(default)]
    pub button_modes: BTreeMap<u8, ButtonMode>,
}

impl UserProfile {
    pub fn empty() -> Self {
        Self {
            channels: [None; MAX_USER_CHANNELS],
            button_modes: BTreeMap::new(),
        }
    }

    /// Channels assigned to any slot, in slot order.
    pub fn assigned_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().filter_map(|c| *c)
    }

    pub fn mode_for_slot(&self, slot: u8) -> ButtonMode {
        self.button_modes.get(&slot).copied().unwrap_or_default()
    }

    /// True if some channel id occupies two slots.
    pub fn has_duplicate_channel(&self) -> bool {
        for (i, a) in self.channels.iter().enumerate() {
            let Some(a) = a else { continue };
            if self.channels[i + 1..].iter().any(|b| b.as_ref() == Some(a)) {
                return true;
            }
        }
        false
    }
}

/// Payload of `CONFIG:` and `UPDATE_CONFIG:`, the bound profile as the
/// beltpack needs it. Only enabled channels appear. `slots` carries the
/// slot → channel mapping explicitly (JSON objects are unordered, so the
/// channel map alone cannot convey button positions).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Channel id → display name.
    pub channels: BTreeMap<ChannelId, String>,
    /// Slot → channel id, empty and disabled slots omitted.
    pub slots: BTreeMap<u8, ChannelId>,
    /// Slot → "latch" | "non-latch".
    pub button_modes: BTreeMap<u8, String>,
}

impl SessionConfig {
    pub fn to_json(&self) -> String {
        // Maps of primitives cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn mode_for_slot(&self, slot: u8) -> ButtonMode {
        self.button_modes
            .get(&slot)
            .and_then(|s| ButtonMode::from_wire(s))
            .unwrap_or_default()
    }
}
