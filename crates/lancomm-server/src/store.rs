//! The fabric configuration store: users, channels, enable bits, volumes,
//! 4-wire settings. One process-wide record behind a mutex; the operator
//! surface writes, the protocol endpoint and mixer read snapshots.
//!
//! Observers are invoked synchronously under the lock and must neither
//! block nor call back into the store (the mutex is not reentrant).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use lancomm_protocol::types::{
    ChannelId, SessionConfig, UserProfile, MAX_CHANNELS, MAX_USER_CHANNELS, PROGRAM_CHANNEL,
};

/// Display names are at most this many bytes after trimming.
pub const MAX_CHANNEL_NAME_BYTES: usize = 12;

/// Everything the fabric persists, in the on-disk JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub users: BTreeMap<String, UserProfile>,
    #[serde(default = "default_channel_names")]
    pub channels: BTreeMap<ChannelId, String>,
    #[serde(default = "default_channel_volumes")]
    pub channel_volumes: BTreeMap<i32, f32>,
    #[serde(default = "default_channel_enabled")]
    pub channel_enabled: BTreeMap<ChannelId, bool>,
    #[serde(default = "default_active_count")]
    pub active_channel_count: u32,
    #[serde(default)]
    pub program_audio_device: Option<usize>,
    #[serde(default)]
    pub program_audio_channel: u32,
    #[serde(default)]
    pub device_names: BTreeMap<String, String>,
    #[serde(default)]
    pub fourwire_enabled: [bool; 2],
    #[serde(default)]
    pub fourwire_input_device: [Option<usize>; 2],
    #[serde(default)]
    pub fourwire_output_device: [Option<usize>; 2],
    #[serde(default)]
    pub fourwire_channel: [ChannelId; 2],
    #[serde(default = "default_gains")]
    pub fourwire_input_gain: [f32; 2],
    #[serde(default = "default_gains")]
    pub fourwire_output_gain: [f32; 2],
}

fn default_channel_names() -> BTreeMap<ChannelId, String> {
    (0..MAX_CHANNELS).map(|id| (id, format!("Ch {}", id + 1))).collect()
}

fn default_channel_volumes() -> BTreeMap<i32, f32> {
    let mut volumes: BTreeMap<i32, f32> = (0..MAX_CHANNELS as i32).map(|id| (id, 1.0)).collect();
    volumes.insert(PROGRAM_CHANNEL, 1.0);
    volumes
}

fn default_channel_enabled() -> BTreeMap<ChannelId, bool> {
    (0..MAX_CHANNELS).map(|id| (id, id < default_active_count())).collect()
}

fn default_active_count() -> u32 {
    4
}

fn default_gains() -> [f32; 2] {
    [1.0, 1.0]
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            channels: default_channel_names(),
            channel_volumes: default_channel_volumes(),
            channel_enabled: default_channel_enabled(),
            active_channel_count: default_active_count(),
            program_audio_device: None,
            program_audio_channel: 0,
            device_names: BTreeMap::new(),
            fourwire_enabled: [false; 2],
            fourwire_input_device: [None; 2],
            fourwire_output_device: [None; 2],
            fourwire_channel: [0; 2],
            fourwire_input_gain: default_gains(),
            fourwire_output_gain: default_gains(),
        }
    }
}

impl FabricConfig {
    pub fn is_enabled(&self, channel: ChannelId) -> bool {
        self.channel_enabled.get(&channel).copied().unwrap_or(false)
    }

    /// Linear gain for a channel; the program pseudo-channel is addressed
    /// as [`PROGRAM_CHANNEL`].
    pub fn gain(&self, channel: i32) -> f32 {
        self.channel_volumes.get(&channel).copied().unwrap_or(1.0)
    }

    pub fn enabled_channels(&self) -> Vec<ChannelId> {
        (0..MAX_CHANNELS).filter(|&id| self.is_enabled(id)).collect()
    }

    pub fn user_names(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    /// Channels a profile subscribes to: assigned slots minus disabled
    /// channels, in slot order.
    pub fn subscriptions(&self, profile: &UserProfile) -> Vec<ChannelId> {
        profile
            .assigned_channels()
            .filter(|&ch| self.is_enabled(ch))
            .collect()
    }

    /// Build the CONFIG/UPDATE_CONFIG payload for a profile. Only enabled
    /// channels are included.
    pub fn session_config(&self, profile: &UserProfile) -> SessionConfig {
        let mut out = SessionConfig::default();
        for (slot, assigned) in profile.channels.iter().enumerate() {
            let Some(channel) = assigned else { continue };
            if !self.is_enabled(*channel) {
                continue;
            }
            let name = self
                .channels
                .get(channel)
                .cloned()
                .unwrap_or_else(|| format!("Ch {}", channel + 1));
            out.channels.insert(*channel, name);
            out.slots.insert(slot as u8, *channel);
            out.button_modes
                .insert(slot as u8, profile.mode_for_slot(slot as u8).wire_name().into());
        }
        out
    }

    fn validate(&self) -> Result<()> {
        if !self.channel_enabled.values().any(|&on| on) {
            bail!("at least one channel must stay enabled");
        }
        for &id in self.channels.keys().chain(self.channel_enabled.keys()) {
            if id >= MAX_CHANNELS {
                bail!("channel id {id} out of range");
            }
        }
        for &id in self.channel_volumes.keys() {
            if id >= MAX_CHANNELS as i32 || id < PROGRAM_CHANNEL {
                bail!("volume entry for unknown channel {id}");
            }
        }
        for &ch in &self.fourwire_channel {
            if ch >= MAX_CHANNELS {
                bail!("4-wire channel {ch} out of range");
            }
        }
        for (name, profile) in &self.users {
            validate_profile_name(name)?;
            if profile.has_duplicate_channel() {
                bail!("profile {name:?} assigns the same channel to two slots");
            }
            for ch in profile.assigned_channels() {
                if ch >= MAX_CHANNELS {
                    bail!("profile {name:?} references channel {ch} out of range");
                }
            }
        }
        Ok(())
    }
}

fn validate_profile_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().count() > 32 {
        bail!("profile name must be 1-32 characters");
    }
    if name.chars().any(|c| c.is_control() || c == ',' || c == ':') {
        bail!("profile name contains reserved characters");
    }
    Ok(())
}

/// Settings for one 4-wire interface, applied as a unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FourWireSettings {
    pub enabled: bool,
    pub channel: ChannelId,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub input_gain: f32,
    pub output_gain: f32,
}

/// Observer categories. Callbacks run under the store lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    UsersChanged,
    ChannelsChanged,
    FourWireChanged,
}

type Observer = Box<dyn Fn(&FabricConfig) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    config: FabricConfig,
    users_observers: Vec<Observer>,
    channels_observers: Vec<Observer>,
    fourwire_observers: Vec<Observer>,
}

impl StoreInner {
    fn notify(&self, event: ConfigEvent) {
        let observers = match event {
            ConfigEvent::UsersChanged => &self.users_observers,
            ConfigEvent::ChannelsChanged => &self.channels_observers,
            ConfigEvent::FourWireChanged => &self.fourwire_observers,
        };
        for observer in observers {
            observer(&self.config);
        }
    }
}

/// The process-wide configuration store.
pub struct ConfigStore {
    inner: Mutex<StoreInner>,
}

impl ConfigStore {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner { config, ..Default::default() }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned config lock means a panicked observer; the data
        // itself is still consistent (mutators validate before writing).
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Immutable view for the mixer and protocol endpoint.
    pub fn snapshot(&self) -> FabricConfig {
        self.lock().config.clone()
    }

    /// Enabled check for the ingress hot path (no snapshot clone).
    pub fn channel_enabled(&self, channel: ChannelId) -> bool {
        self.lock().config.is_enabled(channel)
    }

    /// Gain lookup for the bridge workers (no snapshot clone).
    pub fn channel_gain(&self, channel: i32) -> f32 {
        self.lock().config.gain(channel)
    }

    /// Register a callback for a category. It runs synchronously under
    /// the lock on every matching write; it must not block or re-enter.
    pub fn observe(&self, event: ConfigEvent, observer: Observer) {
        let mut inner = self.lock();
        match event {
            ConfigEvent::UsersChanged => inner.users_observers.push(observer),
            ConfigEvent::ChannelsChanged => inner.channels_observers.push(observer),
            ConfigEvent::FourWireChanged => inner.fourwire_observers.push(observer),
        }
    }

    #[allow(dead_code)]
    pub fn set_channel_name(&self, channel: ChannelId, name: &str) -> Result<()> {
        if channel >= MAX_CHANNELS {
            bail!("channel id {channel} out of range");
        }
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME_BYTES {
            bail!("channel name must be 1-{MAX_CHANNEL_NAME_BYTES} bytes");
        }
        let mut inner = self.lock();
        inner.config.channels.insert(channel, name.to_string());
        inner.notify(ConfigEvent::ChannelsChanged);
        Ok(())
    }

    #[allow(dead_code)]
    pub fn set_channel_volume(&self, channel: i32, volume: f32) -> Result<()> {
        if channel >= MAX_CHANNELS as i32 || channel < PROGRAM_CHANNEL {
            bail!("channel id {channel} out of range");
        }
        if !(0.0..=1.0).contains(&volume) {
            bail!("volume {volume} outside [0, 1]");
        }
        let mut inner = self.lock();
        inner.config.channel_volumes.insert(channel, volume);
        inner.notify(ConfigEvent::ChannelsChanged);
        Ok(())
    }

    /// Enable or disable a channel. Disabling the last enabled channel is
    /// refused so the fabric always carries at least one talk-group.
    #[allow(dead_code)]
    pub fn set_channel_enabled(&self, channel: ChannelId, enabled: bool) -> Result<()> {
        if channel >= MAX_CHANNELS {
            bail!("channel id {channel} out of range");
        }
        let mut inner = self.lock();
        if !enabled {
            let others_enabled = inner
                .config
                .channel_enabled
                .iter()
                .any(|(&id, &on)| on && id != channel);
            if !others_enabled {
                bail!("cannot disable the last enabled channel");
            }
        }
        inner.config.channel_enabled.insert(channel, enabled);
        inner.config.active_channel_count =
            inner.config.channel_enabled.values().filter(|&&on| on).count() as u32;
        inner.notify(ConfigEvent::ChannelsChanged);
        Ok(())
    }

    /// Create or replace a whole profile.
    #[allow(dead_code)]
    pub fn set_user(&self, name: &str, profile: UserProfile) -> Result<()> {
        validate_profile_name(name)?;
        if profile.has_duplicate_channel() {
            bail!("profile assigns the same channel to two slots");
        }
        for ch in profile.assigned_channels() {
            if ch >= MAX_CHANNELS {
                bail!("channel id {ch} out of range");
            }
        }
        let mut inner = self.lock();
        inner.config.users.insert(name.to_string(), profile);
        inner.notify(ConfigEvent::UsersChanged);
        Ok(())
    }

    /// Assign one slot of a profile. If the channel already occupies
    /// another slot, the two slots swap contents, preserving the
    /// no-duplicate invariant without rejecting the edit.
    #[allow(dead_code)]
    pub fn set_user_slot(
        &self,
        name: &str,
        slot: usize,
        channel: Option<ChannelId>,
    ) -> Result<()> {
        if slot >= MAX_USER_CHANNELS {
            bail!("slot {slot} out of range");
        }
        if let Some(ch) = channel {
            if ch >= MAX_CHANNELS {
                bail!("channel id {ch} out of range");
            }
        }
        let mut inner = self.lock();
        let profile = inner
            .config
            .users
            .get_mut(name)
            .with_context(|| format!("unknown profile {name:?}"))?;
        if let Some(ch) = channel {
            if let Some(other) = profile.channels.iter().position(|c| *c == Some(ch)) {
                if other != slot {
                    profile.channels[other] = profile.channels[slot];
                }
            }
        }
        profile.channels[slot] = channel;
        inner.notify(ConfigEvent::UsersChanged);
        Ok(())
    }

    #[allow(dead_code)]
    pub fn set_button_mode(
        &self,
        name: &str,
        slot: u8,
        mode: lancomm_protocol::types::ButtonMode,
    ) -> Result<()> {
        if slot as usize >= MAX_USER_CHANNELS {
            bail!("slot {slot} out of range");
        }
        let mut inner = self.lock();
        let profile = inner
            .config
            .users
            .get_mut(name)
            .with_context(|| format!("unknown profile {name:?}"))?;
        profile.button_modes.insert(slot, mode);
        inner.notify(ConfigEvent::UsersChanged);
        Ok(())
    }

    #[allow(dead_code)]
    pub fn delete_user(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.config.users.remove(name).is_none() {
            bail!("unknown profile {name:?}");
        }
        inner.notify(ConfigEvent::UsersChanged);
        Ok(())
    }

    #[allow(dead_code)]
    pub fn set_fourwire(&self, index: usize, settings: FourWireSettings) -> Result<()> {
        if index >= 2 {
            bail!("4-wire index {index} out of range");
        }
        if settings.channel >= MAX_CHANNELS {
            bail!("4-wire channel {} out of range", settings.channel);
        }
        if !settings.input_gain.is_finite() || !settings.output_gain.is_finite() {
            bail!("4-wire gain must be finite");
        }
        let mut inner = self.lock();
        let cfg = &mut inner.config;
        cfg.fourwire_enabled[index] = settings.enabled;
        cfg.fourwire_channel[index] = settings.channel;
        cfg.fourwire_input_device[index] = settings.input_device;
        cfg.fourwire_output_device[index] = settings.output_device;
        cfg.fourwire_input_gain[index] = settings.input_gain;
        cfg.fourwire_output_gain[index] = settings.output_gain;
        inner.notify(ConfigEvent::FourWireChanged);
        Ok(())
    }

    /// Clear a bridge's enabled bit without re-notifying the bridge
    /// manager (used when the worker itself fails to start).
    pub fn clear_fourwire_enabled(&self, index: usize) {
        if index < 2 {
            self.lock().config.fourwire_enabled[index] = false;
        }
    }

    #[allow(dead_code)]
    pub fn set_device_name(&self, ip: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.config.device_names.insert(ip.to_string(), name.to_string());
        Ok(())
    }

    pub fn fourwire_settings(&self, index: usize) -> Option<FourWireSettings> {
        if index >= 2 {
            return None;
        }
        let inner = self.lock();
        let cfg = &inner.config;
        Some(FourWireSettings {
            enabled: cfg.fourwire_enabled[index],
            channel: cfg.fourwire_channel[index],
            input_device: cfg.fourwire_input_device[index],
            output_device: cfg.fourwire_output_device[index],
            input_gain: cfg.fourwire_input_gain[index],
            output_gain: cfg.fourwire_output_gain[index],
        })
    }

    /// Replace the whole configuration from a JSON file. Invalid files
    /// leave the store untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: FabricConfig =
            serde_json::from_str(&content).context("failed to parse fabric config")?;
        config.validate()?;
        let mut inner = self.lock();
        inner.config = config;
        inner.notify(ConfigEvent::ChannelsChanged);
        inner.notify(ConfigEvent::UsersChanged);
        inner.notify(ConfigEvent::FourWireChanged);
        Ok(())
    }

    /// Persist the configuration atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let inner = self.lock();
            serde_json::to_string_pretty(&inner.config)?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lancomm_protocol::types::ButtonMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn profile(slots: [Option<ChannelId>; 4]) -> UserProfile {
        UserProfile { channels: slots, button_modes: BTreeMap::new() }
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = FabricConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.enabled_channels(), vec![0, 1, 2, 3]);
        assert_eq!(cfg.gain(0), 1.0);
        assert_eq!(cfg.gain(PROGRAM_CHANNEL), 1.0);
    }

    #[test]
    fn refuses_disabling_last_channel() {
        let store = ConfigStore::new(FabricConfig::default());
        for ch in 0..3 {
            store.set_channel_enabled(ch, false).unwrap();
        }
        let err = store.set_channel_enabled(3, false);
        assert!(err.unwrap_err().to_string().contains("last enabled"));
        assert!(store.snapshot().is_enabled(3));
    }

    #[test]
    fn enable_updates_active_count() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_channel_enabled(7, true).unwrap();
        assert_eq!(store.snapshot().active_channel_count, 5);
    }

    #[test]
    fn channel_name_limits() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_channel_name(0, "  FOH  ").unwrap();
        assert_eq!(store.snapshot().channels[&0], "FOH");
        assert!(store.set_channel_name(0, "much too long name").is_err());
        assert!(store.set_channel_name(0, "   ").is_err());
        assert!(store.set_channel_name(10, "x").is_err());
    }

    #[test]
    fn volume_range_enforced() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_channel_volume(2, 0.5).unwrap();
        store.set_channel_volume(PROGRAM_CHANNEL, 0.25).unwrap();
        assert!(store.set_channel_volume(2, 1.5).is_err());
        assert!(store.set_channel_volume(2, -0.1).is_err());
        assert!(store.set_channel_volume(10, 0.5).is_err());
        let cfg = store.snapshot();
        assert_eq!(cfg.gain(2), 0.5);
        assert_eq!(cfg.gain(PROGRAM_CHANNEL), 0.25);
    }

    #[test]
    fn set_user_rejects_duplicates() {
        let store = ConfigStore::new(FabricConfig::default());
        let err = store.set_user("A1", profile([Some(1), Some(1), None, None]));
        assert!(err.unwrap_err().to_string().contains("same channel"));
        assert!(store.set_user("A1", profile([Some(1), Some(2), None, None])).is_ok());
    }

    #[test]
    fn set_user_slot_swaps_on_conflict() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_user("A1", profile([Some(1), Some(2), None, None])).unwrap();
        // Assigning channel 2 to slot 0 swaps slots 0 and 1.
        store.set_user_slot("A1", 0, Some(2)).unwrap();
        let cfg = store.snapshot();
        assert_eq!(cfg.users["A1"].channels, [Some(2), Some(1), None, None]);
        assert!(!cfg.users["A1"].has_duplicate_channel());
    }

    #[test]
    fn set_user_slot_same_slot_is_noop_swap() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_user("A1", profile([Some(1), None, None, None])).unwrap();
        store.set_user_slot("A1", 0, Some(1)).unwrap();
        assert_eq!(store.snapshot().users["A1"].channels, [Some(1), None, None, None]);
    }

    #[test]
    fn delete_user() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_user("A1", profile([None; 4])).unwrap();
        store.delete_user("A1").unwrap();
        assert!(store.delete_user("A1").is_err());
    }

    #[test]
    fn observers_fire_by_category() {
        let store = ConfigStore::new(FabricConfig::default());
        let users_fired = Arc::new(AtomicUsize::new(0));
        let channels_fired = Arc::new(AtomicUsize::new(0));
        {
            let users_fired = users_fired.clone();
            store.observe(
                ConfigEvent::UsersChanged,
                Box::new(move |_| {
                    users_fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let channels_fired = channels_fired.clone();
            store.observe(
                ConfigEvent::ChannelsChanged,
                Box::new(move |_| {
                    channels_fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        store.set_user("A1", profile([None; 4])).unwrap();
        assert_eq!(users_fired.load(Ordering::SeqCst), 1);
        assert_eq!(channels_fired.load(Ordering::SeqCst), 0);

        store.set_channel_volume(0, 0.5).unwrap();
        assert_eq!(channels_fired.load(Ordering::SeqCst), 1);

        // Rejected writes do not notify.
        let _ = store.set_channel_volume(0, 9.0);
        assert_eq!(channels_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_sees_new_state() {
        let store = ConfigStore::new(FabricConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            store.observe(
                ConfigEvent::ChannelsChanged,
                Box::new(move |cfg| {
                    seen.store(cfg.enabled_channels().len(), Ordering::SeqCst);
                }),
            );
        }
        store.set_channel_enabled(9, true).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = std::env::temp_dir().join("lancomm-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let store = ConfigStore::new(FabricConfig::default());
        store
            .set_user(
                "Stage L",
                UserProfile {
                    channels: [Some(2), Some(0), None, None],
                    button_modes: BTreeMap::from([(0, ButtonMode::Latch)]),
                },
            )
            .unwrap();
        store.set_channel_name(2, "Cams").unwrap();
        store.set_channel_volume(2, 0.75).unwrap();
        store.set_channel_enabled(5, true).unwrap();
        store
            .set_fourwire(
                1,
                FourWireSettings {
                    enabled: true,
                    channel: 5,
                    input_device: Some(3),
                    output_device: None,
                    input_gain: 0.9,
                    output_gain: 1.0,
                },
            )
            .unwrap();
        store.save(&path).unwrap();

        let restored = ConfigStore::new(FabricConfig::default());
        restored.load(&path).unwrap();
        assert_eq!(restored.snapshot(), store.snapshot());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_rejects_invalid_config() {
        let dir = std::env::temp_dir().join("lancomm-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");

        // All channels disabled.
        let mut bad = FabricConfig::default();
        for v in bad.channel_enabled.values_mut() {
            *v = false;
        }
        std::fs::write(&path, serde_json::to_string(&bad).unwrap()).unwrap();

        let store = ConfigStore::new(FabricConfig::default());
        assert!(store.load(&path).is_err());
        // Store unchanged.
        assert_eq!(store.snapshot(), FabricConfig::default());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn config_json_shape() {
        let cfg = FabricConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        for key in [
            "\"users\"",
            "\"channels\"",
            "\"channel_volumes\"",
            "\"channel_enabled\"",
            "\"active_channel_count\"",
            "\"program_audio_device\"",
            "\"program_audio_channel\"",
            "\"device_names\"",
            "\"fourwire_enabled\"",
            "\"fourwire_input_device\"",
            "\"fourwire_output_device\"",
            "\"fourwire_channel\"",
            "\"fourwire_input_gain\"",
            "\"fourwire_output_gain\"",
        ] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
        // Integer-keyed maps serialize as string keys.
        assert!(json.contains("\"-1\":1.0") || json.contains("\"-1\":1"));
    }

    #[test]
    fn session_config_skips_disabled_and_empty() {
        let store = ConfigStore::new(FabricConfig::default());
        store.set_channel_name(1, "Stage").unwrap();
        let profile = UserProfile {
            // Channel 9 is disabled by default.
            channels: [Some(1), None, Some(9), Some(3)],
            button_modes: BTreeMap::from([(0, ButtonMode::Latch)]),
        };
        let cfg = store.snapshot().session_config(&profile);
        assert_eq!(cfg.slots, BTreeMap::from([(0, 1), (3, 3)]));
        assert_eq!(cfg.channels[&1], "Stage");
        assert!(!cfg.channels.contains_key(&9));
        assert_eq!(cfg.button_modes[&0], "latch");
        assert_eq!(cfg.button_modes[&3], "non-latch");
    }
}
