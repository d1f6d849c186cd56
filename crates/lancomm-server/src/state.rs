use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use lancomm_audio::{Frame, JitterQueue};
use lancomm_protocol::types::{ChannelId, SessionConfig, UserId, MAX_USERS};

use crate::metering::Metering;
use crate::store::{ConfigStore, FabricConfig};

/// Control-session lifecycle. The challenge handshake happens before a
/// session is registered at all, so every session starts unbound. Audio
/// is only accepted once a profile is bound; the return address may
/// arrive via `SET_UDP` or be learned from the first upstream datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unbound,
    Bound,
    Ready,
}

/// Per-connected-beltpack record.
pub struct Session {
    pub user_id: UserId,
    /// Source address of the control connection.
    pub node_addr: IpAddr,
    pub phase: SessionPhase,
    /// Bound profile name; `None` is "unbound".
    pub bound_user: Option<String>,
    /// Channels derived from the bound profile (empty and disabled slots
    /// omitted). Recomputed on every config push.
    pub subscribed: HashSet<ChannelId>,
    /// Where downstream audio for this session goes.
    pub udp_return: Option<SocketAddr>,
    pub last_seen: Instant,
    /// Sender for pushing control lines to this session's writer task.
    pub tcp_tx: mpsc::Sender<Vec<u8>>,
    /// Malformed-message strikes; the reader closes past the threshold.
    pub violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    UnknownProfile,
    MaxUsersReached,
    NoSession,
}

/// All connected sessions, cross-indexed by `user_id`.
pub struct Registry {
    pub sessions: DashMap<UserId, Session>,
    next_user_id: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_user_id: AtomicU32::new(1),
        }
    }

    /// Allocate the next user id. Ids are never reused while the server
    /// is up.
    fn next_user_id(&self) -> UserId {
        self.next_user_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly authenticated connection.
    pub fn create(&self, node_addr: IpAddr, tcp_tx: mpsc::Sender<Vec<u8>>) -> UserId {
        let user_id = self.next_user_id();
        self.sessions.insert(
            user_id,
            Session {
                user_id,
                node_addr,
                phase: SessionPhase::Unbound,
                bound_user: None,
                subscribed: HashSet::new(),
                udp_return: None,
                last_seen: Instant::now(),
                tcp_tx,
                violations: 0,
            },
        );
        user_id
    }

    pub fn touch(&self, user_id: UserId) {
        if let Some(mut session) = self.sessions.get_mut(&user_id) {
            session.last_seen = Instant::now();
        }
    }

    /// Bind a session to a profile. Idempotent for the same profile;
    /// multiple beltpacks may share one profile. Refused only when the
    /// fleet already has `MAX_USERS` bound sessions and the profile is
    /// new to it.
    pub fn bind(
        &self,
        user_id: UserId,
        profile_name: &str,
        cfg: &FabricConfig,
        audio: &AudioStore,
    ) -> Result<SessionConfig, BindError> {
        let profile = cfg
            .users
            .get(profile_name)
            .ok_or(BindError::UnknownProfile)?;

        let mut bound_count = 0usize;
        let mut profile_in_fleet = false;
        let mut rebind = false;
        for session in self.sessions.iter() {
            if let Some(bound) = session.bound_user.as_deref() {
                bound_count += 1;
                if bound == profile_name {
                    profile_in_fleet = true;
                    if session.user_id == user_id {
                        rebind = true;
                    }
                }
            }
        }
        if !rebind && !profile_in_fleet && bound_count >= MAX_USERS {
            return Err(BindError::MaxUsersReached);
        }

        let subs = cfg.subscriptions(profile);
        {
            let mut session = self
                .sessions
                .get_mut(&user_id)
                .ok_or(BindError::NoSession)?;
            session.bound_user = Some(profile_name.to_string());
            session.subscribed = subs.iter().copied().collect();
            if session.phase == SessionPhase::Unbound {
                session.phase = SessionPhase::Bound;
            }
        }
        audio.lock().rebind_user(user_id, &subs);

        Ok(cfg.session_config(profile))
    }

    /// Record the UDP return address announced over control. Only valid
    /// once a profile is bound.
    pub fn set_udp(&self, user_id: UserId, port: u16) -> bool {
        let Some(mut session) = self.sessions.get_mut(&user_id) else {
            return false;
        };
        if session.phase == SessionPhase::Unbound {
            return false;
        }
        let addr = SocketAddr::new(session.node_addr, port);
        session.udp_return = Some(addr);
        session.phase = SessionPhase::Ready;
        true
    }

    /// Refresh the return address from the source of an upstream
    /// datagram. Catches clients that skipped `SET_UDP`.
    pub fn learn_udp(&self, user_id: UserId, addr: SocketAddr) {
        if let Some(mut session) = self.sessions.get_mut(&user_id) {
            session.udp_return = Some(addr);
            session.last_seen = Instant::now();
            if session.phase == SessionPhase::Bound {
                session.phase = SessionPhase::Ready;
            }
        }
    }

    /// Key or unkey a channel. Rejected for channels outside the
    /// session's subscriptions.
    pub fn set_talk(
        &self,
        user_id: UserId,
        channel: ChannelId,
        on: bool,
        audio: &AudioStore,
    ) -> bool {
        let subscribed = self
            .sessions
            .get(&user_id)
            .map(|s| s.subscribed.contains(&channel))
            .unwrap_or(false);
        if on && !subscribed {
            return false;
        }
        audio.lock().set_talk(channel, user_id, on)
    }

    /// Remove a session and every trace of it from the audio plane.
    pub fn drop_session(&self, user_id: UserId, audio: &AudioStore) {
        self.sessions.remove(&user_id);
        audio.lock().drop_user(user_id);
    }

    /// Downstream addresses for the mixer, collected outside the audio lock.
    pub fn udp_returns(&self) -> HashMap<UserId, SocketAddr> {
        self.sessions
            .iter()
            .filter_map(|s| s.udp_return.map(|addr| (s.user_id, addr)))
            .collect()
    }

    /// Sessions silent for longer than `max_idle`.
    pub fn idle_sessions(&self, max_idle: Duration) -> Vec<UserId> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|s| now.duration_since(s.last_seen) > max_idle)
            .map(|s| s.user_id)
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the real-time plane mutates per frame, behind one lock
/// held only across constant-time operations.
#[derive(Default)]
pub struct AudioInner {
    /// Per-(channel, sender) jitter queues.
    pub buffers: HashMap<(ChannelId, UserId), JitterQueue>,
    /// Currently keyed senders per channel.
    pub talkers: HashMap<ChannelId, HashSet<UserId>>,
    /// Subscribed receivers per channel.
    pub listeners: HashMap<ChannelId, HashSet<UserId>>,
    /// Last observed 16-bit sequence per (channel, sender).
    pub seq: HashMap<(ChannelId, UserId), u16>,
    /// Last upstream arrival per channel, for idle cleanup.
    pub last_activity: HashMap<ChannelId, Instant>,
}

impl AudioInner {
    pub fn is_listener(&self, channel: ChannelId, user: UserId) -> bool {
        self.listeners
            .get(&channel)
            .is_some_and(|l| l.contains(&user))
    }

    pub fn is_talker(&self, channel: ChannelId, user: UserId) -> bool {
        self.talkers
            .get(&channel)
            .is_some_and(|t| t.contains(&user))
    }

    /// Key/unkey, preserving `talkers ⊆ listeners`.
    pub fn set_talk(&mut self, channel: ChannelId, user: UserId, on: bool) -> bool {
        if on {
            if !self.is_listener(channel, user) {
                return false;
            }
            self.talkers.entry(channel).or_default().insert(user);
        } else if let Some(talkers) = self.talkers.get_mut(&channel) {
            talkers.remove(&user);
        }
        true
    }

    /// Reconcile a user's membership with a new subscription list.
    pub fn rebind_user(&mut self, user: UserId, subscribed: &[ChannelId]) {
        let keep: HashSet<ChannelId> = subscribed.iter().copied().collect();
        for (channel, listeners) in self.listeners.iter_mut() {
            if !keep.contains(channel) {
                listeners.remove(&user);
            }
        }
        for (channel, talkers) in self.talkers.iter_mut() {
            if !keep.contains(channel) {
                talkers.remove(&user);
            }
        }
        for &channel in subscribed {
            self.listeners.entry(channel).or_default().insert(user);
        }
    }

    /// Remove a user from every set, queue, and tracker.
    pub fn drop_user(&mut self, user: UserId) {
        for listeners in self.listeners.values_mut() {
            listeners.remove(&user);
        }
        for talkers in self.talkers.values_mut() {
            talkers.remove(&user);
        }
        self.buffers.retain(|&(_, u), _| u != user);
        self.seq.retain(|&(_, u), _| u != user);
    }

    /// Append a validated upstream frame (drop-oldest on overflow) and
    /// note channel activity.
    pub fn push_frame(&mut self, channel: ChannelId, user: UserId, frame: Frame) {
        self.buffers
            .entry((channel, user))
            .or_insert_with(JitterQueue::new)
            .push_overwrite(frame);
        self.last_activity.insert(channel, Instant::now());
    }

    /// Record a sender's sequence number; returns how many frames went
    /// missing since the last one (0 when contiguous or first seen).
    pub fn track_sequence(&mut self, channel: ChannelId, user: UserId, sequence: u16) -> u16 {
        match self.seq.insert((channel, user), sequence) {
            None => 0,
            Some(last) => {
                let delta = sequence.wrapping_sub(last);
                // Reordered/duplicate arrivals show up as huge deltas;
                // they are not losses.
                if delta == 0 || delta > 0x8000 {
                    0
                } else {
                    delta - 1
                }
            }
        }
    }

    /// Tear down a channel that was disabled: membership, queues, and
    /// trackers all go.
    pub fn purge_channel(&mut self, channel: ChannelId) {
        self.talkers.remove(&channel);
        self.listeners.remove(&channel);
        self.buffers.retain(|&(ch, _), _| ch != channel);
        self.seq.retain(|&(ch, _), _| ch != channel);
        self.last_activity.remove(&channel);
    }

    /// Discard queues and trackers of channels idle past `max_idle`.
    /// Membership sets are left alone.
    pub fn idle_cleanup(&mut self, max_idle: Duration) {
        let now = Instant::now();
        let stale: Vec<ChannelId> = self
            .last_activity
            .iter()
            .filter(|(_, &at)| now.duration_since(at) > max_idle)
            .map(|(&ch, _)| ch)
            .collect();
        for channel in stale {
            self.buffers.retain(|&(ch, _), _| ch != channel);
            self.seq.retain(|&(ch, _), _| ch != channel);
            self.last_activity.remove(&channel);
        }
    }
}

/// The audio plane's lock. Never held across `.await` or device I/O;
/// lock order when combined with the config store is Config → Audio.
#[derive(Default)]
pub struct AudioStore {
    inner: Mutex<AudioInner>,
}

impl AudioStore {
    pub fn lock(&self) -> MutexGuard<'_, AudioInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared server state handed to every task.
pub struct ServerState {
    pub config: ConfigStore,
    pub registry: Registry,
    pub audio: AudioStore,
    pub metering: Metering,
    pub shared_secret: Zeroizing<String>,
}

impl ServerState {
    pub fn new(config: ConfigStore, shared_secret: String) -> Self {
        Self {
            config,
            registry: Registry::new(),
            audio: AudioStore::default(),
            metering: Metering::new(),
            shared_secret: Zeroizing::new(shared_secret),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FabricConfig;
    use lancomm_protocol::types::UserProfile;

    fn test_tx() -> mpsc::Sender<Vec<u8>> {
        mpsc::channel(8).0
    }

    fn config_with_profile(name: &str, slots: [Option<ChannelId>; 4]) -> FabricConfig {
        let mut cfg = FabricConfig::default();
        cfg.users.insert(
            name.to_string(),
            UserProfile { channels: slots, button_modes: Default::default() },
        );
        cfg
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn user_ids_monotonic_and_unique() {
        let registry = Registry::new();
        let a = registry.create(localhost(), test_tx());
        let b = registry.create(localhost(), test_tx());
        assert!(b > a);
        let audio = AudioStore::default();
        registry.drop_session(a, &audio);
        let c = registry.create(localhost(), test_tx());
        assert!(c > b, "ids are never reused");
    }

    #[test]
    fn bind_sets_subscriptions_and_listeners() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = config_with_profile("A1", [Some(2), Some(0), None, None]);
        let id = registry.create(localhost(), test_tx());

        let session_cfg = registry.bind(id, "A1", &cfg, &audio).unwrap();
        assert_eq!(session_cfg.slots.len(), 2);

        let session = registry.sessions.get(&id).unwrap();
        assert_eq!(session.phase, SessionPhase::Bound);
        assert!(session.subscribed.contains(&2));
        drop(session);

        let inner = audio.lock();
        assert!(inner.is_listener(2, id));
        assert!(inner.is_listener(0, id));
        assert!(!inner.is_listener(1, id));
    }

    #[test]
    fn bind_skips_disabled_channels() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        // Channel 9 is disabled in the default config.
        let cfg = config_with_profile("A1", [Some(9), Some(1), None, None]);
        let id = registry.create(localhost(), test_tx());
        registry.bind(id, "A1", &cfg, &audio).unwrap();
        let session = registry.sessions.get(&id).unwrap();
        assert!(!session.subscribed.contains(&9));
        assert!(session.subscribed.contains(&1));
    }

    #[test]
    fn bind_unknown_profile() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = FabricConfig::default();
        let id = registry.create(localhost(), test_tx());
        assert_eq!(
            registry.bind(id, "ghost", &cfg, &audio),
            Err(BindError::UnknownProfile)
        );
    }

    #[test]
    fn bind_enforces_fleet_capacity() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let mut cfg = FabricConfig::default();
        for i in 0..=MAX_USERS {
            cfg.users.insert(format!("P{i}"), UserProfile::empty());
        }

        for i in 0..MAX_USERS {
            let id = registry.create(localhost(), test_tx());
            registry.bind(id, &format!("P{i}"), &cfg, &audio).unwrap();
        }

        let extra = registry.create(localhost(), test_tx());
        // A fleet-new profile is refused...
        assert_eq!(
            registry.bind(extra, &format!("P{MAX_USERS}"), &cfg, &audio),
            Err(BindError::MaxUsersReached)
        );
        // ...but sharing an already-bound profile is allowed.
        assert!(registry.bind(extra, "P0", &cfg, &audio).is_ok());
    }

    #[test]
    fn bind_is_idempotent() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = config_with_profile("A1", [Some(1), None, None, None]);
        let id = registry.create(localhost(), test_tx());
        let first = registry.bind(id, "A1", &cfg, &audio).unwrap();
        let second = registry.bind(id, "A1", &cfg, &audio).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn set_udp_requires_bound() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = config_with_profile("A1", [Some(1), None, None, None]);
        let id = registry.create(localhost(), test_tx());

        assert!(!registry.set_udp(id, 7000), "unbound session has no subscriptions yet");

        registry.bind(id, "A1", &cfg, &audio).unwrap();
        assert!(registry.set_udp(id, 7000));
        let session = registry.sessions.get(&id).unwrap();
        assert_eq!(session.phase, SessionPhase::Ready);
        assert_eq!(session.udp_return.unwrap().port(), 7000);
    }

    #[test]
    fn learn_udp_promotes_bound_session() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = config_with_profile("A1", [Some(1), None, None, None]);
        let id = registry.create(localhost(), test_tx());
        registry.bind(id, "A1", &cfg, &audio).unwrap();

        let src: SocketAddr = "192.168.1.50:40000".parse().unwrap();
        registry.learn_udp(id, src);
        let session = registry.sessions.get(&id).unwrap();
        assert_eq!(session.phase, SessionPhase::Ready);
        assert_eq!(session.udp_return, Some(src));
    }

    #[test]
    fn talk_requires_subscription() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = config_with_profile("A1", [Some(2), None, None, None]);
        let id = registry.create(localhost(), test_tx());
        registry.bind(id, "A1", &cfg, &audio).unwrap();

        assert!(registry.set_talk(id, 2, true, &audio));
        assert!(audio.lock().is_talker(2, id));

        assert!(!registry.set_talk(id, 3, true, &audio));
        assert!(!audio.lock().is_talker(3, id));

        assert!(registry.set_talk(id, 2, false, &audio));
        assert!(!audio.lock().is_talker(2, id));
    }

    #[test]
    fn talkers_subset_of_listeners() {
        let audio = AudioStore::default();
        {
            let mut inner = audio.lock();
            assert!(!inner.set_talk(1, 5, true), "non-listener cannot key");
            inner.rebind_user(5, &[1]);
            assert!(inner.set_talk(1, 5, true));
        }
        let inner = audio.lock();
        for (channel, talkers) in &inner.talkers {
            for user in talkers {
                assert!(inner.is_listener(*channel, *user));
            }
        }
    }

    #[test]
    fn drop_session_purges_everything() {
        let registry = Registry::new();
        let audio = AudioStore::default();
        let cfg = config_with_profile("A1", [Some(2), None, None, None]);
        let id = registry.create(localhost(), test_tx());
        registry.bind(id, "A1", &cfg, &audio).unwrap();
        registry.set_talk(id, 2, true, &audio);
        audio.lock().push_frame(2, id, Frame::silence());

        registry.drop_session(id, &audio);
        assert!(registry.sessions.get(&id).is_none());
        let inner = audio.lock();
        assert!(!inner.is_listener(2, id));
        assert!(!inner.is_talker(2, id));
        assert!(!inner.buffers.contains_key(&(2, id)));
    }

    #[test]
    fn rebind_narrows_membership() {
        let audio = AudioStore::default();
        let mut inner = audio.lock();
        inner.rebind_user(7, &[1, 2]);
        inner.set_talk(1, 7, true);
        inner.rebind_user(7, &[2, 3]);
        assert!(!inner.is_listener(1, 7));
        assert!(!inner.is_talker(1, 7), "unkeyed when the channel was dropped");
        assert!(inner.is_listener(2, 7));
        assert!(inner.is_listener(3, 7));
    }

    #[test]
    fn sequence_gap_tracking() {
        let mut inner = AudioInner::default();
        assert_eq!(inner.track_sequence(1, 7, 100), 0);
        assert_eq!(inner.track_sequence(1, 7, 101), 0);
        assert_eq!(inner.track_sequence(1, 7, 105), 3);
        // A backwards jump reads as reordering, not loss.
        assert_eq!(inner.track_sequence(1, 7, 100), 0);
        // Wraparound is contiguous.
        assert_eq!(inner.track_sequence(2, 9, u16::MAX), 0);
        assert_eq!(inner.track_sequence(2, 9, 0), 0);
        // Duplicate is not a loss.
        assert_eq!(inner.track_sequence(2, 9, 0), 0);
    }

    #[test]
    fn purge_channel_clears_plane_state() {
        let mut inner = AudioInner::default();
        inner.rebind_user(7, &[3]);
        inner.set_talk(3, 7, true);
        inner.push_frame(3, 7, Frame::silence());
        inner.track_sequence(3, 7, 1);

        inner.purge_channel(3);
        assert!(inner.talkers.get(&3).is_none());
        assert!(inner.listeners.get(&3).is_none());
        assert!(inner.buffers.is_empty());
        assert!(inner.seq.is_empty());
    }

    #[test]
    fn idle_cleanup_keeps_membership() {
        let mut inner = AudioInner::default();
        inner.rebind_user(7, &[3]);
        inner.push_frame(3, 7, Frame::silence());
        inner.track_sequence(3, 7, 1);

        // Zero tolerance: everything with recorded activity is stale.
        std::thread::sleep(Duration::from_millis(2));
        inner.idle_cleanup(Duration::from_millis(1));
        assert!(inner.buffers.is_empty());
        assert!(inner.seq.is_empty());
        assert!(inner.is_listener(3, 7), "membership survives idle cleanup");
    }

    #[test]
    fn idle_sessions_reported() {
        let registry = Registry::new();
        let id = registry.create(localhost(), test_tx());
        assert!(registry.idle_sessions(Duration::from_secs(30)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        let idle = registry.idle_sessions(Duration::from_millis(1));
        assert_eq!(idle, vec![id]);
        registry.touch(id);
        assert!(registry.idle_sessions(Duration::from_millis(1)).is_empty());
    }
}
