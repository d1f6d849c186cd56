//! TCP control endpoint: challenge handshake, verb dispatch, and the
//! async push channel (FLASH_PACK / UPDATE_CONFIG) to each beltpack.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lancomm_protocol::auth;
use lancomm_protocol::control::{encode_line, take_line, ClientVerb, ServerVerb};
use lancomm_protocol::types::{SessionConfig, UserId};

use crate::state::{BindError, ServerState};
use crate::store::FabricConfig;

/// The client must answer the challenge within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads idle past this close the connection; the reaper would declare
/// the session dead at the same age anyway.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Malformed messages tolerated before the connection is closed.
pub const VIOLATION_LIMIT: u32 = 8;

/// Handle one accepted control connection for its lifetime.
pub async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    let peer_addr = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0));

    info!(peer = %peer_addr, "new control connection");

    let mut buf = BytesMut::with_capacity(4096);
    if !authenticate(&mut stream, &mut buf, &state, peer_addr).await {
        return;
    }

    // Reader/writer split; pushes go through the writer task's queue.
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let writer_handle = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                debug!("control write error: {}", e);
                break;
            }
        }
    });

    let user_id = state.registry.create(peer_addr.ip(), tx.clone());
    info!(peer = %peer_addr, user_id, "session authenticated");
    let _ = send(&tx, ServerVerb::UserId(user_id)).await;

    loop {
        let read = tokio::time::timeout(READ_IDLE_TIMEOUT, read_half.read_buf(&mut buf)).await;
        match read {
            Ok(Ok(0)) => {
                info!(user_id, "client disconnected (EOF)");
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(user_id, "control read error: {}", e);
                break;
            }
            Err(_) => {
                warn!(user_id, "control connection idle past {:?}", READ_IDLE_TIMEOUT);
                break;
            }
        }

        let mut fatal = false;
        loop {
            match take_line(&mut buf) {
                Ok(Some(line)) => match ClientVerb::parse(&line) {
                    Ok(verb) => {
                        state.registry.touch(user_id);
                        dispatch(verb, &state, user_id, &tx).await;
                    }
                    Err(e) => {
                        debug!(user_id, "protocol violation: {}", e);
                        if note_violation(&state, user_id) {
                            warn!(user_id, "too many protocol violations, closing");
                            fatal = true;
                            break;
                        }
                    }
                },
                Ok(None) => break, // need more data
                Err(e) => {
                    warn!(user_id, "unframeable control data: {}", e);
                    fatal = true;
                    break;
                }
            }
        }
        if fatal {
            break;
        }
    }

    state.registry.drop_session(user_id, &state.audio);
    writer_handle.abort();
    info!(user_id, "session closed");
}

/// Run the challenge/response handshake on the raw stream. Returns
/// whether the peer is authentic; on failure AUTH_FAIL has been sent and
/// the caller just drops the connection. No user id is allocated until
/// this returns true.
async fn authenticate(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    state: &ServerState,
    peer_addr: SocketAddr,
) -> bool {
    let mut nonce_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = auth::to_hex(&nonce_bytes);

    let challenge = encode_line(&ServerVerb::AuthChallenge(nonce.clone()).encode());
    if let Err(e) = stream.write_all(&challenge).await {
        debug!(peer = %peer_addr, "challenge write failed: {}", e);
        return false;
    }

    let response =
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_line(stream, buf)).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                warn!(peer = %peer_addr, "handshake failed: {}", e);
                return false;
            }
            Err(_) => {
                warn!(peer = %peer_addr, "handshake timed out");
                let _ = stream.write_all(&encode_line(&ServerVerb::AuthFail.encode())).await;
                return false;
            }
        };

    let expected = auth::challenge_response(&nonce, &state.shared_secret);
    let ok: bool = response.as_bytes().ct_eq(expected.as_bytes()).into();
    if !ok {
        warn!(peer = %peer_addr, "bad challenge response");
        let _ = stream.write_all(&encode_line(&ServerVerb::AuthFail.encode())).await;
        return false;
    }
    true
}

async fn read_line(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(line) = take_line(buf)? {
            return Ok(line);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed");
        }
    }
}

async fn dispatch(
    verb: ClientVerb,
    state: &Arc<ServerState>,
    user_id: UserId,
    tx: &mpsc::Sender<Vec<u8>>,
) {
    match verb {
        ClientVerb::GetUsers => {
            let names = state.config.snapshot().user_names();
            let _ = send(tx, ServerVerb::Users(names)).await;
        }
        ClientVerb::SelectUser(name) | ClientVerb::AssignUser(name) => {
            let cfg = state.config.snapshot();
            match state.registry.bind(user_id, &name, &cfg, &state.audio) {
                Ok(session_cfg) => {
                    info!(user_id, profile = %name, "session bound");
                    let _ = send(tx, ServerVerb::Config(session_cfg.to_json())).await;
                }
                Err(BindError::MaxUsersReached) => {
                    warn!(user_id, profile = %name, "fleet is full");
                    let _ = send(
                        tx,
                        ServerVerb::Error(Some("MAX_USERS_REACHED".into())),
                    )
                    .await;
                }
                Err(_) => {
                    let _ = send(tx, ServerVerb::Error(None)).await;
                }
            }
        }
        ClientVerb::ToggleTalk { channel, on } => {
            if !state.registry.set_talk(user_id, channel, on, &state.audio) {
                debug!(user_id, channel, "talk toggle rejected");
            }
        }
        ClientVerb::SetUdp(port) => {
            let reply = if state.registry.set_udp(user_id, port) {
                ServerVerb::UdpOk
            } else {
                ServerVerb::UdpFail
            };
            let _ = send(tx, reply).await;
        }
        ClientVerb::Ping => {
            let _ = send(tx, ServerVerb::Pong).await;
        }
    }
}

async fn send(tx: &mpsc::Sender<Vec<u8>>, verb: ServerVerb) -> Result<()> {
    tx.send(encode_line(&verb.encode())).await?;
    Ok(())
}

/// Record a malformed message; true when the session is past the limit.
fn note_violation(state: &ServerState, user_id: UserId) -> bool {
    match state.registry.sessions.get_mut(&user_id) {
        Some(mut session) => {
            session.violations += 1;
            session.violations >= VIOLATION_LIMIT
        }
        None => true,
    }
}

/// Ask a pack to identify itself by flashing its LEDs.
#[allow(dead_code)]
pub fn flash_pack(state: &ServerState, user_id: UserId) -> bool {
    match state.registry.sessions.get(&user_id) {
        Some(session) => session
            .tcp_tx
            .try_send(encode_line(&ServerVerb::FlashPack.encode()))
            .is_ok(),
        None => false,
    }
}

/// Push UPDATE_CONFIG to every bound session and re-derive its
/// subscriptions against the new configuration. Called from config-store
/// observers, so it must not block: pushes use `try_send`.
pub fn push_config_updates(state: &ServerState, cfg: &FabricConfig) {
    for mut session in state.registry.sessions.iter_mut() {
        let Some(name) = session.bound_user.clone() else {
            continue;
        };
        let user_id = session.user_id;
        let session_cfg = match cfg.users.get(&name) {
            Some(profile) => {
                let subs = cfg.subscriptions(profile);
                session.subscribed = subs.iter().copied().collect();
                state.audio.lock().rebind_user(user_id, &subs);
                cfg.session_config(profile)
            }
            None => {
                // Profile deleted out from under the pack.
                session.subscribed.clear();
                state.audio.lock().rebind_user(user_id, &[]);
                SessionConfig::default()
            }
        };
        let line = encode_line(&ServerVerb::UpdateConfig(session_cfg.to_json()).encode());
        if session.tcp_tx.try_send(line).is_err() {
            debug!(user_id, "config push dropped (writer queue full)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfigStore, FabricConfig};
    use lancomm_protocol::types::UserProfile;
    use tokio::net::TcpListener;

    async fn spawn_server(cfg: FabricConfig) -> (SocketAddr, Arc<ServerState>) {
        let state = Arc::new(ServerState::new(ConfigStore::new(cfg), "backstage".into()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let state = accept_state.clone();
                tokio::spawn(handle_connection(stream, state));
            }
        });
        (addr, state)
    }

    async fn next_verb(stream: &mut TcpStream, buf: &mut BytesMut) -> ServerVerb {
        let line = tokio::time::timeout(Duration::from_secs(2), read_line(stream, buf))
            .await
            .expect("server reply timed out")
            .unwrap();
        ServerVerb::parse(&line).unwrap()
    }

    async fn connect_and_auth(addr: SocketAddr) -> (TcpStream, BytesMut, UserId) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        let nonce = match next_verb(&mut stream, &mut buf).await {
            ServerVerb::AuthChallenge(nonce) => nonce,
            other => panic!("expected challenge, got {other:?}"),
        };
        let response = auth::challenge_response(&nonce, "backstage");
        stream.write_all(&encode_line(&response)).await.unwrap();
        let user_id = match next_verb(&mut stream, &mut buf).await {
            ServerVerb::UserId(id) => id,
            other => panic!("expected user id, got {other:?}"),
        };
        (stream, buf, user_id)
    }

    fn cfg_with_profile() -> FabricConfig {
        let mut cfg = FabricConfig::default();
        cfg.users.insert(
            "FOH".into(),
            UserProfile {
                channels: [Some(2), Some(0), None, None],
                button_modes: Default::default(),
            },
        );
        cfg
    }

    #[tokio::test]
    async fn full_session_flow() {
        let (addr, state) = spawn_server(cfg_with_profile()).await;
        let (mut stream, mut buf, user_id) = connect_and_auth(addr).await;

        stream
            .write_all(&encode_line(&ClientVerb::GetUsers.encode()))
            .await
            .unwrap();
        assert_eq!(
            next_verb(&mut stream, &mut buf).await,
            ServerVerb::Users(vec!["FOH".into()])
        );

        stream
            .write_all(&encode_line(&ClientVerb::SelectUser("FOH".into()).encode()))
            .await
            .unwrap();
        let config = match next_verb(&mut stream, &mut buf).await {
            ServerVerb::Config(json) => SessionConfig::from_json(&json).unwrap(),
            other => panic!("expected config, got {other:?}"),
        };
        assert_eq!(config.slots[&0], 2);
        assert_eq!(config.slots[&1], 0);

        stream
            .write_all(&encode_line(&ClientVerb::SetUdp(40001).encode()))
            .await
            .unwrap();
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::UdpOk);

        stream
            .write_all(&encode_line(
                &ClientVerb::ToggleTalk { channel: 2, on: true }.encode(),
            ))
            .await
            .unwrap();
        stream
            .write_all(&encode_line(&ClientVerb::Ping.encode()))
            .await
            .unwrap();
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::Pong);

        // The toggle landed before the ping was answered (per-session ordering).
        assert!(state.audio.lock().is_talker(2, user_id));
        let session = state.registry.sessions.get(&user_id).unwrap();
        assert_eq!(session.udp_return.unwrap().port(), 40001);
    }

    #[tokio::test]
    async fn bad_response_gets_auth_fail_and_close() {
        let (addr, state) = spawn_server(FabricConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        let _nonce = next_verb(&mut stream, &mut buf).await;

        stream
            .write_all(&encode_line(&"0".repeat(64)))
            .await
            .unwrap();
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::AuthFail);

        // Connection closes and no session was created.
        let n = tokio::time::timeout(Duration::from_secs(1), stream.read_buf(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(state.registry.sessions.is_empty());
    }

    #[tokio::test]
    async fn unknown_profile_is_error() {
        let (addr, _state) = spawn_server(FabricConfig::default()).await;
        let (mut stream, mut buf, _id) = connect_and_auth(addr).await;
        stream
            .write_all(&encode_line(&ClientVerb::SelectUser("ghost".into()).encode()))
            .await
            .unwrap();
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::Error(None));
    }

    #[tokio::test]
    async fn set_udp_before_bind_fails() {
        let (addr, _state) = spawn_server(cfg_with_profile()).await;
        let (mut stream, mut buf, _id) = connect_and_auth(addr).await;
        stream
            .write_all(&encode_line(&ClientVerb::SetUdp(40001).encode()))
            .await
            .unwrap();
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::UdpFail);
    }

    #[tokio::test]
    async fn repeated_violations_close_connection() {
        let (addr, state) = spawn_server(FabricConfig::default()).await;
        let (mut stream, mut buf, user_id) = connect_and_auth(addr).await;

        // Single junk messages are ignored...
        stream.write_all(&encode_line(&"BOGUS")).await.unwrap();
        stream
            .write_all(&encode_line(&ClientVerb::Ping.encode()))
            .await
            .unwrap();
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::Pong);
        assert!(state.registry.sessions.contains_key(&user_id));

        // ...until the strike limit is reached.
        for _ in 0..VIOLATION_LIMIT {
            stream.write_all(&encode_line(&"BOGUS")).await.unwrap();
        }
        let n = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let n = stream.read_buf(&mut buf).await.unwrap();
                if n == 0 {
                    break 0;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn update_config_pushed_on_profile_change() {
        let (addr, state) = spawn_server(cfg_with_profile()).await;
        let (mut stream, mut buf, user_id) = connect_and_auth(addr).await;
        stream
            .write_all(&encode_line(&ClientVerb::SelectUser("FOH".into()).encode()))
            .await
            .unwrap();
        let _config = next_verb(&mut stream, &mut buf).await;

        // Operator edits the profile; every bound pack gets a push.
        let cfg = {
            let mut cfg = state.config.snapshot();
            cfg.users.get_mut("FOH").unwrap().channels = [Some(1), None, None, None];
            cfg
        };
        push_config_updates(&state, &cfg);

        match next_verb(&mut stream, &mut buf).await {
            ServerVerb::UpdateConfig(json) => {
                let sc = SessionConfig::from_json(&json).unwrap();
                assert_eq!(sc.slots[&0], 1);
            }
            other => panic!("expected update, got {other:?}"),
        }
        let session = state.registry.sessions.get(&user_id).unwrap();
        assert!(session.subscribed.contains(&1));
        assert!(!session.subscribed.contains(&2));
    }

    #[tokio::test]
    async fn flash_pack_reaches_client() {
        let (addr, state) = spawn_server(FabricConfig::default()).await;
        let (mut stream, mut buf, user_id) = connect_and_auth(addr).await;
        assert!(flash_pack(&state, user_id));
        assert_eq!(next_verb(&mut stream, &mut buf).await, ServerVerb::FlashPack);
        assert!(!flash_pack(&state, 9999));
    }
}
