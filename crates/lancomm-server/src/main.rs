use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

mod config;
mod control;
mod discovery;
mod fourwire;
mod ingress;
mod metering;
mod mixer;
mod state;
mod store;

use config::ServerConfig;
use lancomm_protocol::types::MAX_CHANNELS;
use state::ServerState;
use store::{ConfigEvent, ConfigStore, FabricConfig};

/// DSCP AF41 in the legacy TOS byte; voice-priority marking on a
/// cooperating LAN.
const TOS_AF41: u32 = 0x88;

#[derive(Parser)]
#[command(name = "lancomm-server", about = "LAN intercom conferencing server")]
struct Args {
    /// Path to server configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// TCP control port, overrides config
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP audio port, overrides config
    #[arg(long)]
    udp_port: Option<u16>,

    /// Shared secret, overrides config
    #[arg(long)]
    secret: Option<String>,

    /// Path to the fabric configuration file (JSON), overrides config
    #[arg(long)]
    fabric: Option<String>,

    /// Skip mDNS advertisement
    #[arg(long)]
    no_mdns: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lancomm_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut server_config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ServerConfig::default()
    };

    if let Some(host) = args.host {
        server_config.host = host;
    }
    if let Some(port) = args.tcp_port {
        server_config.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        server_config.udp_port = port;
    }
    if let Some(secret) = args.secret {
        server_config.shared_secret = secret;
    }
    if let Some(fabric) = args.fabric {
        server_config.fabric_path = fabric;
    }

    if server_config.shared_secret == "changeme" {
        warn!("running with the default shared secret; set one in the config file");
    }

    info!("lancomm server starting");
    info!(
        host = %server_config.host,
        tcp_port = server_config.tcp_port,
        udp_port = server_config.udp_port,
        fabric = %server_config.fabric_path,
    );

    // Fabric configuration: load the persisted file, or seed it.
    let config_store = ConfigStore::new(FabricConfig::default());
    let fabric_path = server_config.fabric_path.clone();
    if Path::new(&fabric_path).exists() {
        config_store
            .load(Path::new(&fabric_path))
            .with_context(|| format!("invalid fabric config: {fabric_path}"))?;
        info!("loaded fabric config from {fabric_path}");
    } else if let Err(e) = config_store.save(Path::new(&fabric_path)) {
        warn!("could not seed {fabric_path}: {e:#}");
    }

    let state = Arc::new(ServerState::new(
        config_store,
        server_config.shared_secret.clone(),
    ));

    // Channel edits tear down disabled channels and re-derive every bound
    // session's subscriptions; profile edits push new configs.
    {
        let st = state.clone();
        state.config.observe(
            ConfigEvent::ChannelsChanged,
            Box::new(move |cfg| {
                {
                    let mut audio = st.audio.lock();
                    for channel in 0..MAX_CHANNELS {
                        if !cfg.is_enabled(channel) {
                            audio.purge_channel(channel);
                        }
                    }
                }
                control::push_config_updates(&st, cfg);
            }),
        );
        let st = state.clone();
        state.config.observe(
            ConfigEvent::UsersChanged,
            Box::new(move |cfg| {
                control::push_config_updates(&st, cfg);
            }),
        );
    }

    // 4-wire bridges run on their own threads; settings changes are
    // forwarded out of the observer (which must not block) and applied
    // with a full stop/start.
    let fourwire = fourwire::FourWireManager::new(state.clone());
    let (fw_tx, mut fw_rx) = tokio::sync::mpsc::channel::<()>(4);
    {
        let fw_tx = fw_tx.clone();
        state.config.observe(
            ConfigEvent::FourWireChanged,
            Box::new(move |_| {
                let _ = fw_tx.try_send(());
            }),
        );
    }
    {
        let fourwire = fourwire.clone();
        std::thread::Builder::new()
            .name("fourwire-manager".into())
            .spawn(move || {
                fourwire.apply_all();
                while fw_rx.blocking_recv().is_some() {
                    fourwire.apply_all();
                }
            })
            .expect("failed to spawn 4-wire manager");
    }

    let advertisement = if args.no_mdns {
        None
    } else {
        match discovery::Advertisement::start("lancomm-server", server_config.tcp_port) {
            Ok(ad) => Some(ad),
            Err(e) => {
                warn!("mDNS advertisement disabled: {e:#}");
                None
            }
        }
    };

    let tcp_listener = bind_tcp(&server_config.host, server_config.tcp_port)?;
    info!("control listener on {}:{}", server_config.host, server_config.tcp_port);

    let udp_socket = Arc::new(bind_udp(&server_config.host, server_config.udp_port)?);
    info!("audio socket on {}:{}", server_config.host, server_config.udp_port);

    tokio::spawn(ingress::run_udp_loop(udp_socket.clone(), state.clone()));
    tokio::spawn(mixer::run_mixer_loop(udp_socket.clone(), state.clone()));
    tokio::spawn(mixer::run_cleanup_loop(state.clone()));

    let accept_state = state.clone();
    tokio::spawn(async move {
        info!("server ready, accepting connections");
        loop {
            let (stream, peer_addr) = match tcp_listener.accept().await {
                Ok(result) => result,
                Err(e) => {
                    error!("TCP accept error: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer_addr, "set_nodelay failed: {}", e);
            }
            tokio::spawn(control::handle_connection(stream, accept_state.clone()));
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    fourwire.stop_all();
    if let Some(ad) = advertisement {
        ad.shutdown();
    }
    if let Err(e) = state.config.save(Path::new(&fabric_path)) {
        warn!("could not persist fabric config: {e:#}");
    }

    Ok(())
}

/// Bind the control listener with AF41 marking where the host allows it.
fn bind_tcp(host: &str, port: u16) -> Result<TcpListener> {
    let addr: std::net::SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid TCP address {host}:{port}"))?;
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .context("failed to create TCP socket")?;
    let _ = sock.set_reuse_address(true);
    let _ = sock.set_tos(TOS_AF41);
    sock.bind(&addr.into())
        .with_context(|| format!("failed to bind TCP on {host}:{port}"))?;
    sock.listen(64).context("listen failed")?;
    sock.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = sock.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Bind the audio socket with enlarged buffers and AF41 marking.
fn bind_udp(host: &str, port: u16) -> Result<UdpSocket> {
    let addr: std::net::SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid UDP address {host}:{port}"))?;
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("failed to create UDP socket")?;
    let _ = sock.set_recv_buffer_size(1024 * 1024);
    let _ = sock.set_send_buffer_size(1024 * 1024);
    let _ = sock.set_tos(TOS_AF41);
    sock.bind(&addr.into())
        .with_context(|| format!("failed to bind UDP on {host}:{port}"))?;
    sock.set_nonblocking(true)
        .context("failed to set non-blocking")?;
    let std_sock: std::net::UdpSocket = sock.into();
    Ok(UdpSocket::from_std(std_sock)?)
}
