use serde::Deserialize;

/// Server bind configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    /// Set this to the LAN IP that beltpacks reach so that UDP replies
    /// are sent from the correct source address.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for control connections.
    #[serde(default = "default_port")]
    pub tcp_port: u16,

    /// UDP port for audio traffic. Beltpacks assume this equals the TCP
    /// port; change both together or not at all.
    #[serde(default = "default_port")]
    pub udp_port: u16,

    /// Shared secret for the challenge handshake.
    #[serde(default = "default_secret")]
    pub shared_secret: String,

    /// Path to the persisted fabric configuration (JSON).
    #[serde(default = "default_fabric_path")]
    pub fabric_path: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    lancomm_protocol::types::DEFAULT_PORT
}

fn default_secret() -> String {
    "changeme".into()
}

fn default_fabric_path() -> String {
    "lancomm_config.json".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            tcp_port: default_port(),
            udp_port: default_port(),
            shared_secret: default_secret(),
            fabric_path: default_fabric_path(),
        }
    }
}
