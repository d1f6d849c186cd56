//! mDNS advertisement of the control/audio endpoint.

use std::net::IpAddr;

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::info;

use lancomm_protocol::types::SERVICE_TYPE;

/// A live `_lancomm._tcp.local.` registration.
pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertisement {
    /// Advertise the service on the primary interface with the fabric's
    /// TXT properties.
    pub fn start(instance: &str, port: u16) -> Result<Self> {
        let ip = primary_ip().context("no routable interface for mDNS")?;
        let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
        let hostname = format!("{instance}.local.");
        let properties = [("version", "1.0"), ("type", "server")];
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &hostname,
            ip,
            port,
            &properties[..],
        )
        .context("invalid mDNS service info")?;
        let fullname = service.get_fullname().to_string();
        daemon.register(service).context("mDNS register failed")?;
        info!(%ip, port, service = SERVICE_TYPE, "advertising");
        Ok(Self { daemon, fullname })
    }

    pub fn shutdown(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// The address of the interface the default route uses. The connect
/// never sends a packet; it only resolves the local endpoint.
fn primary_ip() -> Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_ip_is_concrete_when_routable() {
        // Hosts without a default route legitimately fail here.
        if let Ok(ip) = primary_ip() {
            assert!(!ip.is_unspecified());
            assert!(!ip.is_multicast());
        }
    }
}
