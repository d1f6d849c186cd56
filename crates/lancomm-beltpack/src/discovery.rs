//! mDNS browse for the server's control endpoint.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, info};

use lancomm_protocol::types::SERVICE_TYPE;

/// How long a browse waits before the caller falls back to a configured
/// address.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the first advertised `_lancomm._tcp.local.` server.
pub fn resolve(timeout: Duration) -> Result<(IpAddr, u16)> {
    let daemon = ServiceDaemon::new().context("failed to start mDNS daemon")?;
    let receiver = daemon.browse(SERVICE_TYPE).context("mDNS browse failed")?;

    let deadline = Instant::now() + timeout;
    let found = loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break None;
        };
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(service)) => {
                let Some(&addr) = service.get_addresses().iter().next() else {
                    continue;
                };
                let ip: IpAddr = addr.into();
                info!(%ip, port = service.get_port(), "resolved intercom server");
                break Some((ip, service.get_port()));
            }
            Ok(event) => {
                debug!(?event, "mdns event");
            }
            Err(_) => break None,
        }
    };

    let _ = daemon.shutdown();
    found.with_context(|| format!("no server advertised within {timeout:?}"))
}
