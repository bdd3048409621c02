use std::net::IpAddr;

use systemstat::{Platform, System};
use tracing::info;

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface is
/// returned as an [`IpAddr`].
///
/// ## Returns
///
/// * `Some(IpAddr)`: The first routable network interface.
/// * `None`: The host exposes no usable IPv4 address, or the interfaces could
///   not be listed.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = system.networks().ok()?;

    for (name, net) in &networks {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    info!("Using interface {} ({})", name, v);
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}
