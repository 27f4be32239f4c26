use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

// Snapshot of the local interface addresses, taken once at first use.
static LOCAL_ADDRESSES: LazyLock<HashSet<IpAddr>> = LazyLock::new(snapshot_local_addresses);

fn snapshot_local_addresses() -> HashSet<IpAddr> {
    let mut set = HashSet::new();
    set.insert(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => {
            for ifaddr in addrs {
                let Some(address) = ifaddr.address else {
                    continue;
                };
                if let Some(sin) = address.as_sockaddr_in() {
                    set.insert(IpAddr::V4(sin.ip()));
                } else if let Some(sin6) = address.as_sockaddr_in6() {
                    set.insert(IpAddr::V6(sin6.ip()));
                }
            }
        }
        Err(err) => {
            tracing::error!("failed to enumerate local interface addresses: {err}");
        }
    }

    set
}

/// Whether `ip` is assigned to one of this host's interfaces.
pub fn is_local(ip: &IpAddr) -> bool {
    LOCAL_ADDRESSES.contains(ip)
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            // fc00::/7 unique local, fe80::/10 link local
            (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Why `ip` must not be used as a connection target, or `None` when it
/// is acceptable. The unspecified and broadcast ranges are never
/// acceptable; loopback, private ranges and this host's own addresses
/// are rejected only when `block_local` is set.
pub fn invalid_reason(ip: &IpAddr, block_local: bool) -> Option<String> {
    if ip.is_unspecified() {
        return Some(format!("IP address {ip} is in the unspecified range"));
    }
    if let IpAddr::V4(v4) = ip {
        if v4.is_broadcast() {
            return Some(format!("IP address {ip} is a broadcast address"));
        }
    }

    if block_local {
        if ip.is_loopback() {
            return Some(format!("IP address {ip} is in the loopback range"));
        }
        if is_private(ip) {
            return Some(format!("IP address {ip} is in a private range"));
        }
        if is_local(ip) {
            return Some(format!("IP address {ip} is assigned to a local interface"));
        }
    }

    None
}

/// String form of the validator, for caller-supplied address hints.
pub fn check_addr_str(ip: &str, block_local: bool) -> Result<IpAddr, String> {
    let parsed: IpAddr = ip
        .parse()
        .map_err(|_| "Failed parsing IP address range.".to_string())?;
    match invalid_reason(&parsed, block_local) {
        Some(reason) => Err(reason),
        None => Ok(parsed),
    }
}
