use std::{borrow::Cow, net::SocketAddr, time::Duration};

/// Pause after a failed accept so a persistent error (EMFILE) does not spin.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so it becomes
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Resolves `host:port` to the first address the OS resolver returns.
pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("net: could not resolve {addr:?}"))
}

/// Splits `host:port` (or `[v6]:port`) into its host and port parts.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Reports whether a dial target names an IPv6 destination.
///
/// Hostnames count as IPv4: the egress policy only looks at literal
/// bracketed addresses.
pub fn is_ipv6_target(addr: &str) -> bool {
    match addr.trim().parse::<SocketAddr>() {
        Ok(sa) => sa.is_ipv6(),
        Err(_) => addr.trim_start().starts_with('['),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn split_host_port_handles_brackets() {
        assert_eq!(split_host_port("example.org:443"), Some(("example.org", 443)));
        assert_eq!(split_host_port("[2001:db8::1]:53"), Some(("2001:db8::1", 53)));
        assert_eq!(split_host_port("example.org"), None);
        assert_eq!(split_host_port(":443"), None);
    }

    #[test]
    fn ipv6_target_detection() {
        assert!(is_ipv6_target("[::1]:443"));
        assert!(!is_ipv6_target("10.0.0.1:443"));
        assert!(!is_ipv6_target("example.org:443"));
    }

    #[tokio::test]
    async fn resolve_literal_without_dns() {
        let sa = resolve_socket_addr(" 127.0.0.1:9000 ").await.unwrap();
        assert_eq!(sa, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }
}
