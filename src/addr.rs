//! `"host:port"` / `"unix:/path"` address parsing.
//!
//! Grounded in the teacher's `net::tcp::TcpStream::connect` which accepts
//! anything implementing `ToSocketAddrs`; this module only adds the
//! `unix:` prefix convention used by `create_listen_sockets` /
//! `create_connect_socket` in `spec.md` §6.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{ConMgrError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(SocketAddr),
    Unix(String),
}

impl Address {
    pub fn family_eq(&self, other: &Address) -> bool {
        match (self, other) {
            (Address::Tcp(a), Address::Tcp(b)) => match (a, b) {
                (SocketAddr::V4(x), SocketAddr::V4(y)) => x.ip() == y.ip() && x.port() == y.port(),
                (SocketAddr::V6(x), SocketAddr::V6(y)) => {
                    x.ip() == y.ip() && x.port() == y.port() && x.scope_id() == y.scope_id()
                }
                _ => false,
            },
            (Address::Unix(a), Address::Unix(b)) => a == b,
            _ => false,
        }
    }
}

/// Parse `"unix:/path"` as a local-domain listener path, anything else as
/// a `host:port` pair to be resolved via `ToSocketAddrs`. Dials and other
/// single-target operations use this: it takes `resolve`'s first address,
/// since connecting out is inherently a single-target operation.
pub fn parse_host_port(spec: &str) -> Result<Address> {
    if let Some(path) = spec.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(ConMgrError::InvalidArgument(format!(
                "empty unix socket path in {:?}",
                spec
            )));
        }
        return Ok(Address::Unix(path.to_string()));
    }

    let addr = resolve(spec)?
        .into_iter()
        .next()
        .ok_or_else(|| ConMgrError::InvalidArgument(format!("no addresses for {:?}", spec)))?;
    Ok(Address::Tcp(addr))
}

/// `"unix:/path"` as a single local-domain listener target, anything else
/// as every address `resolve` returns for `"host:port"` — a hostname that
/// resolves to more than one address (dual-stack A/AAAA, round-robin DNS)
/// gets a listener per address, per `spec.md`'s Listen(TCP) scenario.
pub fn parse_listen_targets(spec: &str) -> Result<Vec<Address>> {
    if let Some(path) = spec.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(ConMgrError::InvalidArgument(format!(
                "empty unix socket path in {:?}",
                spec
            )));
        }
        return Ok(vec![Address::Unix(path.to_string())]);
    }

    Ok(resolve(spec)?.into_iter().map(Address::Tcp).collect())
}

/// Resolve a `host:port` string to every address it maps to. Mirrors
/// `addrinfo_resolve` from `spec.md` §6 using `std::net::ToSocketAddrs`.
pub fn resolve(host_port: &str) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = host_port
        .to_socket_addrs()
        .map_err(|e| ConMgrError::InvalidArgument(format!("{}: {}", host_port, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ConMgrError::InvalidArgument(format!(
            "no addresses for {:?}",
            host_port
        )));
    }
    Ok(addrs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_unix_prefix() {
        assert_eq!(
            parse_host_port("unix:/tmp/e").unwrap(),
            Address::Unix("/tmp/e".to_string())
        );
    }

    #[test]
    fn rejects_empty_unix_path() {
        assert!(parse_host_port("unix:").is_err());
    }

    #[test]
    fn resolves_tcp_host_port() {
        let addr = parse_host_port("127.0.0.1:55555").unwrap();
        assert!(matches!(addr, Address::Tcp(_)));
    }

    #[test]
    fn listen_targets_cover_every_resolved_address() {
        let targets = parse_listen_targets("127.0.0.1:55556").unwrap();
        assert_eq!(targets.len(), 1);
        assert!(matches!(targets[0], Address::Tcp(_)));
    }

    #[test]
    fn listen_targets_unix_is_single_entry() {
        let targets = parse_listen_targets("unix:/tmp/e2").unwrap();
        assert_eq!(targets, vec![Address::Unix("/tmp/e2".to_string())]);
    }
}
