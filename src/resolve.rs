//! Address override for a single target host.
//!
//! `--resolve host:port:addr[,addr...]` replaces name resolution for `host`
//! with a fixed pool of addresses, chosen round-robin on every dial. This
//! fans load for one hostname out across concrete endpoints while the TLS
//! server name and `Host` header still carry the original hostname.

use std::collections::HashSet;
use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::net::TcpStream;
use tracing::{error, trace, warn};

use crate::errors::ConfigError;

/// Round-robin address pool for one overridden hostname.
#[derive(Debug)]
pub struct AddressOverride {
    host: String,
    port: u16,
    addresses: Vec<String>,
    next: AtomicUsize,
    /// Remote addresses already reported for non-matching hosts. Diagnostic
    /// only: it decides whether a warning is logged, nothing else reads it.
    seen: Mutex<HashSet<String>>,
}

impl AddressOverride {
    /// Creates an override. `addresses` must not be empty.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        addresses: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::InvalidResolve {
                spec: format!("{}:{}:{}", host, port, addresses.join(",")),
                reason: "hostname part cannot be empty".to_string(),
            });
        }
        if addresses.is_empty() {
            return Err(ConfigError::InvalidResolve {
                spec: format!("{}:{}:", host, port),
                reason: "at least one override address is required".to_string(),
            });
        }

        Ok(Self {
            host,
            port,
            addresses,
            next: AtomicUsize::new(0),
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Parses a `host:port:addr[,addr...]` spec.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidResolve {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = spec.trim().splitn(3, ':');
        let host = parts.next().unwrap_or_default().trim();
        let port_str = parts.next().ok_or_else(|| invalid("missing port"))?.trim();
        let addrs_str = parts
            .next()
            .ok_or_else(|| invalid("missing override addresses"))?;

        if host.is_empty() {
            return Err(invalid("hostname part cannot be empty"));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|e| invalid(&format!("port '{}' is not a valid u16: {}", port_str, e)))?;

        let mut addresses = Vec::new();
        for addr in addrs_str.split(',') {
            let addr = addr.trim().trim_start_matches('[').trim_end_matches(']');
            if addr.is_empty() {
                return Err(invalid("override address cannot be empty"));
            }
            addresses.push(addr.to_string());
        }

        Self::new(host, port, addresses)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port given in the spec. Dials keep the port of the address being dialed.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Number of selections made so far.
    pub fn selections(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    /// Takes the next pool address. The index advances by exactly one per call.
    pub fn select(&self) -> &str {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        &self.addresses[index % self.addresses.len()]
    }

    /// Remote addresses reported so far for non-matching hosts.
    ///
    /// Best-effort diagnostics: the contents say which warnings were logged,
    /// not how many connections went where.
    pub fn seen_addresses(&self) -> Vec<String> {
        match self.seen.lock() {
            Ok(seen) => seen.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Dials `address` (`host:port`), substituting the next pool address when
    /// the host matches the overridden hostname.
    pub async fn dial(&self, address: &str) -> io::Result<TcpStream> {
        let (host, port) = split_host_port(address)?;

        if host != self.host {
            let stream = TcpStream::connect(address).await?;
            if let Ok(remote) = stream.peer_addr() {
                self.note_unmatched(host, &remote.to_string());
            }
            return Ok(stream);
        }

        let target = join_host_port(self.select(), port);
        trace!(address = %address, target = %target, "Address override dial");

        TcpStream::connect(&target).await.map_err(|e| {
            error!(address = %address, target = %target, error = %e, "Address override dial failed");
            e
        })
    }

    fn note_unmatched(&self, host: &str, remote: &str) {
        let first_time = match self.seen.lock() {
            Ok(mut seen) => seen.insert(remote.to_string()),
            Err(_) => false,
        };
        if first_time {
            warn!(
                override_host = %self.host,
                host = %host,
                remote = %remote,
                "Address override not applied, dialed host directly"
            );
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> io::Result<(&str, u16)> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("missing port in address '{}'", address),
        )
    })?;
    let port = port.parse::<u16>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid port in address '{}': {}", address, e),
        )
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host, port))
}

/// Joins a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn pool(addrs: &[&str]) -> AddressOverride {
        AddressOverride::new(
            "example.com",
            443,
            addrs.iter().map(|a| a.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn parses_single_address() {
        let ao = AddressOverride::parse("example.com:443:10.0.0.1").unwrap();
        assert_eq!(ao.host(), "example.com");
        assert_eq!(ao.port(), 443);
        assert_eq!(ao.addresses(), &["10.0.0.1".to_string()]);
    }

    #[test]
    fn parses_address_pool() {
        let ao = AddressOverride::parse("example.com:443:10.0.0.1, 10.0.0.2,[::1]").unwrap();
        assert_eq!(ao.addresses(), &["10.0.0.1", "10.0.0.2", "::1"]);
    }

    #[test]
    fn parses_ipv6_pool_without_brackets() {
        let ao = AddressOverride::parse("h:80:fe80::1,::1").unwrap();
        assert_eq!(ao.addresses(), &["fe80::1", "::1"]);
    }

    #[test]
    fn rejects_malformed_specs() {
        for spec in [
            "",
            "example.com",
            "example.com:443",
            ":443:10.0.0.1",
            "example.com:http:10.0.0.1",
            "example.com:70000:10.0.0.1",
            "example.com:443:",
            "example.com:443:10.0.0.1,,10.0.0.2",
        ] {
            let err = AddressOverride::parse(spec).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidResolve { .. }),
                "spec {:?} gave {:?}",
                spec,
                err
            );
        }
    }

    #[test]
    fn selects_round_robin() {
        let ao = pool(&["a", "b", "c"]);
        let picks: Vec<String> = (0..7).map(|_| ao.select().to_string()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c", "a"]);
        assert_eq!(ao.selections(), 7);
    }

    #[test]
    fn concurrent_selection_is_balanced() {
        let ao = Arc::new(pool(&["a", "b"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ao = Arc::clone(&ao);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ao.select().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let picks: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ao.selections(), 800);
        assert_eq!(picks.iter().filter(|p| *p == "a").count(), 400);
        assert_eq!(picks.iter().filter(|p| *p == "b").count(), 400);
    }

    #[test]
    fn splits_and_joins_host_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com", 443));
        assert_eq!(split_host_port("[::1]:8080").unwrap(), ("::1", 8080));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("example.com:x").is_err());
        assert_eq!(join_host_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
    }

    #[tokio::test]
    async fn matching_host_dials_pool_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ao = AddressOverride::new("loadtest.invalid", port, vec!["127.0.0.1".to_string()])
            .unwrap();

        let stream = ao
            .dial(&format!("loadtest.invalid:{}", port))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
        assert_eq!(ao.selections(), 1);
    }

    #[tokio::test]
    async fn other_hosts_pass_through_without_selecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ao = pool(&["10.255.255.1"]);

        for _ in 0..3 {
            let stream = ao.dial(&addr.to_string()).await.unwrap();
            assert_eq!(stream.peer_addr().unwrap(), addr);
        }
        assert_eq!(ao.selections(), 0);
        assert_eq!(ao.seen_addresses(), vec![addr.to_string()]);
    }

    #[tokio::test]
    async fn dial_errors_propagate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ao = AddressOverride::new("loadtest.invalid", port, vec!["127.0.0.1".to_string()])
            .unwrap();
        assert!(ao.dial(&format!("loadtest.invalid:{}", port)).await.is_err());
        assert_eq!(ao.selections(), 1);
    }
}
