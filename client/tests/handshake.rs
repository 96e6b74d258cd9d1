//! End-to-end test: two reactors, talking over real loopback TCP sockets,
//! complete a version/verack handshake and each report the other as a
//! negotiated peer.
use std::net::SocketAddr;
use std::time::Duration;

use spv_common::bitcoin::network::constants::ServiceFlags;
use spv_common::bitcoin::BlockHeader;
use spv_common::block::store::Memory;
use spv_common::block::time::{AdjustedTime, LocalTime};
use spv_common::network::Network;
use spv_common::nonempty::NonEmpty;
use spv_common::p2p::peer::{KnownAddress, Source, Store};
use spv_p2p::fsm::{Config, Event, PeerId, StateMachine};

/// A peer address book with nothing in it; both ends of this test dial each
/// other directly rather than relying on discovery.
#[derive(Debug, Default)]
struct EmptyPeerStore;

impl Store for EmptyPeerStore {
    type Iter = std::vec::IntoIter<(SocketAddr, KnownAddress)>;

    fn get(&self, _ip: &std::net::IpAddr) -> Option<&KnownAddress> {
        None
    }

    fn insert(&mut self, _ip: SocketAddr, _ka: KnownAddress) -> bool {
        true
    }

    fn remove(&mut self, _ip: &std::net::IpAddr) -> Option<KnownAddress> {
        None
    }

    fn iter(&self) -> Self::Iter {
        Vec::new().into_iter()
    }

    fn len(&self) -> usize {
        0
    }

    fn mark_success(&mut self, _ip: SocketAddr, _time: LocalTime) {}
    fn mark_attempt(&mut self, _ip: SocketAddr, _time: LocalTime) {}
    fn mark_active(&mut self, _ip: SocketAddr, _time: LocalTime) {}
}

fn cache(n: usize) -> spv_chain::BlockCache<Memory<BlockHeader>> {
    let headers = spv_testutil::block::chain(1, n);
    let store = Memory::new(NonEmpty::from_vec(headers).unwrap());
    spv_chain::BlockCache::from(store, Network::Regtest.params(), &[]).unwrap()
}

fn config(connect: Vec<SocketAddr>) -> Config {
    let mut config = Config::from(Network::Regtest, connect);
    // Neither side in this test claims NODE_NETWORK; relax the requirement
    // so the handshake isn't rejected for missing services.
    config.required_services = ServiceFlags::NONE;
    config
}

fn wait_for<F: Fn(&Event) -> bool>(handle: &spv_client::Handle, predicate: F, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match handle.events().recv_timeout(remaining) {
            Ok(event) if predicate(&event) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

#[test]
fn test_two_reactors_negotiate_over_loopback() {
    let listen_a: SocketAddr = "127.0.0.1:18444".parse().unwrap();
    let listen_b: SocketAddr = "127.0.0.1:18445".parse().unwrap();

    let clock_a = AdjustedTime::<PeerId>::new(LocalTime::now());
    let clock_b = AdjustedTime::<PeerId>::new(LocalTime::now());

    let sm_a = StateMachine::new(cache(3), EmptyPeerStore, clock_a, config(vec![]));
    let sm_b = StateMachine::new(cache(3), EmptyPeerStore, clock_b, config(vec![]));

    let (handle_a, _join_a) = spv_client::spawn(Network::Regtest, sm_a, vec![listen_a]).unwrap();
    let (handle_b, _join_b) = spv_client::spawn(Network::Regtest, sm_b, vec![listen_b]).unwrap();

    // Give both listeners a moment to bind before dialing.
    std::thread::sleep(Duration::from_millis(100));
    handle_a.connect(listen_b).unwrap();

    let a_saw_b = wait_for(
        &handle_a,
        |event| matches!(event, Event::PeerNegotiated { addr, .. } if *addr == listen_b),
        Duration::from_secs(5),
    );
    let b_saw_a = wait_for(
        &handle_b,
        |event| matches!(event, Event::PeerNegotiated { .. }),
        Duration::from_secs(5),
    );

    assert!(a_saw_b, "dialing side never negotiated with the accepting side");
    assert!(b_saw_a, "accepting side never negotiated with the dialing side");

    let peers_a = handle_a.get_peers(ServiceFlags::NONE).unwrap();
    assert_eq!(peers_a.len(), 1);
}

#[test]
fn test_disconnect_command_drops_peer() {
    let listen_a: SocketAddr = "127.0.0.1:18446".parse().unwrap();
    let listen_b: SocketAddr = "127.0.0.1:18447".parse().unwrap();

    let clock_a = AdjustedTime::<PeerId>::new(LocalTime::now());
    let clock_b = AdjustedTime::<PeerId>::new(LocalTime::now());

    let sm_a = StateMachine::new(cache(3), EmptyPeerStore, clock_a, config(vec![]));
    let sm_b = StateMachine::new(cache(3), EmptyPeerStore, clock_b, config(vec![]));

    let (handle_a, _join_a) = spv_client::spawn(Network::Regtest, sm_a, vec![listen_a]).unwrap();
    let (handle_b, _join_b) = spv_client::spawn(Network::Regtest, sm_b, vec![listen_b]).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    handle_a.connect(listen_b).unwrap();
    assert!(wait_for(
        &handle_a,
        |event| matches!(event, Event::PeerNegotiated { .. }),
        Duration::from_secs(5),
    ));

    handle_a.disconnect(listen_b).unwrap();
    assert!(wait_for(
        &handle_a,
        |event| matches!(event, Event::PeerDisconnected { addr, .. } if *addr == listen_b),
        Duration::from_secs(5),
    ));
}

#[test]
fn test_shutdown_stops_the_reactor_thread() {
    let listen: SocketAddr = "127.0.0.1:18448".parse().unwrap();
    let clock = AdjustedTime::<PeerId>::new(LocalTime::now());
    let sm = StateMachine::new(cache(1), EmptyPeerStore, clock, config(vec![]));

    let (handle, join) = spv_client::spawn(Network::Regtest, sm, vec![listen]).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    handle.shutdown().unwrap();
    join.join()
        .expect("reactor thread panicked")
        .expect("reactor should exit cleanly on shutdown");
}
