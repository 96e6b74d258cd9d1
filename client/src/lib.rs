//! Reactor and client-facing handle for the SPV protocol engine.
//!
//! [`reactor::Reactor`] is the only piece of this workspace that touches a
//! real socket: it drives a sans-I/O [`spv_p2p::fsm::StateMachine`] by
//! performing the [`spv_net::Io`] effects it yields. [`handle::Handle`] is
//! the other side of that reactor, reached over a pair of channels, for
//! library users who want a call-and-wait API rather than raw channels.
#![warn(missing_docs)]
pub mod blockfile;
pub mod error;
pub mod handle;
pub mod reactor;

pub use error::Error;
pub use handle::Handle;
pub use reactor::Reactor;

use std::net::SocketAddr;
use std::thread::JoinHandle;

use spv_common::block::time::AdjustedClock;
use spv_common::network::Network;
use spv_common::p2p::peer;
use spv_net::Reactor as _;
use spv_p2p::fsm::{ChainStore, Command, Event, PeerId, StateMachine};

/// Spawn a reactor on its own thread, driving `state_machine` and listening
/// on `listen_addrs`. Returns a [`Handle`] to talk to it and the
/// [`JoinHandle`] of the reactor thread, which resolves once the reactor
/// stops (normally only on an unrecoverable I/O error).
pub fn spawn<T, P, C>(
    network: Network,
    state_machine: StateMachine<T, P, C>,
    listen_addrs: Vec<SocketAddr>,
) -> Result<(Handle, JoinHandle<Result<(), Error>>), Error>
where
    T: ChainStore + Send + 'static,
    P: peer::Store + Send + 'static,
    C: AdjustedClock<PeerId> + Send + 'static,
{
    let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
    let (event_tx, event_rx) = crossbeam_channel::unbounded::<Event>();

    let mut reactor = Reactor::<T, P, C>::new(network, command_rx, event_tx)?;
    let waker: handle::Waker = {
        let waker = reactor.waker();
        std::sync::Arc::new(move || waker.wake().map_err(Error::from))
    };

    let join = std::thread::spawn(move || reactor.run(state_machine, &listen_addrs));
    let handle = Handle::new(command_tx, event_rx, waker);

    Ok((handle, join))
}
