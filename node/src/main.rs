//! Standalone SPV daemon: wires together the header store, the protocol
//! engine and the reactor, and blocks logging events until it is killed.
mod config;
mod error;
mod store;

pub use error::Error;

use std::net::SocketAddr;

use spv_common::bitcoin::blockdata::block::BlockHeader;
use spv_common::block::store::{File, Store as _};
use spv_common::block::time::{AdjustedTime, LocalTime};
use spv_common::p2p::peer::Store as _;

use store::AddressBook;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!(target: "node", "fatal: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let options: config::Options = argh::from_env();
    let options = options.load()?;

    let network = options.network;
    let genesis: BlockHeader = network.genesis();

    let store = match File::<BlockHeader>::create(&options.headers_db, genesis) {
        Ok(store) => store,
        Err(spv_common::block::store::Error::Io(err))
            if err.kind() == std::io::ErrorKind::AlreadyExists =>
        {
            File::open(&options.headers_db, genesis)?
        }
        Err(err) => return Err(err.into()),
    };

    if store.check().is_err() {
        log::warn!(target: "node", "header store is corrupt, attempting to heal");
        store.heal()?;
    }

    let checkpoints: Vec<_> = network.checkpoints().collect();
    let cache = spv_chain::BlockCache::from(store, network.params(), &checkpoints)?;

    let clock = AdjustedTime::<SocketAddr>::new(LocalTime::now());

    let peers = if !options.connect.is_empty() {
        AddressBook::from(&options.connect)
    } else {
        match AddressBook::load(&options.peers_file) {
            Ok(book) if !book.is_empty() => book,
            _ => AddressBook::bootstrap(network.seeds(), network.port())?,
        }
    };

    let listen_addrs = if options.listen.is_empty() {
        vec![SocketAddr::from(([0, 0, 0, 0], network.port()))]
    } else {
        options.listen.clone()
    };

    let config = spv_p2p::fsm::Config::from(network, options.connect.clone());
    let state_machine = spv_p2p::fsm::StateMachine::new(cache, peers, clock, config);

    log::info!(target: "node", "starting on {} ({:?})", network.as_str(), listen_addrs);

    let (handle, join) = spv_client::spawn(network, state_machine, listen_addrs)?;

    for event in handle.events().iter() {
        log::debug!(target: "node", "{:?}", event);
    }

    join.join().expect("reactor thread panicked")?;
    Ok(())
}
