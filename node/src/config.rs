//! Command-line and file-based configuration.
use std::net::SocketAddr;
use std::path::PathBuf;

use argh::FromArgs;
use serde::Deserialize;

use spv_common::network::Network;

/// Run the SPV daemon.
#[derive(FromArgs, Debug)]
pub struct Options {
    /// bitcoin network to connect to: mainnet, testnet, regtest or signet
    #[argh(option, default = "Network::Mainnet")]
    pub network: Network,

    /// connect only to these peers, skipping discovery
    #[argh(option)]
    pub connect: Vec<SocketAddr>,

    /// addresses to listen for inbound connections on; defaults to the
    /// network's standard port on all interfaces
    #[argh(option)]
    pub listen: Vec<SocketAddr>,

    /// path to a TOML config file overriding these defaults
    #[argh(option)]
    pub config: Option<PathBuf>,

    /// path to the header store, defaults to `headers.db`
    #[argh(option, default = "PathBuf::from(\"headers.db\")")]
    pub headers_db: PathBuf,

    /// path to the peer address book, defaults to `peers.json`
    #[argh(option, default = "PathBuf::from(\"peers.json\")")]
    pub peers_file: PathBuf,
}

/// The subset of [`Options`] that can also come from a TOML file. CLI flags
/// take precedence over file values, which take precedence over defaults.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub network: Option<String>,
    pub connect: Option<Vec<SocketAddr>>,
    pub listen: Option<Vec<SocketAddr>>,
    pub headers_db: Option<PathBuf>,
    pub peers_file: Option<PathBuf>,
}

impl Options {
    /// Load the config file referenced by `--config`, if any, and apply any
    /// values it sets that weren't also given on the command line.
    pub fn load(mut self) -> Result<Self, crate::Error> {
        let Some(path) = self.config.clone() else {
            return Ok(self);
        };
        let text = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&text)?;

        if self.connect.is_empty() {
            if let Some(connect) = file.connect {
                self.connect = connect;
            }
        }
        if self.listen.is_empty() {
            if let Some(listen) = file.listen {
                self.listen = listen;
            }
        }
        if let Some(network) = file.network {
            self.network = network.parse().map_err(|err: String| {
                crate::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
            })?;
        }
        if let Some(headers_db) = file.headers_db {
            self.headers_db = headers_db;
        }
        if let Some(peers_file) = file.peers_file {
            self.peers_file = peers_file;
        }
        Ok(self)
    }
}
