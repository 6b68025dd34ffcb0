use conngate_core::{
	gater::BlockListConfig,
	muxer::FrameMuxConfig,
	swarm::SwarmConfig,
	types::{tracing_level_format, PeerAddress, SecretKey},
};
use libp2p::{multiaddr::Protocol, Multiaddr};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::Level;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// Secret key used to generate the node keypair. Can be either `seed` or `key`.
	/// If not set, a random keypair is generated on every start (default: None).
	pub secret_key: Option<SecretKey>,
	/// IP address to listen on (default: 0.0.0.0).
	pub listen_ip: IpAddr,
	/// TCP port to listen on (default: 37000).
	pub port: u16,
	/// Peers dialed on startup, as `<multiaddr>/p2p/<peer_id>` strings or `(peer_id, multiaddr)` tuples (default: []).
	pub peers: Vec<PeerAddress>,
	#[serde(flatten)]
	pub swarm: SwarmConfig,
	#[serde(flatten)]
	pub mux: FrameMuxConfig,
	#[serde(flatten)]
	pub block_list: BlockListConfig,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			log_level: Level::INFO,
			log_format_json: false,
			secret_key: None,
			listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			port: 37000,
			peers: vec![],
			swarm: SwarmConfig::default(),
			mux: FrameMuxConfig::default(),
			block_list: BlockListConfig::default(),
		}
	}
}

impl RuntimeConfig {
	pub fn tcp_multiaddress(&self) -> Multiaddr {
		Multiaddr::from(self.listen_ip).with(Protocol::Tcp(self.port))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 37000 => "/ip4/0.0.0.0/tcp/37000" ; "Default listen address")]
	#[test_case(IpAddr::V4(Ipv4Addr::LOCALHOST), 4001 => "/ip4/127.0.0.1/tcp/4001" ; "Loopback")]
	fn test_tcp_multiaddress(listen_ip: IpAddr, port: u16) -> String {
		let config = RuntimeConfig {
			listen_ip,
			port,
			..Default::default()
		};
		config.tcp_multiaddress().to_string()
	}
}
