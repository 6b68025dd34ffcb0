use clap::{command, Parser};
use conngate_core::types::PeerAddress;
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// TCP listen port
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Seed string for libp2p keypair generation
	#[arg(long)]
	pub seed: Option<String>,
	/// ed25519 private key for libp2p keypair generation
	#[arg(long)]
	pub private_key: Option<String>,
	/// Peer to dial on startup, as `<multiaddr>/p2p/<peer_id>` (repeatable)
	#[arg(long = "peer", value_name = "MULTIADDR", value_parser = parse_peer_address)]
	pub peers: Vec<PeerAddress>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}

fn parse_peer_address(value: &str) -> Result<PeerAddress, String> {
	value
		.to_string()
		.try_into()
		.map(PeerAddress::Compact)
		.map_err(|error| format!("{error}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case(&["conngate-node"] => (None, 0, false) ; "No flags")]
	#[test_case(&["conngate-node", "--port", "4001", "--logs-json"] => (Some(4001), 0, true) ; "Port and json logs")]
	#[test_case(&["conngate-node", "--peer", "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWStAKPADXqJ7cngPYXd2mSANpdgh1xQ34aouufHA2xShz"] => (None, 1, false) ; "Single peer")]
	fn test_cli_options(args: &[&str]) -> (Option<u16>, usize, bool) {
		let opts = CliOpts::try_parse_from(args).unwrap();
		(opts.port, opts.peers.len(), opts.logs_json)
	}

	#[test]
	fn invalid_peer_is_rejected() {
		assert!(CliOpts::try_parse_from(["conngate-node", "--peer", "/ip4/127.0.0.1/tcp/4001"]).is_err());
	}
}
