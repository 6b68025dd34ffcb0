use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::IpAddr};
use tracing::info;

use super::{Admission, ConnectionGater};
use crate::{
	muxer::CapableConnection,
	types::{ConnectedAddrs, Direction, DisconnectReason},
};

/// Block list configuration (see [`BlockList`] for details)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockListConfig {
	/// Peers that are never dialed and whose connections are closed once their identity is verified (default: empty).
	pub blocked_peers: Vec<PeerId>,
	/// IP addresses that are never dialed and whose inbound connections are closed on accept (default: empty).
	pub blocked_ips: Vec<IpAddr>,
}

/// Deny-list policy over peer identities and IP addresses.
///
/// Each rule is applied at the earliest checkpoint that has the information
/// it needs: IPs at dial and accept, peers at peer dial and secured. Entries
/// can be added and removed while the swarm is running.
#[derive(Default, Debug)]
pub struct BlockList {
	peers: RwLock<HashSet<PeerId>>,
	ips: RwLock<HashSet<IpAddr>>,
}

impl From<&BlockListConfig> for BlockList {
	fn from(cfg: &BlockListConfig) -> Self {
		Self {
			peers: RwLock::new(cfg.blocked_peers.iter().copied().collect()),
			ips: RwLock::new(cfg.blocked_ips.iter().copied().collect()),
		}
	}
}

impl BlockList {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns `true` if the peer was not blocked before.
	pub fn block_peer(&self, peer_id: PeerId) -> bool {
		let inserted = self.peers.write().insert(peer_id);
		if inserted {
			info!(%peer_id, "Peer blocked");
		}
		inserted
	}

	pub fn unblock_peer(&self, peer_id: &PeerId) -> bool {
		self.peers.write().remove(peer_id)
	}

	pub fn block_ip(&self, ip: IpAddr) -> bool {
		let inserted = self.ips.write().insert(ip);
		if inserted {
			info!(%ip, "IP address blocked");
		}
		inserted
	}

	pub fn unblock_ip(&self, ip: &IpAddr) -> bool {
		self.ips.write().remove(ip)
	}

	pub fn is_peer_blocked(&self, peer_id: &PeerId) -> bool {
		self.peers.read().contains(peer_id)
	}

	pub fn is_ip_blocked(&self, ip: &IpAddr) -> bool {
		self.ips.read().contains(ip)
	}

	pub fn blocked_peers(&self) -> Vec<PeerId> {
		self.peers.read().iter().copied().collect()
	}

	fn is_addr_blocked(&self, addr: &Multiaddr) -> bool {
		addr.iter().any(|protocol| match protocol {
			Protocol::Ip4(ip) => self.is_ip_blocked(&ip.into()),
			Protocol::Ip6(ip) => self.is_ip_blocked(&ip.into()),
			Protocol::P2p(peer_id) => self.is_peer_blocked(&peer_id),
			_ => false,
		})
	}
}

impl ConnectionGater for BlockList {
	fn intercept_dial(&self, addr: &Multiaddr) -> bool {
		!self.is_addr_blocked(addr)
	}

	fn intercept_peer_dial(&self, peer_id: &PeerId) -> bool {
		!self.is_peer_blocked(peer_id)
	}

	fn intercept_accept(&self, addrs: &ConnectedAddrs) -> bool {
		!self.is_addr_blocked(&addrs.remote)
	}

	fn intercept_secured(
		&self,
		_direction: Direction,
		peer_id: &PeerId,
		addrs: &ConnectedAddrs,
	) -> bool {
		!self.is_peer_blocked(peer_id) && !self.is_addr_blocked(&addrs.remote)
	}

	fn intercept_upgraded(&self, connection: &dyn CapableConnection) -> Admission {
		if self.is_peer_blocked(&connection.info().remote_peer) {
			return Admission::Deny(DisconnectReason::Blocked);
		}
		Admission::Allow
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use libp2p::identity::Keypair;
	use test_case::test_case;

	fn peer() -> PeerId {
		Keypair::generate_ed25519().public().to_peer_id()
	}

	#[test_case("/ip4/10.0.0.1/tcp/37000" => false ; "Blocked IPv4")]
	#[test_case("/ip4/10.0.0.2/tcp/37000" => true ; "Other IPv4")]
	#[test_case("/ip6/fe80::1/tcp/37000" => false ; "Blocked IPv6")]
	#[test_case("/memory/10" => true ; "Memory address")]
	fn test_intercept_dial(addr: &str) -> bool {
		let block_list = BlockList::from(&BlockListConfig {
			blocked_peers: vec![],
			blocked_ips: vec!["10.0.0.1".parse().unwrap(), "fe80::1".parse().unwrap()],
		});
		block_list.intercept_dial(&addr.parse().unwrap())
	}

	#[test]
	fn blocked_peer_is_denied_at_peer_checkpoints() {
		let blocked = peer();
		let allowed = peer();
		let block_list = BlockList::new();
		assert!(block_list.block_peer(blocked));
		assert!(!block_list.block_peer(blocked));

		let addrs =
			ConnectedAddrs::new("/memory/1".parse().unwrap(), "/memory/2".parse().unwrap());
		assert!(!block_list.intercept_peer_dial(&blocked));
		assert!(!block_list.intercept_secured(Direction::Inbound, &blocked, &addrs));
		assert!(block_list.intercept_peer_dial(&allowed));
		assert!(block_list.intercept_secured(Direction::Outbound, &allowed, &addrs));

		let addr: Multiaddr = format!("/ip4/10.0.0.3/tcp/1/p2p/{blocked}").parse().unwrap();
		assert!(!block_list.intercept_dial(&addr));

		assert!(block_list.unblock_peer(&blocked));
		assert!(block_list.intercept_peer_dial(&blocked));
	}

	#[test]
	fn blocked_ip_is_denied_on_accept() {
		let block_list = BlockList::new();
		block_list.block_ip("192.168.1.7".parse().unwrap());

		let blocked = ConnectedAddrs::new(
			"/ip4/0.0.0.0/tcp/37000".parse().unwrap(),
			"/ip4/192.168.1.7/tcp/50123".parse().unwrap(),
		);
		let allowed = ConnectedAddrs::new(
			"/ip4/0.0.0.0/tcp/37000".parse().unwrap(),
			"/ip4/192.168.1.8/tcp/50123".parse().unwrap(),
		);
		assert!(!block_list.intercept_accept(&blocked));
		assert!(block_list.intercept_accept(&allowed));
	}
}
