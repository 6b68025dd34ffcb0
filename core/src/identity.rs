use color_eyre::{eyre::WrapErr, Result};
use libp2p::{
	identity::{Keypair, PublicKey},
	Multiaddr, PeerId,
};
use multihash::{self, Hasher};
use parking_lot::RwLock;
use std::collections::{hash_map::Entry, HashMap};
use tracing::debug;

use crate::types::SecretKey;

#[derive(Default)]
struct PeerRecord {
	keypair: Option<Keypair>,
	public_key: Option<PublicKey>,
	addrs: Vec<Multiaddr>,
}

/// Peer identity store: key material by peer and an in-memory address book.
///
/// Private keys are only ever looked up locally and never leave the store
/// through the network layers.
#[derive(Default)]
pub struct PeerStore {
	peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stores the keypair and returns the peer ID derived from its public key.
	pub fn add_keypair(&self, keypair: Keypair) -> PeerId {
		let public_key = keypair.public();
		let peer_id = public_key.to_peer_id();
		let mut peers = self.peers.write();
		let record = peers.entry(peer_id).or_default();
		record.public_key = Some(public_key);
		record.keypair = Some(keypair);
		peer_id
	}

	pub fn keypair(&self, peer_id: &PeerId) -> Option<Keypair> {
		self.peers
			.read()
			.get(peer_id)
			.and_then(|record| record.keypair.clone())
	}

	/// Stores a public key, keyed by the peer ID it derives.
	pub fn add_public_key(&self, public_key: PublicKey) -> PeerId {
		let peer_id = public_key.to_peer_id();
		self.peers.write().entry(peer_id).or_default().public_key = Some(public_key);
		peer_id
	}

	pub fn public_key(&self, peer_id: &PeerId) -> Option<PublicKey> {
		self.peers
			.read()
			.get(peer_id)
			.and_then(|record| record.public_key.clone())
	}

	/// Adds addresses for a peer, skipping the ones already known.
	pub fn add_addrs(&self, peer_id: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
		let mut peers = self.peers.write();
		let record = peers.entry(peer_id).or_default();
		for addr in addrs {
			if !record.addrs.contains(&addr) {
				record.addrs.push(addr);
			}
		}
	}

	/// Known addresses of a peer, in insertion order.
	pub fn addrs(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
		self.peers
			.read()
			.get(peer_id)
			.map(|record| record.addrs.clone())
			.unwrap_or_default()
	}

	pub fn clear_addrs(&self, peer_id: &PeerId) {
		if let Entry::Occupied(mut entry) = self.peers.write().entry(*peer_id) {
			entry.get_mut().addrs.clear();
		}
	}

	pub fn peers(&self) -> Vec<PeerId> {
		self.peers.read().keys().copied().collect()
	}
}

/// Creates the identity keypair of a local node.
///
/// A seed is hashed with SHA3-256 into an ed25519 secret key, while a key is
/// expected to be a hex encoded ed25519 secret key.
pub fn keypair(secret_key: &SecretKey) -> Result<Keypair> {
	let keypair = match secret_key {
		SecretKey::Seed { seed } => {
			let seed_digest = multihash::Sha3_256::digest(seed.as_bytes());
			Keypair::ed25519_from_bytes(seed_digest).wrap_err("error generating secret key from seed")?
		},
		SecretKey::Key { key } => {
			let mut decoded_key = [0u8; 32];
			hex::decode_to_slice(key.clone().into_bytes(), &mut decoded_key)
				.wrap_err("error decoding secret key from config")?;
			Keypair::ed25519_from_bytes(decoded_key).wrap_err("error importing secret key")?
		},
	};
	Ok(keypair)
}

/// Returns the configured keypair, or a freshly generated one if none is set.
pub fn keypair_or_generate(secret_key: Option<&SecretKey>) -> Result<Keypair> {
	match secret_key {
		Some(secret_key) => keypair(secret_key),
		None => {
			debug!("No secret key configured, generating a random identity");
			Ok(Keypair::generate_ed25519())
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keypair_lookup_by_local_identity() {
		let store = PeerStore::new();
		let keypair = Keypair::generate_ed25519();
		let peer_id = store.add_keypair(keypair.clone());

		assert_eq!(peer_id, keypair.public().to_peer_id());
		assert_eq!(store.public_key(&peer_id), Some(keypair.public()));
		assert_eq!(
			store.keypair(&peer_id).map(|keypair| keypair.public()),
			Some(keypair.public())
		);

		let other = Keypair::generate_ed25519().public();
		let other_id = store.add_public_key(other.clone());
		assert_eq!(store.public_key(&other_id), Some(other));
		assert!(store.keypair(&other_id).is_none());
	}

	#[test]
	fn addresses_are_deduplicated() {
		let store = PeerStore::new();
		let peer_id = Keypair::generate_ed25519().public().to_peer_id();
		let first: Multiaddr = "/memory/1".parse().unwrap();
		let second: Multiaddr = "/memory/2".parse().unwrap();

		store.add_addrs(peer_id, [first.clone(), second.clone()]);
		store.add_addrs(peer_id, [first.clone()]);
		assert_eq!(store.addrs(&peer_id), vec![first, second]);

		store.clear_addrs(&peer_id);
		assert!(store.addrs(&peer_id).is_empty());
		assert!(store.peers().contains(&peer_id));
	}

	#[test]
	fn seed_keypair_is_deterministic() {
		let secret_key = SecretKey::Seed {
			seed: "conngate".to_string(),
		};
		let first = keypair(&secret_key).unwrap();
		let second = keypair(&secret_key).unwrap();
		assert_eq!(first.public(), second.public());
	}

	#[test]
	fn invalid_hex_key_is_rejected() {
		let secret_key = SecretKey::Key {
			key: "not-hex".to_string(),
		};
		assert!(keypair(&secret_key).is_err());
	}
}
