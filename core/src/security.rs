use async_trait::async_trait;
use libp2p::{
	identity::{DecodingError, Keypair, PublicKey, SigningError},
	PeerId,
};
use std::{fmt, io};
use thiserror::Error;

use crate::{
	transport::{RawConnection, RawConnectionInfo},
	types::{ConnectedAddrs, Direction},
};

mod signed;

pub use signed::SignedHandshake;

#[derive(Debug, Error)]
pub enum HandshakeError {
	#[error("I/O error during handshake: {0}")]
	Io(#[from] io::Error),
	#[error("Remote speaks {0}")]
	ProtocolMismatch(String),
	#[error("Invalid remote public key: {0}")]
	InvalidPublicKey(#[from] DecodingError),
	#[error("Invalid remote nonce")]
	InvalidNonce,
	#[error("Remote signature verification failed")]
	InvalidSignature,
	#[error("Signing failed: {0}")]
	Signing(#[from] SigningError),
}

/// Raw connection whose remote peer identity has been verified.
///
/// The remote identity is derived from the public key the remote proved it
/// owns, and cannot change afterwards.
pub struct SecuredConnection {
	raw: RawConnection,
	local_peer: PeerId,
	remote_peer: PeerId,
	remote_public_key: PublicKey,
	protocol: &'static str,
}

impl SecuredConnection {
	pub fn new(
		raw: RawConnection,
		local_peer: PeerId,
		remote_public_key: PublicKey,
		protocol: &'static str,
	) -> Self {
		Self {
			raw,
			local_peer,
			remote_peer: remote_public_key.to_peer_id(),
			remote_public_key,
			protocol,
		}
	}

	pub fn info(&self) -> &RawConnectionInfo {
		self.raw.info()
	}

	pub fn direction(&self) -> Direction {
		self.raw.direction()
	}

	pub fn addrs(&self) -> &ConnectedAddrs {
		self.raw.addrs()
	}

	pub fn local_peer(&self) -> PeerId {
		self.local_peer
	}

	pub fn remote_peer(&self) -> PeerId {
		self.remote_peer
	}

	pub fn remote_public_key(&self) -> &PublicKey {
		&self.remote_public_key
	}

	pub fn protocol(&self) -> &'static str {
		self.protocol
	}

	pub fn raw_mut(&mut self) -> &mut RawConnection {
		&mut self.raw
	}

	pub fn into_raw(self) -> RawConnection {
		self.raw
	}
}

impl fmt::Debug for SecuredConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SecuredConnection")
			.field("raw", &self.raw)
			.field("remote_peer", &self.remote_peer)
			.field("protocol", &self.protocol)
			.finish_non_exhaustive()
	}
}

/// Secure channel negotiated on top of a raw connection.
#[async_trait]
pub trait SecureTransport: Send + Sync {
	fn protocol(&self) -> &'static str;

	/// Runs the handshake in the raw connection's direction and returns the
	/// connection together with the verified remote identity.
	async fn secure(
		&self,
		raw: RawConnection,
		local_keypair: &Keypair,
	) -> Result<SecuredConnection, HandshakeError>;
}
