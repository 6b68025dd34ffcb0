use libp2p::PeerId;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
	gater::{Admission, Checkpoint, Gate},
	identity::PeerStore,
	muxer::{negotiate, CapableConnection, MuxerError, NegotiationError, StreamMuxer},
	security::{HandshakeError, SecureTransport},
	transport::RawConnection,
	types::{Direction, DisconnectReason},
};

#[derive(Debug, Error)]
pub enum UpgradeError {
	#[error("Secure handshake failed: {0}")]
	Handshake(#[from] HandshakeError),
	#[error("Muxer negotiation failed: {0}")]
	Negotiation(#[from] NegotiationError),
	#[error("Muxer upgrade failed: {0}")]
	Muxer(#[from] MuxerError),
	#[error("Connection from {peer_id} denied at {checkpoint} checkpoint")]
	Gated {
		checkpoint: Checkpoint,
		peer_id: PeerId,
		/// Reason sent to the remote, only for denials of upgraded connections
		reason: Option<DisconnectReason>,
	},
	#[error("No keypair for local peer {0}")]
	MissingKey(PeerId),
	#[error("Dialed peer {expected}, but remote is {actual}")]
	PeerMismatch { expected: PeerId, actual: PeerId },
	#[error("Remote peer is the local peer")]
	SelfConnection,
	#[error("Connection upgrade timed out")]
	Timeout,
}

impl UpgradeError {
	/// Returns `true` if the connection was refused by the gater rather than
	/// failing on its own.
	pub fn is_gated(&self) -> bool {
		matches!(self, UpgradeError::Gated { .. })
	}
}

/// Turns raw connections into capable ones, consulting the gater after the
/// secure handshake and after the multiplexer is set up.
///
/// Keeps no per-connection state, clones share the same collaborators.
#[derive(Clone)]
pub struct Upgrader {
	local_peer: PeerId,
	peer_store: Arc<PeerStore>,
	security: Arc<dyn SecureTransport>,
	muxers: Arc<[Arc<dyn StreamMuxer>]>,
	gate: Gate,
	timeout: Duration,
}

impl Upgrader {
	pub fn new(
		local_peer: PeerId,
		peer_store: Arc<PeerStore>,
		security: Arc<dyn SecureTransport>,
		muxers: Vec<Arc<dyn StreamMuxer>>,
		gate: Gate,
		timeout: Duration,
	) -> Self {
		Self {
			local_peer,
			peer_store,
			security,
			muxers: muxers.into(),
			gate,
			timeout,
		}
	}

	pub fn local_peer(&self) -> PeerId {
		self.local_peer
	}

	/// Upgrades a dialed connection, failing unless the remote proves to be
	/// `expected_peer`.
	#[instrument(level = "debug", skip_all, fields(id = %raw.id(), remote = %raw.addrs().remote, %expected_peer))]
	pub async fn upgrade_outbound(
		&self,
		raw: RawConnection,
		expected_peer: PeerId,
	) -> Result<Box<dyn CapableConnection>, UpgradeError> {
		debug_assert_eq!(raw.direction(), Direction::Outbound);
		tokio::time::timeout(self.timeout, self.upgrade(raw, Some(expected_peer)))
			.await
			.map_err(|_| UpgradeError::Timeout)?
	}

	#[instrument(level = "debug", skip_all, fields(id = %raw.id(), remote = %raw.addrs().remote))]
	pub async fn upgrade_inbound(
		&self,
		raw: RawConnection,
	) -> Result<Box<dyn CapableConnection>, UpgradeError> {
		debug_assert_eq!(raw.direction(), Direction::Inbound);
		tokio::time::timeout(self.timeout, self.upgrade(raw, None))
			.await
			.map_err(|_| UpgradeError::Timeout)?
	}

	async fn upgrade(
		&self,
		raw: RawConnection,
		expected_peer: Option<PeerId>,
	) -> Result<Box<dyn CapableConnection>, UpgradeError> {
		let keypair = self
			.peer_store
			.keypair(&self.local_peer)
			.ok_or(UpgradeError::MissingKey(self.local_peer))?;
		let direction = raw.direction();

		let mut secured = self.security.secure(raw, &keypair).await?;
		let remote_peer = secured.remote_peer();
		if remote_peer == self.local_peer {
			return Err(UpgradeError::SelfConnection);
		}
		if let Some(expected) = expected_peer.filter(|expected| *expected != remote_peer) {
			return Err(UpgradeError::PeerMismatch {
				expected,
				actual: remote_peer,
			});
		}
		self.peer_store
			.add_public_key(secured.remote_public_key().clone());

		if !self
			.gate
			.check_secured(direction, &remote_peer, secured.addrs())
			.is_allowed()
		{
			secured.into_raw().close().await;
			return Err(UpgradeError::Gated {
				checkpoint: Checkpoint::Secured,
				peer_id: remote_peer,
				reason: None,
			});
		}

		let muxer = negotiate(&mut secured, &self.muxers).await?;
		let connection = muxer.upgrade(secured).await?;

		if let Admission::Deny(reason) = self.gate.check_upgraded(connection.as_ref()) {
			connection.close(Some(reason)).await;
			return Err(UpgradeError::Gated {
				checkpoint: Checkpoint::Upgraded,
				peer_id: remote_peer,
				reason: Some(reason),
			});
		}

		debug!(
			%remote_peer,
			muxer = connection.info().muxer_protocol,
			"Connection upgraded"
		);
		Ok(connection)
	}
}
