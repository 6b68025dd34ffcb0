use async_trait::async_trait;
use bytes::Bytes;
use libp2p::{identity::PublicKey, PeerId};
use std::{fmt, io, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::{
	framing::{read_message, write_message},
	security::SecuredConnection,
	types::{ConnectedAddrs, ConnectionId, Direction, DisconnectReason},
};

mod frame;

pub use frame::{FrameMux, FrameMuxConfig};

const MAX_PROTOCOL_LIST_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum MuxerError {
	#[error("Connection is closed")]
	ConnectionClosed,
	#[error("Stream is closed")]
	StreamClosed,
	#[error("Frame too large: {size} bytes (max: {max})")]
	FrameTooLarge { size: usize, max: usize },
	#[error("Invalid frame kind {0}")]
	InvalidFrame(u8),
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("I/O error during muxer negotiation: {0}")]
	Io(#[from] io::Error),
	#[error("Invalid protocol list received")]
	InvalidProtocolList,
	#[error("No mutual muxer protocol (local: {local:?}, remote: {remote:?})")]
	NoMutualProtocol {
		local: Vec<String>,
		remote: Vec<String>,
	},
}

/// Metadata of a fully upgraded connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
	pub id: ConnectionId,
	pub direction: Direction,
	pub addrs: ConnectedAddrs,
	pub transport: &'static str,
	pub local_peer: PeerId,
	pub remote_peer: PeerId,
	pub remote_public_key: PublicKey,
	pub security_protocol: &'static str,
	pub muxer_protocol: &'static str,
}

impl ConnectionInfo {
	pub fn new(secured: &SecuredConnection, muxer_protocol: &'static str) -> Self {
		let raw = secured.info();
		Self {
			id: raw.id,
			direction: raw.direction,
			addrs: raw.addrs.clone(),
			transport: raw.transport,
			local_peer: secured.local_peer(),
			remote_peer: secured.remote_peer(),
			remote_public_key: secured.remote_public_key().clone(),
			security_protocol: secured.protocol(),
			muxer_protocol,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosedBy {
	Local,
	Remote,
}

/// How a capable connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Closed {
	pub by: ClosedBy,
	/// Reason sent to, or received from the remote
	pub reason: Option<DisconnectReason>,
}

/// Logical stream of a multiplexed connection, with message semantics.
#[async_trait]
pub trait Substream: Send {
	fn id(&self) -> u32;

	async fn send(&mut self, data: Bytes) -> Result<(), MuxerError>;

	/// Next message, or `None` once the stream or the connection is closed.
	async fn recv(&mut self) -> Option<Bytes>;
}

/// Secured connection with an active stream multiplexer.
///
/// Dropping the last handle closes the connection without a reason.
#[async_trait]
pub trait CapableConnection: Send + Sync {
	fn info(&self) -> &ConnectionInfo;

	async fn open_stream(&self) -> Result<Box<dyn Substream>, MuxerError>;

	async fn accept_stream(&self) -> Result<Box<dyn Substream>, MuxerError>;

	/// Closes the connection, first sending the reason to the remote on a
	/// best-effort basis. Closing a closed connection does nothing.
	async fn close(&self, reason: Option<DisconnectReason>);

	fn is_closed(&self) -> bool;

	/// Resolves once the connection is closed, locally or by the remote.
	async fn closed(&self) -> Closed;
}

impl fmt::Debug for dyn CapableConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CapableConnection")
			.field("info", self.info())
			.field("closed", &self.is_closed())
			.finish()
	}
}

#[async_trait]
pub trait StreamMuxer: Send + Sync {
	fn protocol(&self) -> &'static str;

	/// Starts multiplexing over the secured connection, which has already
	/// agreed on this muxer's protocol.
	async fn upgrade(
		&self,
		secured: SecuredConnection,
	) -> Result<Box<dyn CapableConnection>, MuxerError>;
}

/// Picks the protocol both sides support, in the dialer's preference order.
pub fn select_protocol<'a>(
	direction: Direction,
	local: &[&'a str],
	remote: &[&'a str],
) -> Option<&'a str> {
	let (preferred, supported) = match direction {
		Direction::Outbound => (local, remote),
		Direction::Inbound => (remote, local),
	};
	preferred
		.iter()
		.find(|protocol| supported.contains(protocol))
		.copied()
}

/// Exchanges supported muxer protocols over the secured connection and
/// returns the selected muxer.
///
/// Both sides send their list, then compute the same selection locally.
pub(crate) async fn negotiate(
	secured: &mut SecuredConnection,
	muxers: &[Arc<dyn StreamMuxer>],
) -> Result<Arc<dyn StreamMuxer>, NegotiationError> {
	let direction = secured.direction();
	let local: Vec<&str> = muxers.iter().map(|muxer| muxer.protocol()).collect();

	let io = secured.raw_mut().io_mut();
	write_message(io, local.join("\n").as_bytes()).await?;
	io.flush().await?;
	let remote = read_message(io, MAX_PROTOCOL_LIST_SIZE).await?;
	let remote =
		String::from_utf8(remote).map_err(|_| NegotiationError::InvalidProtocolList)?;
	let remote: Vec<&str> = remote
		.split('\n')
		.filter(|protocol| !protocol.is_empty())
		.collect();
	trace!(%direction, ?local, ?remote, "Muxer protocols exchanged");

	let Some(selected) = select_protocol(direction, &local, &remote) else {
		return Err(NegotiationError::NoMutualProtocol {
			local: local.iter().map(ToString::to_string).collect(),
			remote: remote.iter().map(ToString::to_string).collect(),
		});
	};
	debug!(protocol = selected, "Muxer protocol selected");

	muxers
		.iter()
		.find(|muxer| muxer.protocol() == selected)
		.cloned()
		.ok_or(NegotiationError::InvalidProtocolList)
}
