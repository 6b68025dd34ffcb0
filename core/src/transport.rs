use async_trait::async_trait;
use futures::stream::BoxStream;
use libp2p::Multiaddr;
#[cfg(test)]
use mockall::automock;
use std::{fmt, io};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::types::{ConnectedAddrs, ConnectionId, Direction};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;

/// Byte stream produced by a transport.
pub trait ConnectionIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ConnectionIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn ConnectionIo>;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("Address {0} is not supported by the transport")]
	UnsupportedAddress(Multiaddr),
	#[error("Connection to {0} refused")]
	ConnectionRefused(Multiaddr),
	#[error("Address {0} is already in use")]
	AddressInUse(Multiaddr),
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

/// Metadata shared by every stage of a connection.
#[derive(Clone, Debug)]
pub struct RawConnectionInfo {
	pub id: ConnectionId,
	pub direction: Direction,
	pub addrs: ConnectedAddrs,
	/// Name of the transport that produced the connection
	pub transport: &'static str,
}

/// Unauthenticated, unmultiplexed byte stream.
///
/// Dropping it closes the underlying socket.
pub struct RawConnection {
	info: RawConnectionInfo,
	io: BoxedIo,
}

impl RawConnection {
	pub fn new(
		direction: Direction,
		addrs: ConnectedAddrs,
		transport: &'static str,
		io: impl ConnectionIo,
	) -> Self {
		Self {
			info: RawConnectionInfo {
				id: ConnectionId::next(),
				direction,
				addrs,
				transport,
			},
			io: Box::new(io),
		}
	}

	pub fn info(&self) -> &RawConnectionInfo {
		&self.info
	}

	pub fn id(&self) -> ConnectionId {
		self.info.id
	}

	pub fn direction(&self) -> Direction {
		self.info.direction
	}

	pub fn addrs(&self) -> &ConnectedAddrs {
		&self.info.addrs
	}

	pub fn io_mut(&mut self) -> &mut BoxedIo {
		&mut self.io
	}

	pub fn into_parts(self) -> (RawConnectionInfo, BoxedIo) {
		(self.info, self.io)
	}

	/// Flushes and shuts down the write half before dropping the socket.
	pub async fn close(mut self) {
		if let Err(error) = self.io.shutdown().await {
			trace!(id = %self.info.id, %error, "Shutting down raw connection failed");
		}
	}
}

impl fmt::Debug for RawConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RawConnection")
			.field("info", &self.info)
			.finish_non_exhaustive()
	}
}

/// Active listener: its bound address and the stream of accepted connections.
///
/// Dropping the listener stops accepting and releases the address.
pub struct Listener {
	pub local_addr: Multiaddr,
	pub incoming: BoxStream<'static, Result<RawConnection, TransportError>>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
	/// Short name used in logs and connection metadata
	fn name(&self) -> &'static str;

	/// Returns `true` if the address format is handled by this transport
	fn can_dial(&self, addr: &Multiaddr) -> bool;

	/// Returns `true` if the transport can bind the address, including
	/// unspecified hosts and ports
	fn can_listen(&self, addr: &Multiaddr) -> bool;

	async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError>;

	async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError>;
}
