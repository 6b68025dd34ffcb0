use async_stream::stream;
use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr};
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{Listener, RawConnection, Transport, TransportError};
use crate::types::{ConnectedAddrs, Direction};

const NAME: &str = "tcp";

/// Transport over `/ip4/.../tcp/<port>` and `/ip6/.../tcp/<port>` addresses.
#[derive(Clone, Debug)]
pub struct TcpTransport {
	nodelay: bool,
}

impl Default for TcpTransport {
	fn default() -> Self {
		Self { nodelay: true }
	}
}

impl TcpTransport {
	pub fn nodelay(mut self, nodelay: bool) -> Self {
		self.nodelay = nodelay;
		self
	}
}

/// Converts a multiaddress into a socket address, ignoring a trailing `/p2p/<peer_id>`
pub fn multiaddr_to_socketaddr(addr: &Multiaddr) -> Option<SocketAddr> {
	let mut protocols = addr.iter();
	let ip: IpAddr = match protocols.next()? {
		Protocol::Ip4(ip) => ip.into(),
		Protocol::Ip6(ip) => ip.into(),
		_ => return None,
	};
	let Protocol::Tcp(port) = protocols.next()? else {
		return None;
	};
	match protocols.next() {
		None | Some(Protocol::P2p(_)) => Some(SocketAddr::new(ip, port)),
		Some(_) => None,
	}
}

pub fn socketaddr_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
	Multiaddr::from(addr.ip()).with(Protocol::Tcp(addr.port()))
}

#[async_trait]
impl Transport for TcpTransport {
	fn name(&self) -> &'static str {
		NAME
	}

	fn can_dial(&self, addr: &Multiaddr) -> bool {
		multiaddr_to_socketaddr(addr).is_some_and(|socket| {
			!socket.ip().is_unspecified() && socket.port() != 0
		})
	}

	fn can_listen(&self, addr: &Multiaddr) -> bool {
		multiaddr_to_socketaddr(addr).is_some()
	}

	async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
		let socket = multiaddr_to_socketaddr(addr)
			.ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
		let stream = TcpStream::connect(socket).await?;
		if let Err(error) = stream.set_nodelay(self.nodelay) {
			warn!(%addr, %error, "Failed to set TCP_NODELAY");
		}

		let addrs = ConnectedAddrs::new(
			socketaddr_to_multiaddr(&stream.local_addr()?),
			socketaddr_to_multiaddr(&stream.peer_addr()?),
		);
		debug!(%addrs, "Dialed TCP address");
		Ok(RawConnection::new(Direction::Outbound, addrs, NAME, stream))
	}

	async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
		let socket = multiaddr_to_socketaddr(addr)
			.ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
		let listener = TcpListener::bind(socket).await?;
		let local_addr = socketaddr_to_multiaddr(&listener.local_addr()?);
		let nodelay = self.nodelay;

		let listener_addr = local_addr.clone();
		let incoming = stream! {
			loop {
				match listener.accept().await {
					Ok((stream, remote)) => {
						if let Err(error) = stream.set_nodelay(nodelay) {
							warn!(%remote, %error, "Failed to set TCP_NODELAY");
						}
						let local = stream
							.local_addr()
							.map(|local| socketaddr_to_multiaddr(&local))
							.unwrap_or_else(|_| listener_addr.clone());
						let addrs = ConnectedAddrs::new(local, socketaddr_to_multiaddr(&remote));
						yield Ok(RawConnection::new(Direction::Inbound, addrs, NAME, stream));
					},
					Err(error) => yield Err(TransportError::Io(error)),
				}
			}
		};

		Ok(Listener {
			local_addr,
			incoming: Box::pin(incoming),
		})
	}
}
