use async_trait::async_trait;
use futures::Stream;
use libp2p::{multiaddr::Protocol, Multiaddr};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use std::{
	collections::HashMap,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};
use tokio::{
	io::DuplexStream,
	sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::debug;

use super::{Listener, RawConnection, Transport, TransportError};
use crate::types::{ConnectedAddrs, Direction};

const NAME: &str = "memory";
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

static GLOBAL_HUB: Lazy<MemoryHub> = Lazy::new(MemoryHub::default);

struct PendingConnection {
	io: DuplexStream,
	remote_addr: Multiaddr,
}

/// Registry of in-process listeners, keyed by `/memory/<port>`.
#[derive(Clone, Default)]
pub struct MemoryHub {
	listeners: Arc<Mutex<HashMap<u64, UnboundedSender<PendingConnection>>>>,
}

impl MemoryHub {
	fn register(
		&self,
		port: u64,
	) -> Result<(u64, UnboundedReceiver<PendingConnection>), TransportError> {
		let mut listeners = self.listeners.lock();
		let port = match port {
			0 => loop {
				let candidate = rand::thread_rng().gen_range(1..u64::MAX);
				if !listeners.contains_key(&candidate) {
					break candidate;
				}
			},
			port if listeners.contains_key(&port) => {
				return Err(TransportError::AddressInUse(memory_multiaddr(port)))
			},
			port => port,
		};

		let (sender, receiver) = mpsc::unbounded_channel();
		listeners.insert(port, sender);
		Ok((port, receiver))
	}

	fn unregister(&self, port: u64) {
		self.listeners.lock().remove(&port);
	}

	fn sender(&self, port: u64) -> Option<UnboundedSender<PendingConnection>> {
		self.listeners.lock().get(&port).cloned()
	}
}

/// In-process transport over `tokio::io::duplex` pipes.
pub struct MemoryTransport {
	hub: MemoryHub,
	buffer_size: usize,
}

impl Default for MemoryTransport {
	/// Transport attached to the process-wide hub.
	fn default() -> Self {
		Self::new(GLOBAL_HUB.clone())
	}
}

impl MemoryTransport {
	pub fn new(hub: MemoryHub) -> Self {
		Self {
			hub,
			buffer_size: DEFAULT_BUFFER_SIZE,
		}
	}

	pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
		self.buffer_size = buffer_size;
		self
	}
}

pub fn memory_multiaddr(port: u64) -> Multiaddr {
	Multiaddr::empty().with(Protocol::Memory(port))
}

fn memory_port(addr: &Multiaddr) -> Option<u64> {
	let mut protocols = addr.iter();
	match (protocols.next(), protocols.next()) {
		(Some(Protocol::Memory(port)), None) => Some(port),
		_ => None,
	}
}

#[async_trait]
impl Transport for MemoryTransport {
	fn name(&self) -> &'static str {
		NAME
	}

	fn can_dial(&self, addr: &Multiaddr) -> bool {
		memory_port(addr).is_some_and(|port| port != 0)
	}

	fn can_listen(&self, addr: &Multiaddr) -> bool {
		memory_port(addr).is_some()
	}

	async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
		let port = memory_port(addr)
			.filter(|port| *port != 0)
			.ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
		let sender = self
			.hub
			.sender(port)
			.ok_or_else(|| TransportError::ConnectionRefused(addr.clone()))?;

		let (local, remote) = tokio::io::duplex(self.buffer_size);
		let local_addr = memory_multiaddr(rand::thread_rng().gen_range(1..u64::MAX));
		sender
			.send(PendingConnection {
				io: remote,
				remote_addr: local_addr.clone(),
			})
			.map_err(|_| TransportError::ConnectionRefused(addr.clone()))?;

		debug!(%addr, "Dialed memory listener");
		Ok(RawConnection::new(
			Direction::Outbound,
			ConnectedAddrs::new(local_addr, addr.clone()),
			NAME,
			local,
		))
	}

	async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
		let port =
			memory_port(addr).ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
		let (port, receiver) = self.hub.register(port)?;
		let local_addr = memory_multiaddr(port);

		let incoming = MemoryIncoming {
			receiver,
			hub: self.hub.clone(),
			port,
			local_addr: local_addr.clone(),
		};

		Ok(Listener {
			local_addr,
			incoming: Box::pin(incoming),
		})
	}
}

struct MemoryIncoming {
	receiver: UnboundedReceiver<PendingConnection>,
	hub: MemoryHub,
	port: u64,
	local_addr: Multiaddr,
}

impl Stream for MemoryIncoming {
	type Item = Result<RawConnection, TransportError>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let local_addr = self.local_addr.clone();
		self.receiver.poll_recv(cx).map(|pending| {
			pending.map(|PendingConnection { io, remote_addr }| {
				Ok(RawConnection::new(
					Direction::Inbound,
					ConnectedAddrs::new(local_addr, remote_addr),
					NAME,
					io,
				))
			})
		})
	}
}

impl Drop for MemoryIncoming {
	fn drop(&mut self) {
		self.hub.unregister(self.port);
	}
}
