//! Dialing, listening and the registry of active connections.
//!
//! The swarm enforces the dial, peer dial and accept checkpoints itself and
//! hands raw connections to the [`Upgrader`] for the remaining ones. Only
//! connections that pass every checkpoint are registered.

use color_eyre::{eyre::eyre, Result};
use futures::{future::join_all, stream, StreamExt};
use libp2p::{identity::Keypair, Multiaddr, PeerId};
use parking_lot::RwLock;
use std::{
	collections::{HashMap, HashSet},
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
	gater::{AllowAll, Checkpoint, ConnectionGater, Gate},
	identity::PeerStore,
	muxer::{CapableConnection, Closed, FrameMux, StreamMuxer},
	security::{SecureTransport, SignedHandshake},
	transport::{Listener, RawConnection, Transport, TransportError},
	types::{ConnectedAddrs, ConnectionId, Direction, DisconnectReason},
	upgrader::{UpgradeError, Upgrader},
	utils::spawn_in_span,
};

mod config;
#[cfg(test)]
mod tests;

pub use config::{DialPolicy, SwarmConfig};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
	fn next() -> Self {
		ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ListenerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "listener-{}", self.0)
	}
}

/// Failure of a single dial attempt to one address.
#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("Transport error: {0}")]
	Transport(#[from] TransportError),
	#[error("Upgrade error: {0}")]
	Upgrade(#[from] UpgradeError),
	#[error("Dial timed out")]
	Timeout,
}

#[derive(Debug, Error)]
pub enum DialError {
	#[error("Dial denied at {checkpoint} checkpoint")]
	Gated {
		checkpoint: Checkpoint,
		reason: Option<DisconnectReason>,
	},
	#[error("Peer {0} is the local peer")]
	LocalPeer(PeerId),
	#[error("No known addresses for peer {0}")]
	NoAddresses(PeerId),
	#[error("All {} dial attempts failed", .0.len())]
	Failed(Vec<(Multiaddr, Arc<ConnectError>)>),
	#[error("Connection limit reached for peer {0}")]
	ConnectionLimit(PeerId),
	#[error("Swarm is shut down")]
	Shutdown,
}

impl DialError {
	/// Returns `true` if the dial was refused by the gater.
	pub fn is_gated(&self) -> bool {
		matches!(self, DialError::Gated { .. })
	}
}

#[derive(Debug, Error)]
pub enum ListenError {
	#[error("No transport supports address {0}")]
	UnsupportedAddress(Multiaddr),
	#[error("Transport error: {0}")]
	Transport(#[from] TransportError),
	#[error("Swarm is shut down")]
	Shutdown,
}

#[derive(Debug)]
pub enum SwarmEvent {
	NewListenAddr {
		listener_id: ListenerId,
		address: Multiaddr,
	},
	ListenerClosed {
		listener_id: ListenerId,
		address: Multiaddr,
	},
	ConnectionEstablished {
		connection_id: ConnectionId,
		peer_id: PeerId,
		direction: Direction,
		addrs: ConnectedAddrs,
	},
	ConnectionClosed {
		connection_id: ConnectionId,
		peer_id: PeerId,
		direction: Direction,
		closed: Closed,
	},
	/// Connection or dial refused at one of the checkpoints
	ConnectionGated {
		checkpoint: Checkpoint,
		direction: Direction,
		peer_id: Option<PeerId>,
		address: Option<Multiaddr>,
		reason: Option<DisconnectReason>,
	},
	IncomingConnectionError {
		addrs: ConnectedAddrs,
		error: UpgradeError,
	},
	OutgoingConnectionError {
		peer_id: PeerId,
		address: Multiaddr,
		error: Arc<ConnectError>,
	},
}

struct ListenerEntry {
	address: Multiaddr,
	cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
	connections: HashMap<ConnectionId, Arc<dyn CapableConnection>>,
	listeners: HashMap<ListenerId, ListenerEntry>,
}

struct Inner {
	local_peer: PeerId,
	peer_store: Arc<PeerStore>,
	transports: Vec<Arc<dyn Transport>>,
	upgrader: Upgrader,
	gate: Gate,
	config: SwarmConfig,
	registry: RwLock<Registry>,
	events: UnboundedSender<SwarmEvent>,
	shutdown: CancellationToken,
}

impl Drop for Inner {
	fn drop(&mut self) {
		// stops listeners and closes the connections still registered
		self.shutdown.cancel();
	}
}

pub struct SwarmBuilder {
	keypair: Keypair,
	peer_store: Arc<PeerStore>,
	gater: Arc<dyn ConnectionGater>,
	security: Arc<dyn SecureTransport>,
	muxers: Vec<Arc<dyn StreamMuxer>>,
	transports: Vec<Arc<dyn Transport>>,
	config: SwarmConfig,
}

impl SwarmBuilder {
	pub fn new(keypair: Keypair) -> Self {
		Self {
			keypair,
			peer_store: Arc::new(PeerStore::new()),
			gater: Arc::new(AllowAll),
			security: Arc::new(SignedHandshake),
			muxers: vec![],
			transports: vec![],
			config: SwarmConfig::default(),
		}
	}

	pub fn with_peer_store(mut self, peer_store: Arc<PeerStore>) -> Self {
		self.peer_store = peer_store;
		self
	}

	pub fn with_gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
		self.gater = gater;
		self
	}

	pub fn with_security(mut self, security: impl SecureTransport + 'static) -> Self {
		self.security = Arc::new(security);
		self
	}

	/// Adds a muxer; muxers are offered in the order they were added.
	pub fn with_muxer(mut self, muxer: impl StreamMuxer + 'static) -> Self {
		self.muxers.push(Arc::new(muxer));
		self
	}

	pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
		self.transports.push(Arc::new(transport));
		self
	}

	pub fn with_config(mut self, config: SwarmConfig) -> Self {
		self.config = config;
		self
	}

	pub fn build(self) -> Result<(Swarm, UnboundedReceiver<SwarmEvent>)> {
		if self.transports.is_empty() {
			return Err(eyre!("At least one transport is required"));
		}
		if self.config.upgrade_timeout.is_zero() || self.config.dial_timeout.is_zero() {
			return Err(eyre!("Dial and upgrade timeouts must be greater than zero"));
		}

		let muxers = if self.muxers.is_empty() {
			vec![Arc::new(FrameMux::default()) as Arc<dyn StreamMuxer>]
		} else {
			self.muxers
		};
		let local_peer = self.peer_store.add_keypair(self.keypair);
		let gate = Gate::new(self.gater, self.config.gater_deadline);
		let upgrader = Upgrader::new(
			local_peer,
			self.peer_store.clone(),
			self.security,
			muxers,
			gate.clone(),
			self.config.upgrade_timeout,
		);
		let (events_tx, events_rx) = mpsc::unbounded_channel();

		info!(%local_peer, "Swarm created");
		let inner = Inner {
			local_peer,
			peer_store: self.peer_store,
			transports: self.transports,
			upgrader,
			gate,
			config: self.config,
			registry: RwLock::new(Registry::default()),
			events: events_tx,
			shutdown: CancellationToken::new(),
		};
		Ok((
			Swarm {
				inner: Arc::new(inner),
			},
			events_rx,
		))
	}
}

/// Handle to the connection pipeline of the local peer.
///
/// Cloning is cheap, all clones share the same state.
#[derive(Clone)]
pub struct Swarm {
	inner: Arc<Inner>,
}

impl Swarm {
	pub fn local_peer_id(&self) -> PeerId {
		self.inner.local_peer
	}

	pub fn peer_store(&self) -> Arc<PeerStore> {
		self.inner.peer_store.clone()
	}

	pub fn connections(&self) -> Vec<Arc<dyn CapableConnection>> {
		let mut connections: Vec<_> = self
			.inner
			.registry
			.read()
			.connections
			.values()
			.cloned()
			.collect();
		connections.sort_by_key(|connection| connection.info().id);
		connections
	}

	/// Connections to the peer, oldest first.
	pub fn connections_to(&self, peer_id: &PeerId) -> Vec<Arc<dyn CapableConnection>> {
		let mut connections: Vec<_> = self
			.inner
			.registry
			.read()
			.connections
			.values()
			.filter(|connection| connection.info().remote_peer == *peer_id)
			.cloned()
			.collect();
		connections.sort_by_key(|connection| connection.info().id);
		connections
	}

	pub fn connected_peers(&self) -> Vec<PeerId> {
		let registry = self.inner.registry.read();
		let peers: HashSet<PeerId> = registry
			.connections
			.values()
			.map(|connection| connection.info().remote_peer)
			.collect();
		peers.into_iter().collect()
	}

	pub fn is_connected(&self, peer_id: &PeerId) -> bool {
		self.inner
			.registry
			.read()
			.connections
			.values()
			.any(|connection| connection.info().remote_peer == *peer_id)
	}

	pub fn listen_addresses(&self) -> Vec<Multiaddr> {
		self.inner
			.registry
			.read()
			.listeners
			.values()
			.map(|listener| listener.address.clone())
			.collect()
	}

	/// Dials the peer on the addresses known by the peer store.
	pub async fn dial_peer(&self, peer_id: PeerId) -> Result<Arc<dyn CapableConnection>, DialError> {
		let addrs = self.inner.peer_store.addrs(&peer_id);
		self.dial_peer_addrs(peer_id, addrs).await
	}

	/// Dials the peer on the given addresses, following the configured dial
	/// policy. An existing connection to the peer is returned without dialing.
	///
	/// A denial at the secured or upgraded checkpoint aborts the whole dial,
	/// other failures move on to the next address.
	#[instrument(level = "debug", skip(self, addrs), fields(local_peer = %self.inner.local_peer))]
	pub async fn dial_peer_addrs(
		&self,
		peer_id: PeerId,
		addrs: Vec<Multiaddr>,
	) -> Result<Arc<dyn CapableConnection>, DialError> {
		if self.inner.shutdown.is_cancelled() {
			return Err(DialError::Shutdown);
		}
		if peer_id == self.inner.local_peer {
			return Err(DialError::LocalPeer(peer_id));
		}
		if let Some(connection) = self.connections_to(&peer_id).into_iter().next() {
			trace!(id = %connection.info().id, "Reusing existing connection");
			return Ok(connection);
		}

		if !self.inner.gate.check_peer_dial(&peer_id).is_allowed() {
			self.emit_gated(Checkpoint::PeerDial, Direction::Outbound, Some(peer_id), None, None);
			return Err(DialError::Gated {
				checkpoint: Checkpoint::PeerDial,
				reason: None,
			});
		}
		if addrs.is_empty() {
			return Err(DialError::NoAddresses(peer_id));
		}

		let allowed: Vec<Multiaddr> = addrs
			.into_iter()
			.filter(|addr| {
				let allowed = self.inner.gate.check_dial(addr).is_allowed();
				if !allowed {
					self.emit_gated(
						Checkpoint::Dial,
						Direction::Outbound,
						Some(peer_id),
						Some(addr.clone()),
						None,
					);
				}
				allowed
			})
			.collect();
		if allowed.is_empty() {
			return Err(DialError::Gated {
				checkpoint: Checkpoint::Dial,
				reason: None,
			});
		}

		let shutdown = self.inner.shutdown.clone();
		let connection = tokio::select! {
			_ = shutdown.cancelled() => return Err(DialError::Shutdown),
			result = self.dial_addrs(peer_id, allowed) => result?,
		};

		match self.register(connection).await {
			Some(connection) => Ok(connection),
			None if self.inner.shutdown.is_cancelled() => Err(DialError::Shutdown),
			None => self
				.connections_to(&peer_id)
				.into_iter()
				.next()
				.ok_or(DialError::ConnectionLimit(peer_id)),
		}
	}

	async fn dial_addrs(
		&self,
		peer_id: PeerId,
		addrs: Vec<Multiaddr>,
	) -> Result<Box<dyn CapableConnection>, DialError> {
		let mut failures = vec![];

		match self.inner.config.dial_policy {
			DialPolicy::Sequential => {
				for addr in addrs {
					match self.dial_addr(peer_id, &addr).await {
						Ok(connection) => return Ok(connection),
						Err(error) => self.dial_failed(peer_id, addr, error, &mut failures)?,
					}
				}
			},
			DialPolicy::Race => {
				let concurrency = self.inner.config.dial_concurrency_factor.get() as usize;
				let mut attempts = stream::iter(addrs)
					.map(|addr| async move {
						let result = self.dial_addr(peer_id, &addr).await;
						(addr, result)
					})
					.buffer_unordered(concurrency);

				// returning drops the pending attempts, closing their connections
				while let Some((addr, result)) = attempts.next().await {
					match result {
						Ok(connection) => return Ok(connection),
						Err(error) => self.dial_failed(peer_id, addr, error, &mut failures)?,
					}
				}
			},
		}

		Err(DialError::Failed(failures))
	}

	#[instrument(level = "trace", skip(self))]
	async fn dial_addr(
		&self,
		peer_id: PeerId,
		addr: &Multiaddr,
	) -> Result<Box<dyn CapableConnection>, ConnectError> {
		let transport = self
			.transport_for(addr)
			.ok_or_else(|| TransportError::UnsupportedAddress(addr.clone()))?;
		let raw = tokio::time::timeout(self.inner.config.dial_timeout, transport.dial(addr))
			.await
			.map_err(|_| ConnectError::Timeout)??;
		Ok(self.inner.upgrader.upgrade_outbound(raw, peer_id).await?)
	}

	fn dial_failed(
		&self,
		peer_id: PeerId,
		address: Multiaddr,
		error: ConnectError,
		failures: &mut Vec<(Multiaddr, Arc<ConnectError>)>,
	) -> Result<(), DialError> {
		if let ConnectError::Upgrade(UpgradeError::Gated {
			checkpoint, reason, ..
		}) = error
		{
			self.emit_gated(
				checkpoint,
				Direction::Outbound,
				Some(peer_id),
				Some(address),
				reason,
			);
			return Err(DialError::Gated { checkpoint, reason });
		}

		debug!(%peer_id, %address, %error, "Dial attempt failed");
		let error = Arc::new(error);
		self.emit(SwarmEvent::OutgoingConnectionError {
			peer_id,
			address: address.clone(),
			error: error.clone(),
		});
		failures.push((address, error));
		Ok(())
	}

	/// Starts accepting connections on the address.
	pub async fn listen(&self, addr: Multiaddr) -> Result<ListenerId, ListenError> {
		if self.inner.shutdown.is_cancelled() {
			return Err(ListenError::Shutdown);
		}
		let transport = self
			.inner
			.transports
			.iter()
			.find(|transport| transport.can_listen(&addr))
			.ok_or_else(|| ListenError::UnsupportedAddress(addr.clone()))?;
		let listener = transport.listen(&addr).await?;

		let listener_id = ListenerId::next();
		let address = listener.local_addr.clone();
		let cancel = self.inner.shutdown.child_token();
		self.inner.registry.write().listeners.insert(
			listener_id,
			ListenerEntry {
				address: address.clone(),
				cancel: cancel.clone(),
			},
		);
		info!(%listener_id, %address, "Listening");
		self.emit(SwarmEvent::NewListenAddr {
			listener_id,
			address,
		});

		spawn_in_span(accept_loop(
			Arc::downgrade(&self.inner),
			listener_id,
			listener,
			cancel,
		));
		Ok(listener_id)
	}

	/// Stops the listener and releases its address. Returns `false` for an
	/// unknown listener.
	pub fn remove_listener(&self, listener_id: ListenerId) -> bool {
		let Some(listener) = self.inner.registry.write().listeners.remove(&listener_id) else {
			return false;
		};
		listener.cancel.cancel();
		true
	}

	/// Closes the connection and removes it from the active set. Closing an
	/// unknown or already closed connection does nothing.
	pub async fn close_connection(&self, connection_id: ConnectionId) -> bool {
		let Some(connection) = self
			.inner
			.registry
			.write()
			.connections
			.remove(&connection_id)
		else {
			return false;
		};
		connection.close(None).await;
		true
	}

	/// Shuts the swarm down: cancels in-flight pipelines, stops listeners and
	/// closes every connection. Later calls do nothing.
	pub async fn close(&self) {
		if self.inner.shutdown.is_cancelled() {
			return;
		}
		info!("Shutting down swarm");
		self.inner.shutdown.cancel();

		let connections: Vec<_> = {
			let mut registry = self.inner.registry.write();
			registry.listeners.clear();
			registry.connections.drain().map(|(_, connection)| connection).collect()
		};
		join_all(
			connections
				.iter()
				.map(|connection| connection.close(Some(DisconnectReason::Shutdown))),
		)
		.await;
	}

	fn transport_for(&self, addr: &Multiaddr) -> Option<Arc<dyn Transport>> {
		self.inner
			.transports
			.iter()
			.find(|transport| transport.can_dial(addr))
			.cloned()
	}

	/// Runs the inbound pipeline in its own task, so a slow gater or handshake
	/// never holds up the listener.
	fn handle_inbound(&self, raw: RawConnection) {
		let swarm = self.clone();
		spawn_in_span(async move {
			let addrs = raw.addrs().clone();
			if !swarm.inner.gate.check_accept(&addrs).is_allowed() {
				swarm.emit_gated(
					Checkpoint::Accept,
					Direction::Inbound,
					None,
					Some(addrs.remote),
					None,
				);
				// dropped before any byte is read
				drop(raw);
				return;
			}

			let shutdown = swarm.inner.shutdown.clone();
			let result = tokio::select! {
				_ = shutdown.cancelled() => return,
				result = swarm.inner.upgrader.upgrade_inbound(raw) => result,
			};

			match result {
				Ok(connection) => {
					swarm.register(connection).await;
				},
				Err(UpgradeError::Gated {
					checkpoint,
					peer_id,
					reason,
				}) => swarm.emit_gated(
					checkpoint,
					Direction::Inbound,
					Some(peer_id),
					Some(addrs.remote),
					reason,
				),
				Err(error) => {
					debug!(%addrs, %error, "Inbound connection failed");
					swarm.emit(SwarmEvent::IncomingConnectionError { addrs, error });
				},
			}
		});
	}

	/// Adds the connection to the active set and watches it until it closes.
	///
	/// Returns `None` if the connection was closed instead, because the swarm
	/// is shut down or the peer reached its connection limit.
	async fn register(
		&self,
		connection: Box<dyn CapableConnection>,
	) -> Option<Arc<dyn CapableConnection>> {
		let connection: Arc<dyn CapableConnection> = connection.into();
		let info = connection.info().clone();

		let refusal = {
			let mut registry = self.inner.registry.write();
			let connected = registry
				.connections
				.values()
				.filter(|existing| existing.info().remote_peer == info.remote_peer)
				.count();
			if self.inner.shutdown.is_cancelled() {
				Some(DisconnectReason::Shutdown)
			} else if self
				.inner
				.config
				.max_connections_per_peer
				.is_some_and(|limit| connected >= limit.get())
			{
				Some(DisconnectReason::ConnectionLimit)
			} else {
				registry.connections.insert(info.id, connection.clone());
				None
			}
		};

		if let Some(reason) = refusal {
			debug!(id = %info.id, peer_id = %info.remote_peer, %reason, "Closing surplus connection");
			connection.close(Some(reason)).await;
			return None;
		}

		info!(
			id = %info.id,
			peer_id = %info.remote_peer,
			direction = %info.direction,
			addrs = %info.addrs,
			"Connection established"
		);
		self.emit(SwarmEvent::ConnectionEstablished {
			connection_id: info.id,
			peer_id: info.remote_peer,
			direction: info.direction,
			addrs: info.addrs.clone(),
		});

		let inner = Arc::downgrade(&self.inner);
		let shutdown = self.inner.shutdown.clone();
		let watched = connection.clone();
		spawn_in_span(async move {
			let closed = tokio::select! {
				closed = watched.closed() => closed,
				// also fires once the last swarm handle is dropped
				_ = shutdown.cancelled() => {
					watched.close(Some(DisconnectReason::Shutdown)).await;
					watched.closed().await
				},
			};
			drop(watched);
			let Some(inner) = inner.upgrade() else {
				return;
			};
			inner.registry.write().connections.remove(&info.id);
			debug!(id = %info.id, by = ?closed.by, reason = ?closed.reason, "Connection closed");
			let _ = inner.events.send(SwarmEvent::ConnectionClosed {
				connection_id: info.id,
				peer_id: info.remote_peer,
				direction: info.direction,
				closed,
			});
		});

		Some(connection)
	}

	fn emit_gated(
		&self,
		checkpoint: Checkpoint,
		direction: Direction,
		peer_id: Option<PeerId>,
		address: Option<Multiaddr>,
		reason: Option<DisconnectReason>,
	) {
		self.emit(SwarmEvent::ConnectionGated {
			checkpoint,
			direction,
			peer_id,
			address,
			reason,
		});
	}

	fn emit(&self, event: SwarmEvent) {
		// receiver may be gone, events are best-effort
		let _ = self.inner.events.send(event);
	}
}

async fn accept_loop(
	inner: Weak<Inner>,
	listener_id: ListenerId,
	mut listener: Listener,
	cancel: CancellationToken,
) {
	let address = listener.local_addr.clone();
	loop {
		let next = tokio::select! {
			_ = cancel.cancelled() => break,
			next = listener.incoming.next() => next,
		};
		let Some(inner) = inner.upgrade() else {
			break;
		};
		match next {
			Some(Ok(raw)) => Swarm { inner }.handle_inbound(raw),
			Some(Err(error)) => warn!(%listener_id, %error, "Accepting connection failed"),
			None => break,
		}
	}
	drop(listener);

	let Some(inner) = inner.upgrade() else {
		return;
	};
	inner.registry.write().listeners.remove(&listener_id);
	info!(%listener_id, %address, "Listener closed");
	let _ = inner.events.send(SwarmEvent::ListenerClosed {
		listener_id,
		address,
	});
}
