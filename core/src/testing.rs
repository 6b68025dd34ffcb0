//! Helpers for tests that need real swarms or scripted gating decisions.

use color_eyre::{eyre::WrapErr, Result};
use libp2p::{identity::Keypair, Multiaddr, PeerId};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
	gater::{Admission, ConnectionGater},
	muxer::CapableConnection,
	swarm::{Swarm, SwarmBuilder, SwarmConfig, SwarmEvent},
	transport::{memory::memory_multiaddr, MemoryTransport},
	types::{ConnectedAddrs, Direction},
};

/// Gater whose decisions are closures, allowing everything by default.
pub struct MockConnectionGater {
	pub dial: Box<dyn Fn(&Multiaddr) -> bool + Send + Sync>,
	pub peer_dial: Box<dyn Fn(&PeerId) -> bool + Send + Sync>,
	pub accept: Box<dyn Fn(&ConnectedAddrs) -> bool + Send + Sync>,
	pub secured: Box<dyn Fn(Direction, &PeerId, &ConnectedAddrs) -> bool + Send + Sync>,
	pub upgraded: Box<dyn Fn(&dyn CapableConnection) -> Admission + Send + Sync>,
}

impl Default for MockConnectionGater {
	fn default() -> Self {
		Self {
			dial: Box::new(|_| true),
			peer_dial: Box::new(|_| true),
			accept: Box::new(|_| true),
			secured: Box::new(|_, _, _| true),
			upgraded: Box::new(|_| Admission::Allow),
		}
	}
}

impl MockConnectionGater {
	pub fn with_dial(mut self, dial: impl Fn(&Multiaddr) -> bool + Send + Sync + 'static) -> Self {
		self.dial = Box::new(dial);
		self
	}

	pub fn with_peer_dial(
		mut self,
		peer_dial: impl Fn(&PeerId) -> bool + Send + Sync + 'static,
	) -> Self {
		self.peer_dial = Box::new(peer_dial);
		self
	}

	pub fn with_accept(
		mut self,
		accept: impl Fn(&ConnectedAddrs) -> bool + Send + Sync + 'static,
	) -> Self {
		self.accept = Box::new(accept);
		self
	}

	pub fn with_secured(
		mut self,
		secured: impl Fn(Direction, &PeerId, &ConnectedAddrs) -> bool + Send + Sync + 'static,
	) -> Self {
		self.secured = Box::new(secured);
		self
	}

	pub fn with_upgraded(
		mut self,
		upgraded: impl Fn(&dyn CapableConnection) -> Admission + Send + Sync + 'static,
	) -> Self {
		self.upgraded = Box::new(upgraded);
		self
	}
}

impl ConnectionGater for MockConnectionGater {
	fn intercept_dial(&self, addr: &Multiaddr) -> bool {
		(self.dial)(addr)
	}

	fn intercept_peer_dial(&self, peer_id: &PeerId) -> bool {
		(self.peer_dial)(peer_id)
	}

	fn intercept_accept(&self, addrs: &ConnectedAddrs) -> bool {
		(self.accept)(addrs)
	}

	fn intercept_secured(&self, direction: Direction, peer_id: &PeerId, addrs: &ConnectedAddrs) -> bool {
		(self.secured)(direction, peer_id, addrs)
	}

	fn intercept_upgraded(&self, connection: &dyn CapableConnection) -> Admission {
		(self.upgraded)(connection)
	}
}

#[derive(Default)]
pub struct TestSwarmOptions {
	/// Skips listening, the swarm can only dial
	pub dial_only: bool,
	pub gater: Option<Arc<dyn ConnectionGater>>,
	pub config: SwarmConfig,
}

/// Builds a swarm on the process-wide memory transport, listening on a free
/// port unless it is dial only.
pub async fn gen_swarm(options: TestSwarmOptions) -> Result<(Swarm, UnboundedReceiver<SwarmEvent>)> {
	let mut builder = SwarmBuilder::new(Keypair::generate_ed25519())
		.with_transport(MemoryTransport::default())
		.with_config(options.config);
	if let Some(gater) = options.gater {
		builder = builder.with_gater(gater);
	}
	let (swarm, events) = builder.build()?;

	if !options.dial_only {
		swarm
			.listen(memory_multiaddr(0))
			.await
			.wrap_err("Listening on memory transport failed")?;
	}
	Ok((swarm, events))
}

/// Makes `to` aware of the addresses `from` listens on.
pub fn divulge_addresses(from: &Swarm, to: &Swarm) {
	to.peer_store()
		.add_addrs(from.local_peer_id(), from.listen_addresses());
}
