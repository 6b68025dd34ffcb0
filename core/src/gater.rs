use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::{
	any::Any,
	cell::Cell,
	panic::{self, AssertUnwindSafe},
	sync::Arc,
	time::{Duration, Instant},
};
use strum::Display;
use tracing::{debug, error, warn};

use crate::{
	muxer::CapableConnection,
	types::{ConnectedAddrs, Direction, DisconnectReason},
};

mod block_list;

pub use block_list::{BlockList, BlockListConfig};

/// Points in a connection's lifecycle where the gater is consulted, in the
/// order a connection reaches them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Checkpoint {
	Dial,
	PeerDial,
	Accept,
	Secured,
	Upgraded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
	Allow,
	Deny(DisconnectReason),
}

impl Admission {
	pub fn is_allowed(&self) -> bool {
		matches!(self, Admission::Allow)
	}

	pub fn deny_reason(&self) -> Option<DisconnectReason> {
		match self {
			Admission::Allow => None,
			Admission::Deny(reason) => Some(*reason),
		}
	}
}

impl From<bool> for Admission {
	fn from(allow: bool) -> Self {
		if allow {
			Admission::Allow
		} else {
			Admission::Deny(DisconnectReason::Unspecified)
		}
	}
}

/// Admission policy consulted by the swarm and the upgrader.
///
/// Every checkpoint allows by default, so policies only override the
/// checkpoints they care about. Implementations are called concurrently from
/// independent connection pipelines and must synchronize their own state.
/// They must answer quickly: a panic, or an answer that arrives after the
/// configured deadline, is treated as a denial.
///
/// Calls are synchronous and run on the connection's own task. The deadline
/// is checked once the call returns, so it cannot interrupt a call that
/// blocks forever; such a call stalls only the connection it was made for.
pub trait ConnectionGater: Send + Sync {
	/// Called before dialing an address, no I/O has been performed yet.
	fn intercept_dial(&self, _addr: &Multiaddr) -> bool {
		true
	}

	/// Called once per dial operation, before any address of the peer is dialed.
	fn intercept_peer_dial(&self, _peer_id: &PeerId) -> bool {
		true
	}

	/// Called right after a transport accepted a connection, before any
	/// handshake byte is read.
	fn intercept_accept(&self, _addrs: &ConnectedAddrs) -> bool {
		true
	}

	/// Called after the secure handshake verified the remote peer, before the
	/// multiplexer is negotiated.
	fn intercept_secured(
		&self,
		_direction: Direction,
		_peer_id: &PeerId,
		_addrs: &ConnectedAddrs,
	) -> bool {
		true
	}

	/// Called on the fully upgraded connection, before it is handed over.
	///
	/// The reason of a denial is sent to the remote peer on a best-effort basis.
	fn intercept_upgraded(&self, _connection: &dyn CapableConnection) -> Admission {
		Admission::Allow
	}
}

thread_local! {
	static EVALUATING: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` while a gater decision runs on the current thread.
///
/// Panics raised there are caught and turned into denials, so panic hooks can
/// leave them to the gate.
pub fn is_evaluating() -> bool {
	EVALUATING.with(Cell::get)
}

/// Gater used when no policy is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl ConnectionGater for AllowAll {}

/// Fail-closed front of a [`ConnectionGater`].
///
/// The pipeline only talks to the gater through this type, which turns a
/// panicking or late decision into a denial.
#[derive(Clone)]
pub struct Gate {
	gater: Arc<dyn ConnectionGater>,
	deadline: Duration,
}

impl Gate {
	pub fn new(gater: Arc<dyn ConnectionGater>, deadline: Duration) -> Self {
		Self { gater, deadline }
	}

	pub fn check_dial(&self, addr: &Multiaddr) -> Admission {
		self.evaluate(Checkpoint::Dial, |gater| gater.intercept_dial(addr).into())
	}

	pub fn check_peer_dial(&self, peer_id: &PeerId) -> Admission {
		self.evaluate(Checkpoint::PeerDial, |gater| {
			gater.intercept_peer_dial(peer_id).into()
		})
	}

	pub fn check_accept(&self, addrs: &ConnectedAddrs) -> Admission {
		self.evaluate(Checkpoint::Accept, |gater| {
			gater.intercept_accept(addrs).into()
		})
	}

	pub fn check_secured(
		&self,
		direction: Direction,
		peer_id: &PeerId,
		addrs: &ConnectedAddrs,
	) -> Admission {
		self.evaluate(Checkpoint::Secured, |gater| {
			gater.intercept_secured(direction, peer_id, addrs).into()
		})
	}

	pub fn check_upgraded(&self, connection: &dyn CapableConnection) -> Admission {
		self.evaluate(Checkpoint::Upgraded, |gater| {
			gater.intercept_upgraded(connection)
		})
	}

	fn evaluate<F>(&self, checkpoint: Checkpoint, decide: F) -> Admission
	where
		F: FnOnce(&dyn ConnectionGater) -> Admission,
	{
		let started = Instant::now();
		let nested = EVALUATING.with(|evaluating| evaluating.replace(true));
		let decision = panic::catch_unwind(AssertUnwindSafe(|| decide(self.gater.as_ref())));
		EVALUATING.with(|evaluating| evaluating.set(nested));

		let admission = match decision {
			Ok(admission) => admission,
			Err(payload) => {
				error!(
					%checkpoint,
					panic = panic_message(payload.as_ref()),
					"Connection gater panicked, denying connection"
				);
				return Admission::Deny(DisconnectReason::Unspecified);
			},
		};

		let elapsed = started.elapsed();
		if elapsed > self.deadline {
			warn!(
				%checkpoint,
				?elapsed,
				deadline = ?self.deadline,
				"Connection gater missed its deadline, denying connection"
			);
			return Admission::Deny(DisconnectReason::Unspecified);
		}

		if let Admission::Deny(reason) = admission {
			debug!(%checkpoint, %reason, "Connection gater denied connection");
		}
		admission
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("unknown panic")
}
