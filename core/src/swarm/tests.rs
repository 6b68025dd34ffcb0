use super::*;
use crate::{
	gater::Admission,
	muxer::ClosedBy,
	testing::{divulge_addresses, gen_swarm, MockConnectionGater, TestSwarmOptions},
	transport::{memory::memory_multiaddr, MemoryTransport, MockTransport},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
	num::NonZeroUsize,
	sync::atomic::{AtomicBool, Ordering},
	thread,
	time::{Duration, Instant},
};
use tokio::{io::AsyncReadExt, time::timeout};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_matching<F>(events: &mut UnboundedReceiver<SwarmEvent>, matches: F) -> SwarmEvent
where
	F: Fn(&SwarmEvent) -> bool,
{
	timeout(EVENT_TIMEOUT, async {
		loop {
			let event = events.recv().await.expect("event channel open");
			if matches(&event) {
				return event;
			}
		}
	})
	.await
	.expect("expected event in time")
}

/// Memory transport that stalls before dialing one address.
struct StallingTransport {
	inner: MemoryTransport,
	stalled: Multiaddr,
	delay: Duration,
}

#[async_trait]
impl Transport for StallingTransport {
	fn name(&self) -> &'static str {
		"stalling-memory"
	}

	fn can_dial(&self, addr: &Multiaddr) -> bool {
		self.inner.can_dial(addr)
	}

	fn can_listen(&self, addr: &Multiaddr) -> bool {
		self.inner.can_listen(addr)
	}

	async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection, TransportError> {
		if *addr == self.stalled {
			tokio::time::sleep(self.delay).await;
		}
		self.inner.dial(addr).await
	}

	async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
		self.inner.listen(addr).await
	}
}

fn gated(gater: MockConnectionGater) -> TestSwarmOptions {
	TestSwarmOptions {
		gater: Some(Arc::new(gater)),
		..Default::default()
	}
}

fn dial_only() -> TestSwarmOptions {
	TestSwarmOptions {
		dial_only: true,
		..Default::default()
	}
}

#[tokio::test]
async fn dial_establishes_connection_on_both_sides() {
	let (listener, mut listener_events) = gen_swarm(Default::default()).await.unwrap();
	let (dialer, mut dialer_events) = gen_swarm(dial_only()).await.unwrap();
	divulge_addresses(&listener, &dialer);

	let connection = dialer.dial_peer(listener.local_peer_id()).await.unwrap();
	assert_eq!(connection.info().remote_peer, listener.local_peer_id());
	assert!(dialer.is_connected(&listener.local_peer_id()));
	assert_eq!(dialer.connected_peers(), vec![listener.local_peer_id()]);

	next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::ConnectionEstablished { direction: Direction::Outbound, .. })
	})
	.await;
	next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ConnectionEstablished { direction: Direction::Inbound, .. })
	})
	.await;
	assert!(listener.is_connected(&dialer.local_peer_id()));

	// second dial reuses the connection
	let again = dialer.dial_peer(listener.local_peer_id()).await.unwrap();
	assert_eq!(again.info().id, connection.info().id);
	assert_eq!(dialer.connections().len(), 1);
}

#[tokio::test]
async fn denied_dial_never_reaches_transport() {
	let mut transport = MockTransport::new();
	transport.expect_dial().never();
	transport.expect_can_dial().never();
	let (swarm, mut events) = SwarmBuilder::new(Keypair::generate_ed25519())
		.with_transport(transport)
		.with_gater(Arc::new(MockConnectionGater::default().with_dial(|_| false)))
		.build()
		.unwrap();
	let peer = Keypair::generate_ed25519().public().to_peer_id();

	let error = swarm
		.dial_peer_addrs(peer, vec![memory_multiaddr(4242)])
		.await
		.unwrap_err();
	assert!(error.is_gated());
	assert!(matches!(
		error,
		DialError::Gated {
			checkpoint: Checkpoint::Dial,
			..
		}
	));
	assert!(matches!(
		events.recv().await,
		Some(SwarmEvent::ConnectionGated {
			checkpoint: Checkpoint::Dial,
			direction: Direction::Outbound,
			..
		})
	));
}

#[tokio::test]
async fn denied_peer_dial_never_reaches_transport() {
	let mut transport = MockTransport::new();
	transport.expect_dial().never();
	let peer = Keypair::generate_ed25519().public().to_peer_id();
	let (swarm, _events) = SwarmBuilder::new(Keypair::generate_ed25519())
		.with_transport(transport)
		.with_gater(Arc::new(
			MockConnectionGater::default().with_peer_dial(move |denied| *denied != peer),
		))
		.build()
		.unwrap();

	let error = swarm
		.dial_peer_addrs(peer, vec![memory_multiaddr(4242)])
		.await
		.unwrap_err();
	assert!(matches!(
		error,
		DialError::Gated {
			checkpoint: Checkpoint::PeerDial,
			reason: None
		}
	));
}

#[tokio::test]
async fn denied_address_is_skipped_for_allowed_one() {
	let (listener, _listener_events) = gen_swarm(Default::default()).await.unwrap();
	let denied = memory_multiaddr(7);
	let gater = MockConnectionGater::default().with_dial({
		let denied = denied.clone();
		move |addr| *addr != denied
	});
	let (dialer, mut dialer_events) = gen_swarm(TestSwarmOptions {
		dial_only: true,
		..gated(gater)
	})
	.await
	.unwrap();

	let mut addrs = vec![denied.clone()];
	addrs.extend(listener.listen_addresses());
	dialer
		.dial_peer_addrs(listener.local_peer_id(), addrs)
		.await
		.unwrap();

	assert!(dialer.is_connected(&listener.local_peer_id()));
	let event = next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::ConnectionGated { .. })
	})
	.await;
	assert!(matches!(
		event,
		SwarmEvent::ConnectionGated {
			checkpoint: Checkpoint::Dial,
			address: Some(address),
			..
		} if address == denied
	));
}

#[tokio::test]
async fn unreachable_address_falls_through_to_next() {
	let (listener, _listener_events) = gen_swarm(Default::default()).await.unwrap();
	let (dialer, mut dialer_events) = gen_swarm(dial_only()).await.unwrap();

	// nothing listens on the first address
	let unreachable = MemoryTransport::default()
		.listen(&memory_multiaddr(0))
		.await
		.unwrap()
		.local_addr;
	let mut addrs = vec![unreachable.clone()];
	addrs.extend(listener.listen_addresses());

	dialer
		.dial_peer_addrs(listener.local_peer_id(), addrs)
		.await
		.unwrap();

	let event = next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::OutgoingConnectionError { .. })
	})
	.await;
	assert!(matches!(
		event,
		SwarmEvent::OutgoingConnectionError { address, .. } if address == unreachable
	));
}

#[tokio::test]
async fn dial_without_addresses_fails() {
	let (dialer, _events) = gen_swarm(dial_only()).await.unwrap();
	let peer = Keypair::generate_ed25519().public().to_peer_id();

	let error = dialer.dial_peer(peer).await.unwrap_err();
	assert!(matches!(error, DialError::NoAddresses(missing) if missing == peer));
	assert!(!error.is_gated());
}

#[tokio::test]
async fn denied_accept_closes_before_any_byte() {
	let gater = MockConnectionGater::default().with_accept(|_| false);
	let (listener, mut listener_events) = gen_swarm(gated(gater)).await.unwrap();
	let address = listener.listen_addresses().remove(0);

	let mut raw = MemoryTransport::default().dial(&address).await.unwrap();
	let mut buffer = [0u8; 1];
	let read = timeout(EVENT_TIMEOUT, raw.io_mut().read(&mut buffer))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(read, 0);

	next_matching(&mut listener_events, |event| {
		matches!(
			event,
			SwarmEvent::ConnectionGated {
				checkpoint: Checkpoint::Accept,
				direction: Direction::Inbound,
				peer_id: None,
				..
			}
		)
	})
	.await;
	assert!(listener.connections().is_empty());
}

#[tokio::test]
async fn secured_denial_closes_verified_peer() {
	let (dialer, _dialer_events) = gen_swarm(dial_only()).await.unwrap();
	let denied = dialer.local_peer_id();
	let gater =
		MockConnectionGater::default().with_secured(move |_, peer_id, _| *peer_id != denied);
	let (listener, mut listener_events) = gen_swarm(gated(gater)).await.unwrap();
	divulge_addresses(&listener, &dialer);

	let error = dialer
		.dial_peer(listener.local_peer_id())
		.await
		.map(|_| ())
		.unwrap_err();
	assert!(matches!(error, DialError::Failed(_)));

	let event = next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ConnectionGated { .. })
	})
	.await;
	assert!(matches!(
		event,
		SwarmEvent::ConnectionGated {
			checkpoint: Checkpoint::Secured,
			direction: Direction::Inbound,
			peer_id: Some(peer_id),
			reason: None,
			..
		} if peer_id == denied
	));
	assert!(listener.connections().is_empty());
	assert!(!dialer.is_connected(&listener.local_peer_id()));
}

#[tokio::test]
async fn upgraded_denial_sends_reason_to_remote() {
	let gater = MockConnectionGater::default()
		.with_upgraded(|_| Admission::Deny(DisconnectReason::RateLimited));
	let (listener, mut listener_events) = gen_swarm(gated(gater)).await.unwrap();
	let (dialer, mut dialer_events) = gen_swarm(dial_only()).await.unwrap();
	divulge_addresses(&listener, &dialer);

	let connection = dialer.dial_peer(listener.local_peer_id()).await.unwrap();
	let closed = connection.closed().await;
	assert_eq!(closed.by, ClosedBy::Remote);
	assert_eq!(closed.reason.map(DisconnectReason::code), Some(3));

	next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::ConnectionClosed { closed, .. }
			if closed.reason == Some(DisconnectReason::RateLimited))
	})
	.await;
	next_matching(&mut listener_events, |event| {
		matches!(
			event,
			SwarmEvent::ConnectionGated {
				checkpoint: Checkpoint::Upgraded,
				reason: Some(DisconnectReason::RateLimited),
				..
			}
		)
	})
	.await;
	assert!(listener.connections().is_empty());
	assert!(!dialer.is_connected(&listener.local_peer_id()));
}

#[tokio::test]
async fn connection_limit_keeps_first_connection() {
	let (listener, mut listener_events) = gen_swarm(TestSwarmOptions {
		config: SwarmConfig {
			max_connections_per_peer: NonZeroUsize::new(1),
			..Default::default()
		},
		..Default::default()
	})
	.await
	.unwrap();
	let (dialer, mut dialer_events) = gen_swarm(dial_only()).await.unwrap();
	let peer = listener.local_peer_id();
	let addrs = listener.listen_addresses();

	let (first, second) = tokio::join!(
		dialer.dial_peer_addrs(peer, addrs.clone()),
		dialer.dial_peer_addrs(peer, addrs)
	);
	assert_ne!(first.unwrap().info().id, second.unwrap().info().id);

	next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::ConnectionClosed { closed, .. }
			if closed.reason == Some(DisconnectReason::ConnectionLimit))
	})
	.await;
	next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ConnectionEstablished { .. })
	})
	.await;
	assert_eq!(listener.connections_to(&dialer.local_peer_id()).len(), 1);
	assert_eq!(dialer.connections_to(&peer).len(), 1);
}

#[tokio::test]
async fn without_limit_both_connections_are_kept() {
	let (listener, mut listener_events) = gen_swarm(Default::default()).await.unwrap();
	let (dialer, _dialer_events) = gen_swarm(dial_only()).await.unwrap();
	let peer = listener.local_peer_id();
	let addrs = listener.listen_addresses();

	let (first, second) = tokio::join!(
		dialer.dial_peer_addrs(peer, addrs.clone()),
		dialer.dial_peer_addrs(peer, addrs)
	);
	first.unwrap();
	second.unwrap();

	for _ in 0..2 {
		next_matching(&mut listener_events, |event| {
			matches!(event, SwarmEvent::ConnectionEstablished { .. })
		})
		.await;
	}
	assert_eq!(listener.connections_to(&dialer.local_peer_id()).len(), 2);
	assert_eq!(dialer.connections_to(&peer).len(), 2);
}

#[tokio::test]
async fn closing_connection_twice_is_noop() {
	let (listener, mut listener_events) = gen_swarm(Default::default()).await.unwrap();
	let (dialer, mut dialer_events) = gen_swarm(dial_only()).await.unwrap();
	divulge_addresses(&listener, &dialer);

	let connection = dialer.dial_peer(listener.local_peer_id()).await.unwrap();
	let id = connection.info().id;

	assert!(dialer.close_connection(id).await);
	assert!(!dialer.close_connection(id).await);
	connection.close(None).await;
	assert!(connection.is_closed());
	assert!(!dialer.is_connected(&listener.local_peer_id()));

	next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::ConnectionClosed { connection_id, closed, .. }
			if *connection_id == id && closed.by == ClosedBy::Local)
	})
	.await;
	next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ConnectionClosed { closed, .. } if closed.by == ClosedBy::Remote)
	})
	.await;
	assert!(listener.connections().is_empty());
}

#[tokio::test]
async fn race_dial_cancels_slower_attempts() {
	let (listener, _listener_events) = gen_swarm(Default::default()).await.unwrap();
	listener.listen(memory_multiaddr(0)).await.unwrap();
	let addrs = listener.listen_addresses();
	assert_eq!(addrs.len(), 2);

	let delay = Duration::from_millis(500);
	let (dialer, _dialer_events) = SwarmBuilder::new(Keypair::generate_ed25519())
		.with_transport(StallingTransport {
			inner: MemoryTransport::default(),
			stalled: addrs[0].clone(),
			delay,
		})
		.with_config(SwarmConfig {
			dial_policy: DialPolicy::Race,
			..Default::default()
		})
		.build()
		.unwrap();

	let started = Instant::now();
	let connection = dialer
		.dial_peer_addrs(listener.local_peer_id(), addrs.clone())
		.await
		.unwrap();
	// a sequential dial would wait for the stalled address first
	assert!(started.elapsed() < delay);
	assert_eq!(connection.info().addrs.remote, addrs[1]);

	// the stalled attempt was dropped and never reaches the listener
	tokio::time::sleep(delay + Duration::from_millis(200)).await;
	assert_eq!(dialer.connections_to(&listener.local_peer_id()).len(), 1);
	assert_eq!(listener.connections_to(&dialer.local_peer_id()).len(), 1);
}

#[tokio::test]
async fn dialer_upgraded_denial_aborts_whole_dial() {
	let (listener, _listener_events) = gen_swarm(Default::default()).await.unwrap();
	let mut untried = MemoryTransport::default()
		.listen(&memory_multiaddr(0))
		.await
		.unwrap();
	let gater = MockConnectionGater::default()
		.with_upgraded(|_| Admission::Deny(DisconnectReason::Blocked));
	let (dialer, mut dialer_events) = gen_swarm(TestSwarmOptions {
		dial_only: true,
		..gated(gater)
	})
	.await
	.unwrap();

	let mut addrs = listener.listen_addresses();
	addrs.push(untried.local_addr.clone());
	let error = dialer
		.dial_peer_addrs(listener.local_peer_id(), addrs)
		.await
		.map(|_| ())
		.unwrap_err();

	assert!(matches!(
		error,
		DialError::Gated {
			checkpoint: Checkpoint::Upgraded,
			reason: Some(DisconnectReason::Blocked)
		}
	));
	assert!(dialer.connections().is_empty());
	assert!(timeout(Duration::from_millis(200), untried.incoming.next())
		.await
		.is_err());
	next_matching(&mut dialer_events, |event| {
		matches!(
			event,
			SwarmEvent::ConnectionGated {
				checkpoint: Checkpoint::Upgraded,
				direction: Direction::Outbound,
				reason: Some(DisconnectReason::Blocked),
				..
			}
		)
	})
	.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_accept_decision_does_not_hold_up_other_connections() {
	let stall = Duration::from_millis(600);
	let first_call = Arc::new(AtomicBool::new(true));
	let started = Arc::new(Mutex::new(Vec::<Instant>::new()));
	let gater = MockConnectionGater::default().with_accept({
		let started = started.clone();
		move |_| {
			started.lock().push(Instant::now());
			if first_call.swap(false, Ordering::SeqCst) {
				thread::sleep(stall);
			}
			true
		}
	});
	let (listener, _events) = gen_swarm(TestSwarmOptions {
		config: SwarmConfig {
			gater_deadline: Duration::from_secs(5),
			..Default::default()
		},
		..gated(gater)
	})
	.await
	.unwrap();
	let address = listener.listen_addresses().remove(0);

	let _first = MemoryTransport::default().dial(&address).await.unwrap();
	tokio::time::sleep(Duration::from_millis(20)).await;
	let _second = MemoryTransport::default().dial(&address).await.unwrap();

	timeout(EVENT_TIMEOUT, async {
		while started.lock().len() < 2 {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.unwrap();
	let started = started.lock().clone();
	assert!(started[1] - started[0] < stall / 2);
}

#[tokio::test]
async fn dropping_swarm_closes_its_connections() {
	let (listener, mut listener_events) = gen_swarm(Default::default()).await.unwrap();
	let (dialer, dialer_events) = gen_swarm(dial_only()).await.unwrap();
	divulge_addresses(&listener, &dialer);

	let connection = dialer.dial_peer(listener.local_peer_id()).await.unwrap();
	next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ConnectionEstablished { .. })
	})
	.await;

	drop(connection);
	drop(dialer);
	drop(dialer_events);

	next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ConnectionClosed { closed, .. }
			if closed.by == ClosedBy::Remote && closed.reason == Some(DisconnectReason::Shutdown))
	})
	.await;
	assert!(listener.connections().is_empty());
}

#[tokio::test]
async fn removed_listener_releases_address() {
	let (listener, mut events) = gen_swarm(dial_only()).await.unwrap();
	let listener_id = listener.listen(memory_multiaddr(0)).await.unwrap();
	let address = listener.listen_addresses().remove(0);

	assert!(listener.remove_listener(listener_id));
	assert!(!listener.remove_listener(listener_id));
	assert!(listener.listen_addresses().is_empty());

	next_matching(&mut events, |event| {
		matches!(event, SwarmEvent::ListenerClosed { listener_id: closed, .. } if *closed == listener_id)
	})
	.await;
	assert!(MemoryTransport::default().listen(&address).await.is_ok());
}

#[tokio::test]
async fn shutdown_cancels_pending_upgrades_and_closes_connections() {
	let (listener, mut listener_events) = gen_swarm(Default::default()).await.unwrap();
	let (dialer, mut dialer_events) = gen_swarm(dial_only()).await.unwrap();
	divulge_addresses(&listener, &dialer);
	dialer.dial_peer(listener.local_peer_id()).await.unwrap();

	// never sends a handshake, keeping an inbound upgrade pending
	let address = listener.listen_addresses().remove(0);
	let mut silent = MemoryTransport::default().dial(&address).await.unwrap();

	listener.close().await;
	listener.close().await;

	let mut buffer = vec![];
	let read = timeout(EVENT_TIMEOUT, silent.io_mut().read_to_end(&mut buffer))
		.await
		.unwrap();
	assert!(read.is_ok());

	next_matching(&mut dialer_events, |event| {
		matches!(event, SwarmEvent::ConnectionClosed { closed, .. }
			if closed.reason == Some(DisconnectReason::Shutdown))
	})
	.await;
	next_matching(&mut listener_events, |event| {
		matches!(event, SwarmEvent::ListenerClosed { .. })
	})
	.await;
	assert!(listener.connections().is_empty());
	assert!(listener.listen_addresses().is_empty());
	assert!(matches!(
		listener.dial_peer(dialer.local_peer_id()).await,
		Err(DialError::Shutdown)
	));
	assert!(matches!(
		listener.listen(memory_multiaddr(0)).await,
		Err(ListenError::Shutdown)
	));
}

#[test]
fn build_requires_a_transport() {
	assert!(SwarmBuilder::new(Keypair::generate_ed25519())
		.build()
		.is_err());
}
