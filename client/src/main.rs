//! Conngate node: listens on TCP, dials configured peers and gates
//! connections with a block list.

use crate::{cli::CliOpts, config::RuntimeConfig};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use conngate_core::{
	gater::BlockList,
	identity,
	muxer::FrameMux,
	swarm::{Swarm, SwarmBuilder, SwarmEvent},
	transport::TcpTransport,
	types::SecretKey,
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};
use libp2p::{Multiaddr, PeerId};
use std::{fs, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, warn, Level};

mod cli;
mod config;

async fn run(cfg: RuntimeConfig, shutdown: CancellationToken) -> Result<()> {
	let version = clap::crate_version!();
	info!("Running Conngate node version: {version}.");
	debug!("Using config: {cfg:?}");

	let keypair = identity::keypair_or_generate(cfg.secret_key.as_ref())
		.wrap_err("Unable to create node keypair")?;
	let block_list = Arc::new(BlockList::from(&cfg.block_list));

	let (swarm, mut events) = SwarmBuilder::new(keypair)
		.with_transport(TcpTransport::default())
		.with_muxer(FrameMux::new(cfg.mux.clone()))
		.with_gater(block_list)
		.with_config(cfg.swarm.clone())
		.build()
		.wrap_err("Unable to build swarm")?;
	info!(peer_id = %swarm.local_peer_id(), "Local peer identity");

	swarm
		.listen(cfg.tcp_multiaddress())
		.await
		.wrap_err("Listening on TCP not to fail.")?;

	for peer in &cfg.peers {
		let (peer_id, addr): (PeerId, Multiaddr) = peer.into();
		swarm.peer_store().add_addrs(peer_id, [addr]);
		spawn_in_span(dial(swarm.clone(), peer_id));
	}

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			event = events.recv() => match event {
				Some(event) => log_event(&event),
				None => break,
			},
		}
	}

	swarm.close().await;
	Ok(())
}

async fn dial(swarm: Swarm, peer_id: PeerId) {
	match swarm.dial_peer(peer_id).await {
		Ok(connection) => info!(%peer_id, id = %connection.info().id, "Peer dialed"),
		Err(error) if error.is_gated() => info!(%peer_id, %error, "Dial denied by block list"),
		Err(error) => warn!(%peer_id, %error, "Dialing peer failed"),
	}
}

fn log_event(event: &SwarmEvent) {
	match event {
		SwarmEvent::NewListenAddr { address, .. } => info!(%address, "Listening"),
		SwarmEvent::ListenerClosed { address, .. } => info!(%address, "Listener closed"),
		SwarmEvent::ConnectionEstablished {
			peer_id,
			direction,
			addrs,
			..
		} => info!(%peer_id, %direction, %addrs, "Connection established"),
		SwarmEvent::ConnectionClosed {
			peer_id, closed, ..
		} => info!(%peer_id, by = ?closed.by, reason = ?closed.reason, "Connection closed"),
		SwarmEvent::ConnectionGated {
			checkpoint,
			direction,
			peer_id,
			address,
			..
		} => info!(%checkpoint, %direction, ?peer_id, ?address, "Connection gated"),
		SwarmEvent::IncomingConnectionError { addrs, error } => {
			debug!(%addrs, %error, "Incoming connection failed")
		},
		SwarmEvent::OutgoingConnectionError {
			peer_id,
			address,
			error,
		} => debug!(%peer_id, %address, %error, "Outgoing connection failed"),
	}
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {}", config_path))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(port) = opts.port {
		cfg.port = port;
	}
	if let Some(secret_key) = &opts.private_key {
		cfg.secret_key = Some(SecretKey::Key {
			key: secret_key.to_string(),
		});
	}
	if let Some(seed) = &opts.seed {
		cfg.secret_key = Some(SecretKey::Seed {
			seed: seed.to_string(),
		})
	}
	cfg.peers.extend(opts.peers.iter().cloned());

	Ok(cfg)
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = CancellationToken::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	let panic_shutdown = shutdown.clone();
	install_panic_hooks(move || panic_shutdown.cancel())?;

	let span = span!(Level::INFO, "run", version = clap::crate_version!());
	// Do not enter span if logs format is not JSON
	let _enter = if cfg.log_format_json {
		Some(span.enter())
	} else {
		None
	};

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	let signal_shutdown = shutdown.clone();
	spawn_in_span(async move {
		if let Err(error) = tokio::signal::ctrl_c().await {
			error!(%error, "Unable to listen for shutdown signal");
		}
		info!("User signaled shutdown");
		signal_shutdown.cancel();
	});

	if let Err(error) = run(cfg, shutdown).await {
		error!("{error:#}");
		return Err(error.wrap_err("Running Conngate node failed"));
	};

	Ok(())
}
