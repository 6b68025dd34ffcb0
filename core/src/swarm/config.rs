use serde::{Deserialize, Serialize};
use std::{
	num::{NonZeroU8, NonZeroUsize},
	time::Duration,
};
use strum::Display;

use crate::types::{duration_millis_format, duration_seconds_format};

/// How the addresses of a peer are tried during a single dial operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DialPolicy {
	/// One address at a time, in the given order, stopping at the first success
	#[default]
	Sequential,
	/// Concurrent attempts bounded by the dial concurrency factor, first success wins
	Race,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
	/// Time limit for securing and multiplexing a connection, in seconds (default: 10)
	#[serde(with = "duration_seconds_format")]
	pub upgrade_timeout: Duration,
	/// Time limit for establishing a transport connection to one address, in seconds (default: 10)
	#[serde(with = "duration_seconds_format")]
	pub dial_timeout: Duration,
	/// Time the connection gater has to decide, in milliseconds (default: 100).
	/// Later decisions are treated as denials.
	#[serde(with = "duration_millis_format")]
	pub gater_deadline: Duration,
	/// Dial policy, `sequential` or `race` (default: sequential)
	pub dial_policy: DialPolicy,
	/// Maximum concurrent dial attempts per dial operation with the race policy (default: 8)
	pub dial_concurrency_factor: NonZeroU8,
	/// Maximum number of retained connections per peer. Surplus connections
	/// are closed with the connection limit reason (default: unlimited)
	pub max_connections_per_peer: Option<NonZeroUsize>,
}

impl Default for SwarmConfig {
	fn default() -> Self {
		Self {
			upgrade_timeout: Duration::from_secs(10),
			dial_timeout: Duration::from_secs(10),
			gater_deadline: Duration::from_millis(100),
			dial_policy: DialPolicy::Sequential,
			dial_concurrency_factor: NonZeroU8::new(8).unwrap_or(NonZeroU8::MIN),
			max_connections_per_peer: None,
		}
	}
}
