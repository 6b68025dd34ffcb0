use color_eyre::{eyre::eyre, Report};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::{
	fmt,
	str::FromStr,
	sync::atomic::{AtomicU64, Ordering},
	time::Duration,
};
use strum::{Display, FromRepr};

/// Which side initiated a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
	Inbound,
	Outbound,
}

impl Direction {
	pub fn is_outbound(&self) -> bool {
		matches!(self, Direction::Outbound)
	}
}

/// Process-wide unique identifier of a connection, assigned when a transport
/// produces the raw connection and kept through every upgrade stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
	pub fn next() -> Self {
		ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Local and remote addresses of a connection.
///
/// This is everything known about an inbound connection at the accept
/// checkpoint, before any handshake byte has been read.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectedAddrs {
	pub local: Multiaddr,
	pub remote: Multiaddr,
}

impl ConnectedAddrs {
	pub fn new(local: Multiaddr, remote: Multiaddr) -> Self {
		Self { local, remote }
	}
}

impl fmt::Display for ConnectedAddrs {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} <-> {}", self.local, self.remote)
	}
}

/// Code sent to the remote peer when a fully upgraded connection is denied.
///
/// Travels as a big-endian `u16`. Codes unknown to the receiver decode to
/// [`DisconnectReason::Unspecified`].
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize,
)]
#[repr(u16)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DisconnectReason {
	#[default]
	Unspecified = 0,
	Blocked = 1,
	ConnectionLimit = 2,
	RateLimited = 3,
	ProtocolViolation = 4,
	Shutdown = 5,
}

impl DisconnectReason {
	pub fn code(self) -> u16 {
		self as u16
	}

	pub fn from_code(code: u16) -> Self {
		Self::from_repr(code).unwrap_or_default()
	}
}

impl From<u16> for DisconnectReason {
	fn from(code: u16) -> Self {
		Self::from_code(code)
	}
}

impl From<DisconnectReason> for u16 {
	fn from(reason: DisconnectReason) -> Self {
		reason.code()
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SecretKey {
	Seed { seed: String },
	Key { key: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(try_from = "String")]
pub struct CompactMultiaddress((PeerId, Multiaddr));

impl TryFrom<String> for CompactMultiaddress {
	type Error = Report;

	fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
		let Some((_, peer_id)) = value.rsplit_once('/') else {
			return Err(eyre!("Invalid multiaddress string"));
		};
		let peer_id = PeerId::from_str(peer_id)?;
		let multiaddr = Multiaddr::from_str(&value)?;
		Ok(CompactMultiaddress((peer_id, multiaddr)))
	}
}

/// Address of a peer to dial, either as `<multiaddr>/p2p/<peer_id>` or as a
/// `(peer_id, multiaddr)` tuple.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(
	untagged,
	expecting = "Valid multiaddress/peer_id string or a tuple (peer_id, multiaddress) expected"
)]
pub enum PeerAddress {
	Compact(CompactMultiaddress),
	PeerIdAndMultiaddr((PeerId, Multiaddr)),
}

impl From<&PeerAddress> for (PeerId, Multiaddr) {
	fn from(value: &PeerAddress) -> Self {
		match value {
			PeerAddress::Compact(CompactMultiaddress(value)) => value.clone(),
			PeerAddress::PeerIdAndMultiaddr(value) => value.clone(),
		}
	}
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

pub mod duration_millis_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use test_case::test_case;

	#[test_case(0 => DisconnectReason::Unspecified ; "Unspecified")]
	#[test_case(1 => DisconnectReason::Blocked ; "Blocked")]
	#[test_case(3 => DisconnectReason::RateLimited ; "Rate limited")]
	#[test_case(5 => DisconnectReason::Shutdown ; "Shutdown")]
	#[test_case(6 => DisconnectReason::Unspecified ; "First unknown code")]
	#[test_case(u16::MAX => DisconnectReason::Unspecified ; "Max code")]
	fn test_disconnect_reason_from_code(code: u16) -> DisconnectReason {
		DisconnectReason::from_code(code)
	}

	proptest! {
		#[test]
		fn unknown_codes_never_fail(code in 6u16..) {
			prop_assert_eq!(DisconnectReason::from(code), DisconnectReason::Unspecified);
		}
	}

	#[test]
	fn connection_ids_are_unique() {
		let first = ConnectionId::next();
		let second = ConnectionId::next();
		assert_ne!(first, second);
		assert!(second > first);
	}

	#[test]
	fn compact_multiaddress_parsing() {
		let peer_id = libp2p::identity::Keypair::generate_ed25519()
			.public()
			.to_peer_id();
		let value = format!("/ip4/127.0.0.1/tcp/37000/p2p/{peer_id}");
		let CompactMultiaddress((parsed_peer, parsed_addr)) =
			CompactMultiaddress::try_from(value.clone()).unwrap();
		assert_eq!(parsed_peer, peer_id);
		assert_eq!(parsed_addr.to_string(), value);

		assert!(CompactMultiaddress::try_from("no-peer-id".to_string()).is_err());
	}
}
