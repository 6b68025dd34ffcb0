use async_trait::async_trait;
use libp2p::identity::{Keypair, PublicKey};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{HandshakeError, SecureTransport, SecuredConnection};
use crate::{
	framing::{read_message, write_message},
	transport::RawConnection,
};

pub const PROTOCOL: &str = "/signed-handshake/1.0.0";

const NONCE_LENGTH: usize = 32;
const MAX_MESSAGE_SIZE: usize = 1024;
const SIGNATURE_DOMAIN: &[u8] = b"signed-handshake:";

/// Authentication-only secure channel.
///
/// Both sides send their protocol name, public key and a random nonce, then
/// sign the nonce received from the remote. A remote is verified once its
/// signature over our nonce checks out against the key it sent. The stream
/// itself is not encrypted.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignedHandshake;

fn signed_payload(nonce: &[u8]) -> Vec<u8> {
	[SIGNATURE_DOMAIN, nonce].concat()
}

#[async_trait]
impl SecureTransport for SignedHandshake {
	fn protocol(&self) -> &'static str {
		PROTOCOL
	}

	#[instrument(level = "trace", skip_all, fields(id = %raw.id(), direction = %raw.direction()))]
	async fn secure(
		&self,
		mut raw: RawConnection,
		local_keypair: &Keypair,
	) -> Result<SecuredConnection, HandshakeError> {
		let local_public_key = local_keypair.public();
		let nonce: [u8; NONCE_LENGTH] = rand::random();
		let io = raw.io_mut();

		write_message(io, PROTOCOL.as_bytes()).await?;
		write_message(io, &local_public_key.encode_protobuf()).await?;
		write_message(io, &nonce).await?;
		io.flush().await?;

		let remote_protocol = read_message(io, MAX_MESSAGE_SIZE).await?;
		if remote_protocol != PROTOCOL.as_bytes() {
			return Err(HandshakeError::ProtocolMismatch(
				String::from_utf8_lossy(&remote_protocol).into_owned(),
			));
		}
		let remote_public_key =
			PublicKey::try_decode_protobuf(&read_message(io, MAX_MESSAGE_SIZE).await?)?;
		let remote_nonce = read_message(io, MAX_MESSAGE_SIZE).await?;
		if remote_nonce.len() != NONCE_LENGTH || remote_nonce == nonce {
			return Err(HandshakeError::InvalidNonce);
		}

		let signature = local_keypair.sign(&signed_payload(&remote_nonce))?;
		write_message(io, &signature).await?;
		io.flush().await?;

		let remote_signature = read_message(io, MAX_MESSAGE_SIZE).await?;
		if !remote_public_key.verify(&signed_payload(&nonce), &remote_signature) {
			return Err(HandshakeError::InvalidSignature);
		}

		let secured = SecuredConnection::new(
			raw,
			local_public_key.to_peer_id(),
			remote_public_key,
			PROTOCOL,
		);
		debug!(remote_peer = %secured.remote_peer(), "Secure handshake completed");
		Ok(secured)
	}
}
