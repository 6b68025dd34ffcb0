//! Length-prefixed messages used during connection negotiation.
//!
//! Messages are framed as:
//! - 4 bytes: big-endian message length
//! - N bytes: message
//!
//! Reads never consume more bytes than the message itself, so the stream can
//! be handed to the next protocol layer right after the last message.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_message<W>(io: &mut W, message: &[u8]) -> io::Result<()>
where
	W: AsyncWrite + Unpin + ?Sized,
{
	let length = u32::try_from(message.len())
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Message too large"))?;
	io.write_u32(length).await?;
	io.write_all(message).await
}

pub async fn read_message<R>(io: &mut R, max_length: usize) -> io::Result<Vec<u8>>
where
	R: AsyncRead + Unpin + ?Sized,
{
	let length = io.read_u32().await? as usize;
	if length > max_length {
		return Err(io::Error::new(
			io::ErrorKind::InvalidData,
			format!("Message too large: {length} bytes (max: {max_length})"),
		));
	}

	let mut message = vec![0u8; length];
	io.read_exact(&mut message).await?;
	Ok(message)
}
