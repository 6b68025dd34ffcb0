//! Reference stream multiplexer.
//!
//! Frames are laid out as:
//! - 1 byte: frame kind
//! - 4 bytes: big-endian stream id
//! - 4 bytes: big-endian payload length
//! - N bytes: payload
//!
//! A `GoAway` frame carries the big-endian disconnect reason code and is the
//! last frame written before the connection is shut down.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tokio::{
	sync::{mpsc, oneshot, watch, Mutex},
	time::timeout,
};
use tokio_util::{
	codec::{Decoder, Encoder, Framed},
	sync::CancellationToken,
};
use tracing::{debug, instrument, trace};

use super::{
	CapableConnection, Closed, ClosedBy, ConnectionInfo, MuxerError, StreamMuxer, Substream,
};
use crate::{
	security::SecuredConnection,
	transport::BoxedIo,
	types::{duration_millis_format, ConnectionId, Direction, DisconnectReason},
	utils::spawn_in_span,
};

pub const PROTOCOL: &str = "/frame-mux/1.0.0";

const HEADER_SIZE: usize = 9;

const OPEN: u8 = 0;
const DATA: u8 = 1;
const CLOSE: u8 = 2;
const GO_AWAY: u8 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameMuxConfig {
	/// Maximum payload size of a single frame, in bytes (default: 1 MiB)
	pub max_frame_size: usize,
	/// Time allowed for delivering the disconnect reason, in milliseconds (default: 500)
	#[serde(with = "duration_millis_format")]
	pub goaway_timeout: Duration,
	/// Number of inbound streams waiting to be accepted before new ones are reset (default: 64)
	pub max_pending_streams: usize,
}

impl Default for FrameMuxConfig {
	fn default() -> Self {
		Self {
			max_frame_size: 1024 * 1024,
			goaway_timeout: Duration::from_millis(500),
			max_pending_streams: 64,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Frame {
	Open { stream: u32 },
	Data { stream: u32, data: Bytes },
	Close { stream: u32 },
	GoAway { reason: u16 },
}

struct FrameCodec {
	max_frame_size: usize,
}

impl FrameCodec {
	fn new(max_frame_size: usize) -> Self {
		Self { max_frame_size }
	}
}

impl Decoder for FrameCodec {
	type Item = Frame;
	type Error = MuxerError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxerError> {
		if src.len() < HEADER_SIZE {
			return Ok(None);
		}

		let mut header = &src[..HEADER_SIZE];
		let kind = header.get_u8();
		let stream = header.get_u32();
		let length = header.get_u32() as usize;

		if length > self.max_frame_size {
			return Err(MuxerError::FrameTooLarge {
				size: length,
				max: self.max_frame_size,
			});
		}

		if src.len() < HEADER_SIZE + length {
			src.reserve(HEADER_SIZE + length - src.len());
			return Ok(None);
		}

		src.advance(HEADER_SIZE);
		let payload = src.split_to(length).freeze();

		let frame = match kind {
			OPEN => Frame::Open { stream },
			DATA => Frame::Data {
				stream,
				data: payload,
			},
			CLOSE => Frame::Close { stream },
			GO_AWAY => {
				// short payload is read as an unspecified reason
				let reason = match payload.as_ref() {
					[high, low, ..] => u16::from_be_bytes([*high, *low]),
					_ => DisconnectReason::Unspecified.code(),
				};
				Frame::GoAway { reason }
			},
			other => return Err(MuxerError::InvalidFrame(other)),
		};
		Ok(Some(frame))
	}
}

impl Encoder<Frame> for FrameCodec {
	type Error = MuxerError;

	fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxerError> {
		let (kind, stream, payload) = match frame {
			Frame::Open { stream } => (OPEN, stream, Bytes::new()),
			Frame::Data { stream, data } => (DATA, stream, data),
			Frame::Close { stream } => (CLOSE, stream, Bytes::new()),
			Frame::GoAway { reason } => (
				GO_AWAY,
				0,
				Bytes::copy_from_slice(&reason.to_be_bytes()),
			),
		};

		if payload.len() > self.max_frame_size {
			return Err(MuxerError::FrameTooLarge {
				size: payload.len(),
				max: self.max_frame_size,
			});
		}

		dst.reserve(HEADER_SIZE + payload.len());
		dst.put_u8(kind);
		dst.put_u32(stream);
		dst.put_u32(payload.len() as u32);
		dst.put_slice(&payload);
		Ok(())
	}
}

enum Command {
	Open(oneshot::Sender<FrameStream>),
	Send { stream: u32, data: Bytes },
	CloseStream(u32),
	Close(Option<DisconnectReason>),
}

/// Multiplexer running every connection on a dedicated driver task.
#[derive(Clone, Debug, Default)]
pub struct FrameMux {
	config: FrameMuxConfig,
}

impl FrameMux {
	pub fn new(config: FrameMuxConfig) -> Self {
		Self { config }
	}
}

#[async_trait]
impl StreamMuxer for FrameMux {
	fn protocol(&self) -> &'static str {
		PROTOCOL
	}

	async fn upgrade(
		&self,
		secured: SecuredConnection,
	) -> Result<Box<dyn CapableConnection>, MuxerError> {
		let info = ConnectionInfo::new(&secured, PROTOCOL);
		let (_, io) = secured.into_raw().into_parts();

		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let (inbound_tx, inbound_rx) = mpsc::channel(self.config.max_pending_streams.max(1));
		let (closed_tx, closed_rx) = watch::channel(None);
		let cancel = CancellationToken::new();

		let driver = Driver {
			id: info.id,
			framed: Framed::new(io, FrameCodec::new(self.config.max_frame_size)),
			commands: commands_rx,
			commands_tx: commands_tx.clone(),
			streams: HashMap::new(),
			inbound: inbound_tx,
			// dialer opens odd stream ids, listener even ones
			next_stream_id: match info.direction {
				Direction::Outbound => 1,
				Direction::Inbound => 2,
			},
			max_frame_size: self.config.max_frame_size,
			goaway_timeout: self.config.goaway_timeout,
			cancel: cancel.clone(),
			closed: closed_tx,
		};
		spawn_in_span(driver.run());

		Ok(Box::new(FrameMuxConnection {
			info,
			commands: commands_tx,
			inbound: Mutex::new(inbound_rx),
			closed: closed_rx,
			cancel,
		}))
	}
}

struct Driver {
	id: ConnectionId,
	framed: Framed<BoxedIo, FrameCodec>,
	commands: mpsc::UnboundedReceiver<Command>,
	commands_tx: mpsc::UnboundedSender<Command>,
	streams: HashMap<u32, mpsc::UnboundedSender<Bytes>>,
	inbound: mpsc::Sender<FrameStream>,
	next_stream_id: u32,
	max_frame_size: usize,
	goaway_timeout: Duration,
	cancel: CancellationToken,
	closed: watch::Sender<Option<Closed>>,
}

impl Driver {
	#[instrument(level = "debug", name = "frame_mux", skip_all, fields(id = %self.id))]
	async fn run(mut self) {
		let closed = loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break Closed { by: ClosedBy::Local, reason: None },
				command = self.commands.recv() => {
					let Some(command) = command else {
						break Closed { by: ClosedBy::Local, reason: None };
					};
					match self.on_command(command).await {
						Ok(None) => {},
						Ok(Some(closed)) => break closed,
						Err(error) => {
							debug!(%error, "Writing frame failed");
							break Closed { by: ClosedBy::Remote, reason: None };
						},
					}
				},
				frame = self.framed.next() => match frame {
					Some(Ok(Frame::GoAway { reason })) => {
						break Closed {
							by: ClosedBy::Remote,
							reason: Some(DisconnectReason::from_code(reason)),
						};
					},
					Some(Ok(frame)) => {
						if let Err(error) = self.on_frame(frame).await {
							debug!(%error, "Writing frame failed");
							break Closed { by: ClosedBy::Remote, reason: None };
						}
					},
					Some(Err(error)) => {
						debug!(%error, "Reading frame failed");
						break Closed { by: ClosedBy::Remote, reason: None };
					},
					None => break Closed { by: ClosedBy::Remote, reason: None },
				},
			}
		};

		// ends every open stream
		self.streams.clear();
		match timeout(self.goaway_timeout, self.framed.close()).await {
			Ok(Err(error)) => trace!(%error, "Shutting down connection failed"),
			Err(_) => trace!("Shutting down connection timed out"),
			Ok(Ok(())) => {},
		}
		debug!(by = ?closed.by, reason = ?closed.reason, "Connection closed");
		self.closed.send_replace(Some(closed));
	}

	async fn on_command(&mut self, command: Command) -> Result<Option<Closed>, MuxerError> {
		match command {
			Command::Open(reply) => {
				let stream = self.next_stream_id;
				self.next_stream_id = self.next_stream_id.wrapping_add(2);
				self.framed.send(Frame::Open { stream }).await?;
				let (stream_tx, stream_rx) = mpsc::unbounded_channel();
				self.streams.insert(stream, stream_tx);
				// requester is gone if this fails, dropping the stream closes it again
				let _ = reply.send(self.new_stream(stream, stream_rx));
			},
			Command::Send { stream, data } => {
				if self.streams.contains_key(&stream) {
					self.framed.send(Frame::Data { stream, data }).await?;
				}
			},
			Command::CloseStream(stream) => {
				if self.streams.remove(&stream).is_some() {
					self.framed.send(Frame::Close { stream }).await?;
				}
			},
			Command::Close(reason) => {
				if let Some(reason) = reason {
					self.send_goaway(reason).await;
				}
				return Ok(Some(Closed {
					by: ClosedBy::Local,
					reason,
				}));
			},
		}
		Ok(None)
	}

	async fn on_frame(&mut self, frame: Frame) -> Result<(), MuxerError> {
		match frame {
			Frame::Open { stream } => {
				if self.streams.contains_key(&stream) {
					debug!(stream, "Remote reopened an active stream");
					return Ok(());
				}
				let (stream_tx, stream_rx) = mpsc::unbounded_channel();
				self.streams.insert(stream, stream_tx);
				if self
					.inbound
					.try_send(self.new_stream(stream, stream_rx))
					.is_err()
				{
					debug!(stream, "Too many pending inbound streams, resetting");
					self.streams.remove(&stream);
					self.framed.send(Frame::Close { stream }).await?;
				}
			},
			Frame::Data { stream, data } => match self.streams.get(&stream) {
				Some(stream_tx) => {
					// receiver dropped, its close command is already queued
					let _ = stream_tx.send(data);
				},
				None => trace!(stream, "Data for unknown stream"),
			},
			Frame::Close { stream } => {
				self.streams.remove(&stream);
			},
			Frame::GoAway { .. } => {},
		}
		Ok(())
	}

	async fn send_goaway(&mut self, reason: DisconnectReason) {
		let frame = Frame::GoAway {
			reason: reason.code(),
		};
		match timeout(self.goaway_timeout, self.framed.send(frame)).await {
			Ok(Ok(())) => trace!(%reason, "Disconnect reason sent"),
			Ok(Err(error)) => debug!(%reason, %error, "Sending disconnect reason failed"),
			Err(_) => debug!(%reason, "Sending disconnect reason timed out"),
		}
	}

	fn new_stream(&self, id: u32, incoming: mpsc::UnboundedReceiver<Bytes>) -> FrameStream {
		FrameStream {
			id,
			max_frame_size: self.max_frame_size,
			commands: self.commands_tx.clone(),
			incoming,
		}
	}
}

struct FrameStream {
	id: u32,
	max_frame_size: usize,
	commands: mpsc::UnboundedSender<Command>,
	incoming: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Substream for FrameStream {
	fn id(&self) -> u32 {
		self.id
	}

	async fn send(&mut self, data: Bytes) -> Result<(), MuxerError> {
		if data.len() > self.max_frame_size {
			return Err(MuxerError::FrameTooLarge {
				size: data.len(),
				max: self.max_frame_size,
			});
		}
		self.commands
			.send(Command::Send {
				stream: self.id,
				data,
			})
			.map_err(|_| MuxerError::ConnectionClosed)
	}

	async fn recv(&mut self) -> Option<Bytes> {
		self.incoming.recv().await
	}
}

impl Drop for FrameStream {
	fn drop(&mut self) {
		let _ = self.commands.send(Command::CloseStream(self.id));
	}
}

struct FrameMuxConnection {
	info: ConnectionInfo,
	commands: mpsc::UnboundedSender<Command>,
	inbound: Mutex<mpsc::Receiver<FrameStream>>,
	closed: watch::Receiver<Option<Closed>>,
	cancel: CancellationToken,
}

#[async_trait]
impl CapableConnection for FrameMuxConnection {
	fn info(&self) -> &ConnectionInfo {
		&self.info
	}

	async fn open_stream(&self) -> Result<Box<dyn Substream>, MuxerError> {
		if self.is_closed() {
			return Err(MuxerError::ConnectionClosed);
		}
		let (reply_tx, reply_rx) = oneshot::channel();
		self.commands
			.send(Command::Open(reply_tx))
			.map_err(|_| MuxerError::ConnectionClosed)?;
		let stream = reply_rx.await.map_err(|_| MuxerError::ConnectionClosed)?;
		Ok(Box::new(stream))
	}

	async fn accept_stream(&self) -> Result<Box<dyn Substream>, MuxerError> {
		let stream = self
			.inbound
			.lock()
			.await
			.recv()
			.await
			.ok_or(MuxerError::ConnectionClosed)?;
		Ok(Box::new(stream))
	}

	async fn close(&self, reason: Option<DisconnectReason>) {
		if self.is_closed() {
			return;
		}
		// driver may already be shutting down, waiting below covers both cases
		let _ = self.commands.send(Command::Close(reason));
		self.closed().await;
	}

	fn is_closed(&self) -> bool {
		self.closed.borrow().is_some()
	}

	async fn closed(&self) -> Closed {
		let mut closed = self.closed.clone();
		// sender is only dropped without a value when the runtime shuts down
		let state = closed.wait_for(Option::is_some).await.map(|state| *state);
		state.ok().flatten().unwrap_or(Closed {
			by: ClosedBy::Local,
			reason: None,
		})
	}
}

impl Drop for FrameMuxConnection {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}
