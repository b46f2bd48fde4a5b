// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Transport streams and the connections built on top of them.
//!
//! A connection is not synchronized internally. Callers must not have more than one send and one
//! receive outstanding on it at a time, which holds naturally for a connection checked out of a pool.

use {
	crate::{common::*, auth::Authenticator, wire::*},
	std::{
		fmt,
		io::{self, Read, Write},
		net::{TcpStream, Shutdown},
		sync::Arc,
		time::{Duration, Instant}
	}
};

/// A byte oriented duplex channel to one server.
pub trait Stream: Read + Write + Send + 'static {
	fn shutdown(&mut self) -> io::Result<()>;
}

impl Stream for TcpStream {
	fn shutdown(&mut self) -> io::Result<()> {
		TcpStream::shutdown(self, Shutdown::Both)
	}
}

pub trait StreamFactory: Send + Sync + fmt::Debug {
	fn create(&self, address: &ServerAddress) -> Result<Box<dyn Stream>>;
}

/// Opens blocking TCP sockets.
#[derive(Debug, Clone, Default)]
pub struct TcpStreamFactory {
	settings: SocketSettings
}

impl TcpStreamFactory {
	pub fn new(settings: SocketSettings) -> Self {
		Self { settings }
	}
}

impl StreamFactory for TcpStreamFactory {
	fn create(&self, address: &ServerAddress) -> Result<Box<dyn Stream>> {
		let mut last_err = None;

		// try every resolved address in order
		for addr in address.socket_addrs()? {
			let stream = if self.settings.connect_timeout == Duration::from_secs(0) {
				TcpStream::connect(addr)
			} else {
				TcpStream::connect_timeout(&addr, self.settings.connect_timeout)
			};

			match stream {
				Ok(stream) => {
					let timeout = (self.settings.read_timeout != Duration::from_secs(0))
						.then(|| self.settings.read_timeout);
					stream.set_nodelay(true)?;
					stream.set_read_timeout(timeout)?;
					stream.set_write_timeout(timeout)?;
					return Ok(Box::new(stream));
				}
				Err(e) => last_err = Some(e)
			}
		}

		Err(match last_err {
			Some(e) if is_timeout(&e) => Error::ConnectTimeout(address.clone()),
			Some(e) => Error::Io(e),
			None    => Error::InvalidAddress(address.to_string())
		})
	}
}

fn is_timeout(e: &io::Error) -> bool {
	matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Reads until `buf` is full or the stream reports EOF, returning the number of bytes read.
fn read_fully(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
	let mut read = 0;
	while read < buf.len() {
		match reader.read(&mut buf[read..]) {
			Ok(0) => break,
			Ok(n) => read += n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e)
		}
	}
	Ok(read)
}

pub struct InternalConnection {
	id:        u32,
	address:   ServerAddress,
	stream:    Box<dyn Stream>,
	settings:  MessageSettings,
	buffers:   Arc<BufferPool>,
	closed:    bool,
	opened_at: Instant
}

impl fmt::Debug for InternalConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("InternalConnection")
			.field("id", &self.id)
			.field("address", &self.address)
			.field("closed", &self.closed)
			.finish()
	}
}

impl InternalConnection {
	pub fn new(
		id:       u32,
		address:  ServerAddress,
		stream:   Box<dyn Stream>,
		settings: MessageSettings,
		buffers:  Arc<BufferPool>
	) -> Self {
		Self { id, address, stream, settings, buffers, closed: false, opened_at: Instant::now() }
	}

	/// Pool scoped id, only meaningful for diagnostics.
	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn settings(&self) -> &MessageSettings {
		&self.settings
	}

	pub fn opened_at(&self) -> Instant {
		self.opened_at
	}

	/// Only reflects local state, a socket closed by the peer is noticed on the next I/O.
	pub fn is_closed(&self) -> bool {
		self.closed
	}

	pub fn close(&mut self) {
		if !self.closed {
			self.closed = true;
			self.stream.shutdown().ok();
			tracing::debug!(address = %self.address, connection_id = self.id, "connection closed");
		}
	}

	/// Writes a complete frame.
	pub fn send_message(&mut self, frame: &[u8]) -> Result<()> {
		self.ensure_open()?;
		tracing::trace!(address = %self.address, connection_id = self.id, bytes = frame.len(), "sending message");

		let stream = &mut self.stream;
		match stream.write_all(frame).and_then(|_| stream.flush()) {
			Ok(())  => Ok(()),
			Err(e)  => Err(self.fail(e.into()))
		}
	}

	/// Reads the reply to the request with id `response_to`.
	pub fn receive_message(&mut self, response_to: i32) -> Result<ResponseBuffers> {
		self.ensure_open()?;
		let start = Instant::now();

		match self.read_reply(response_to) {
			Ok((header, body)) => {
				tracing::trace!(address = %self.address, connection_id = self.id,
					bytes = header.message_length, "received message");
				Ok(ResponseBuffers::new(header, body, start.elapsed(), Some(self.buffers.clone())))
			}
			Err(e) => Err(self.fail(e))
		}
	}

	/// Sends a frame and waits for the reply to `request_id`.
	pub fn send_and_receive(&mut self, request_id: i32, frame: &[u8]) -> Result<ResponseBuffers> {
		self.send_message(frame)?;
		self.receive_message(request_id)
	}

	fn read_reply(&mut self, response_to: i32) -> Result<(MessageHeader, Vec<u8>)> {
		let mut buf = [0u8; HEADER_SIZE];
		match read_fully(&mut *self.stream, &mut buf)? {
			0 => return Err(Error::ConnectionClosed(self.address.clone())),
			n if n < HEADER_SIZE => return Err(FramingError::TruncatedHeader(n).into()),
			_ => ()
		}

		let header = MessageHeader::decode(&buf, self.settings.max_message_size)?;
		let mut body = self.buffers.get(header.body_length());
		let result = match read_fully(&mut *self.stream, &mut body) {
			Ok(n) if n < body.len() => Err(FramingError::TruncatedBody { expected: body.len(), actual: n }.into()),
			Ok(_)  => header.check_response_to(response_to).map_err(Error::from),
			Err(e) => Err(e.into())
		};

		match result {
			Ok(()) => Ok((header, body)),
			Err(e) => {
				self.buffers.release(body);
				Err(e)
			}
		}
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed {
			Err(Error::ConnectionClosed(self.address.clone()))
		} else {
			Ok(())
		}
	}

	/// Closes the connection after an I/O or framing failure and maps the error.
	fn fail(&mut self, err: Error) -> Error {
		let err = match err {
			Error::Io(e) if is_timeout(&e) => Error::SocketTimeout(self.address.clone()),
			Error::Io(e) if matches!(e.kind(),
				io::ErrorKind::UnexpectedEof
				| io::ErrorKind::BrokenPipe
				| io::ErrorKind::ConnectionReset
				| io::ErrorKind::ConnectionAborted) => Error::ConnectionClosed(self.address.clone()),
			err => err
		};

		match &err {
			Error::Framing(e) => tracing::warn!(address = %self.address, connection_id = self.id,
				"discarding connection after framing error: {}", e),
			e => tracing::debug!(address = %self.address, connection_id = self.id,
				"connection failed: {}", e)
		}

		self.close();
		err
	}
}

#[cfg(feature = "async")]
impl InternalConnection {
	/// Sends `frame` on a blocking task and hands the connection back through `callback`,
	/// which is invoked exactly once.
	pub fn send_message_async<F>(self, frame: Vec<u8>, callback: F) where
		F: FnOnce(Self, Result<()>) + Send + 'static {
		spawn_io(self, move |conn| conn.send_message(&frame), callback)
	}

	/// Receives the reply to `response_to` on a blocking task, see [`Self::send_message_async`].
	pub fn receive_message_async<F>(self, response_to: i32, callback: F) where
		F: FnOnce(Self, Result<ResponseBuffers>) + Send + 'static {
		spawn_io(self, move |conn| conn.receive_message(response_to), callback)
	}
}

#[cfg(feature = "async")]
fn spawn_io<T, W, F>(mut connection: InternalConnection, work: W, callback: F) where
	T: Send + 'static,
	W: FnOnce(&mut InternalConnection) -> Result<T> + Send + 'static,
	F: FnOnce(InternalConnection, Result<T>) + Send + 'static {
	async_std::task::spawn_blocking(move || {
		let result = work(&mut connection);
		callback(connection, result);
	});
}

impl Drop for InternalConnection {
	fn drop(&mut self) {
		self.close();
	}
}

/// Creates established, authenticated connections.
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
	fn create(&self, address: &ServerAddress, id: u32) -> Result<InternalConnection>;
}

#[derive(Debug)]
pub struct InternalConnectionFactory {
	stream_factory: Arc<dyn StreamFactory>,
	authenticator:  Option<Arc<dyn Authenticator>>,
	settings:       MessageSettings,
	buffers:        Arc<BufferPool>
}

impl InternalConnectionFactory {
	pub fn new(
		stream_factory: Arc<dyn StreamFactory>,
		authenticator:  Option<Arc<dyn Authenticator>>,
		settings:       MessageSettings
	) -> Self {
		Self { stream_factory, authenticator, settings, buffers: Arc::new(BufferPool::default()) }
	}
}

impl ConnectionFactory for InternalConnectionFactory {
	fn create(&self, address: &ServerAddress, id: u32) -> Result<InternalConnection> {
		let stream = self.stream_factory.create(address)?;
		let mut connection = InternalConnection::new(
			id, address.clone(), stream, self.settings, self.buffers.clone());
		tracing::debug!(address = %address, connection_id = id, "connection opened");

		if let Some(authenticator) = &self.authenticator {
			if let Err(source) = authenticator.authenticate(&mut connection) {
				connection.close();
				return Err(Error::Authentication {
					user: authenticator.credential().username.clone(),
					source
				});
			}
		}

		Ok(connection)
	}
}
