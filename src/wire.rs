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

//! Framing of the legacy opcode based wire protocol.
//!
//! Every message starts with a 16 byte little endian header
//! (`length`, `request_id`, `response_to`, `op_code`). Bodies are written after a placeholder header
//! and the length is patched in once the body is complete.

use {
	crate::common::*,
	std::{
		time::Duration,
		sync::{Arc, Mutex, atomic::{AtomicI32, Ordering}}
	}
};

pub const HEADER_SIZE:       usize = 16;
pub const REPLY_PREFIX_SIZE: usize = 20;
/// Larger buffers are freed on release instead of being recycled.
pub const MAX_RECYCLED_BUFFER_CAPACITY: usize = 1024 * 1024;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a process wide unique request id.
pub fn next_request_id() -> i32 {
	REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FramingError {
	#[error("expected a header of 16 bytes, got {0} bytes")]
	TruncatedHeader(usize),
	#[error("expected a body of {expected} bytes, got {actual} bytes")]
	TruncatedBody {
		expected: usize,
		actual:   usize
	},
	#[error("invalid message length {0}")]
	InvalidLength(i32),
	#[error("message of {length} bytes exceeds the maximum of {max} bytes")]
	MessageTooLarge {
		length: usize,
		max:    usize
	},
	#[error("expected a response to request {expected}, got a response to request {actual}")]
	ResponseToMismatch {
		expected: i32,
		actual:   i32
	},
	#[error("unknown op code {0}")]
	UnknownOpCode(i32)
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Reply       = 1,
	Update      = 2001,
	Insert      = 2002,
	Query       = 2004,
	GetMore     = 2005,
	Delete      = 2006,
	KillCursors = 2007,
	Msg         = 2013
}

impl OpCode {
	pub fn from_i32(v: i32) -> Option<Self> {
		Some(match v {
			1    => Self::Reply,
			2001 => Self::Update,
			2002 => Self::Insert,
			2004 => Self::Query,
			2005 => Self::GetMore,
			2006 => Self::Delete,
			2007 => Self::KillCursors,
			2013 => Self::Msg,
			_    => return None
		})
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
	pub message_length: i32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl MessageHeader {
	pub fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	/// Parses the first 16 bytes of `buf`. The length field must cover at least the header
	/// itself and must not exceed `max_message_size`.
	pub fn decode(buf: &[u8], max_message_size: usize) -> std::result::Result<Self, FramingError> {
		if buf.len() < HEADER_SIZE {
			return Err(FramingError::TruncatedHeader(buf.len()));
		}

		let message_length = read_i32(buf, 0);
		if message_length < HEADER_SIZE as i32 {
			return Err(FramingError::InvalidLength(message_length));
		} else if message_length as usize > max_message_size {
			return Err(FramingError::MessageTooLarge { length: message_length as _, max: max_message_size });
		}

		let op_code = read_i32(buf, 12);
		Ok(Self {
			message_length,
			request_id:  read_i32(buf, 4),
			response_to: read_i32(buf, 8),
			op_code:     OpCode::from_i32(op_code).ok_or(FramingError::UnknownOpCode(op_code))?
		})
	}

	pub fn check_response_to(&self, request_id: i32) -> std::result::Result<(), FramingError> {
		if self.response_to == request_id {
			Ok(())
		} else {
			Err(FramingError::ResponseToMismatch { expected: request_id, actual: self.response_to })
		}
	}

	pub fn body_length(&self) -> usize {
		self.message_length as usize - HEADER_SIZE
	}
}

/// Flags of an OP_QUERY.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct QueryFlags(pub u32);

impl QueryFlags {
	pub const NONE:              Self = Self(0);
	pub const TAILABLE_CURSOR:   Self = Self(1 << 1);
	pub const SLAVE_OK:          Self = Self(1 << 2);
	pub const NO_CURSOR_TIMEOUT: Self = Self(1 << 4);
	pub const AWAIT_DATA:        Self = Self(1 << 5);
	pub const EXHAUST:           Self = Self(1 << 6);
	pub const PARTIAL:           Self = Self(1 << 7);

	pub fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}
}

impl std::ops::BitOr for QueryFlags {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

/// A cursor that is still open on the server that issued it.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ServerCursor {
	id:      i64,
	address: ServerAddress
}

impl ServerCursor {
	/// Returns `None` for the id 0, which denotes an exhausted cursor.
	pub fn new(id: i64, address: ServerAddress) -> Option<Self> {
		if id == 0 { None } else { Some(Self { id, address }) }
	}

	pub fn id(&self) -> i64 {
		self.id
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}
}

/// A request with pre-serialized documents.
#[derive(Debug, Clone)]
pub enum RequestMessage<'a> {
	Query {
		namespace:      &'a str,
		flags:          QueryFlags,
		number_to_skip: i32,
		/// Negative values close the cursor after the first batch.
		number_to_return: i32,
		query:          &'a [u8],
		fields:         Option<&'a [u8]>
	},
	GetMore {
		namespace:        &'a str,
		number_to_return: i32,
		cursor:           &'a ServerCursor
	},
	Insert {
		namespace:         &'a str,
		continue_on_error: bool,
		documents:         &'a [&'a [u8]]
	},
	Update {
		namespace: &'a str,
		upsert:    bool,
		multi:     bool,
		selector:  &'a [u8],
		update:    &'a [u8]
	},
	Delete {
		namespace:     &'a str,
		single_remove: bool,
		selector:      &'a [u8]
	},
	KillCursors {
		cursor_ids: &'a [i64]
	}
}

impl RequestMessage<'_> {
	pub fn op_code(&self) -> OpCode {
		match self {
			Self::Query { .. }       => OpCode::Query,
			Self::GetMore { .. }     => OpCode::GetMore,
			Self::Insert { .. }      => OpCode::Insert,
			Self::Update { .. }      => OpCode::Update,
			Self::Delete { .. }      => OpCode::Delete,
			Self::KillCursors { .. } => OpCode::KillCursors
		}
	}

	pub fn namespace(&self) -> Option<&str> {
		match self {
			Self::Query { namespace, .. }
			| Self::GetMore { namespace, .. }
			| Self::Insert { namespace, .. }
			| Self::Update { namespace, .. }
			| Self::Delete { namespace, .. } => Some(namespace),
			Self::KillCursors { .. } => None
		}
	}

	/// Encodes the complete frame, header included.
	pub fn encode(&self, request_id: i32, settings: &MessageSettings) -> Result<Vec<u8>> {
		let mut buf = vec![0u8; HEADER_SIZE];
		self.encode_body(&mut buf, settings)?;

		if buf.len() > settings.max_message_size || buf.len() > i32::MAX as usize {
			return Err(FramingError::MessageTooLarge { length: buf.len(), max: settings.max_message_size }.into());
		}

		MessageHeader {
			message_length: buf.len() as _,
			request_id,
			response_to:    0,
			op_code:        self.op_code()
		}.copy_to_slice(&mut buf[..HEADER_SIZE]);

		Ok(buf)
	}

	fn encode_body(&self, buf: &mut Vec<u8>, settings: &MessageSettings) -> Result<()> {
		match *self {
			Self::Query { namespace, flags, number_to_skip, number_to_return, query, fields } => {
				put_i32(buf, flags.0 as i32);
				put_cstring(buf, namespace)?;
				put_i32(buf, number_to_skip);
				put_i32(buf, number_to_return);
				put_document(buf, query, settings)?;
				if let Some(fields) = fields {
					put_document(buf, fields, settings)?;
				}
			}
			Self::GetMore { namespace, number_to_return, cursor } => {
				put_i32(buf, 0);
				put_cstring(buf, namespace)?;
				put_i32(buf, number_to_return);
				buf.extend_from_slice(&cursor.id.to_le_bytes());
			}
			Self::Insert { namespace, continue_on_error, documents } => {
				put_i32(buf, continue_on_error as i32);
				put_cstring(buf, namespace)?;
				for doc in documents {
					put_document(buf, doc, settings)?;
				}
			}
			Self::Update { namespace, upsert, multi, selector, update } => {
				put_i32(buf, 0);
				put_cstring(buf, namespace)?;
				put_i32(buf, upsert as i32 | (multi as i32) << 1);
				put_document(buf, selector, settings)?;
				put_document(buf, update, settings)?;
			}
			Self::Delete { namespace, single_remove, selector } => {
				put_i32(buf, 0);
				put_cstring(buf, namespace)?;
				put_i32(buf, single_remove as i32);
				put_document(buf, selector, settings)?;
			}
			Self::KillCursors { cursor_ids } => {
				put_i32(buf, 0);
				put_i32(buf, cursor_ids.len() as i32);
				for id in cursor_ids {
					buf.extend_from_slice(&id.to_le_bytes());
				}
			}
		}

		Ok(())
	}
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
	i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
	let mut bytes = [0u8; 8];
	bytes.copy_from_slice(&buf[offset..offset + 8]);
	i64::from_le_bytes(bytes)
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
	buf.extend_from_slice(&v.to_le_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
	if s.as_bytes().contains(&0) {
		return Err(Error::Protocol(format!("namespace `{}` contains a null byte", s.escape_debug())));
	}

	buf.extend_from_slice(s.as_bytes());
	buf.push(0);
	Ok(())
}

fn put_document(buf: &mut Vec<u8>, doc: &[u8], settings: &MessageSettings) -> Result<()> {
	if doc.len() > settings.max_document_size {
		return Err(FramingError::MessageTooLarge { length: doc.len(), max: settings.max_document_size }.into());
	}

	buf.extend_from_slice(doc);
	Ok(())
}

/// Validates a complete reply frame and returns its header and body.
pub fn decode_reply(
	frame:            &[u8],
	request_id:       i32,
	max_message_size: usize
) -> std::result::Result<(MessageHeader, &[u8]), FramingError> {
	let header = MessageHeader::decode(frame, max_message_size)?;
	let length = header.message_length as usize;

	if frame.len() < length {
		return Err(FramingError::TruncatedBody {
			expected: header.body_length(),
			actual:   frame.len() - HEADER_SIZE
		});
	}

	header.check_response_to(request_id)?;
	Ok((header, &frame[HEADER_SIZE..length]))
}

/// The fixed fields at the start of an OP_REPLY body.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReplyPrefix {
	pub response_flags:  u32,
	pub cursor_id:       i64,
	pub starting_from:   i32,
	pub number_returned: i32
}

impl ReplyPrefix {
	pub const CURSOR_NOT_FOUND: u32 = 1;
	pub const QUERY_FAILURE:    u32 = 1 << 1;

	pub fn parse(body: &[u8]) -> std::result::Result<Self, FramingError> {
		if body.len() < REPLY_PREFIX_SIZE {
			return Err(FramingError::TruncatedBody { expected: REPLY_PREFIX_SIZE, actual: body.len() });
		}

		Ok(Self {
			response_flags:  read_i32(body, 0) as u32,
			cursor_id:       read_i64(body, 4),
			starting_from:   read_i32(body, 12),
			number_returned: read_i32(body, 16)
		})
	}

	pub fn is_cursor_not_found(&self) -> bool {
		self.response_flags & Self::CURSOR_NOT_FOUND != 0
	}

	pub fn is_query_failure(&self) -> bool {
		self.response_flags & Self::QUERY_FAILURE != 0
	}
}

/// Recycles body buffers of released responses.
#[derive(Debug)]
pub struct BufferPool {
	free:         Mutex<Vec<Vec<u8>>>,
	max_retained: usize,
	max_capacity: usize
}

impl BufferPool {
	pub fn new(max_retained: usize) -> Self {
		Self::with_max_capacity(max_retained, MAX_RECYCLED_BUFFER_CAPACITY)
	}

	/// Retains at most `max_retained` buffers, none with a capacity above `max_capacity` bytes.
	pub fn with_max_capacity(max_retained: usize, max_capacity: usize) -> Self {
		Self { free: Mutex::new(Vec::new()), max_retained, max_capacity }
	}

	/// Returns a zeroed buffer of `len` bytes.
	pub fn get(&self, len: usize) -> Vec<u8> {
		let mut buf = self.free.lock()
			.ok()
			.and_then(|mut free| free.pop())
			.unwrap_or_default();
		buf.clear();
		buf.resize(len, 0);
		buf
	}

	pub fn release(&self, buf: Vec<u8>) {
		if buf.capacity() > self.max_capacity {
			return;
		}

		if let Ok(mut free) = self.free.lock() {
			if free.len() < self.max_retained {
				free.push(buf);
			}
		}
	}

	pub fn retained(&self) -> usize {
		self.free.lock().map(|free| free.len()).unwrap_or(0)
	}

	/// Total capacity of the retained buffers in bytes.
	pub fn retained_capacity(&self) -> usize {
		self.free.lock().map(|free| free.iter().map(Vec::capacity).sum()).unwrap_or(0)
	}
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::new(16)
	}
}

/// A received reply. Owns its body until [`ResponseBuffers::release`] is called or it is dropped.
#[derive(Debug)]
pub struct ResponseBuffers {
	header:  MessageHeader,
	body:    Option<Vec<u8>>,
	elapsed: Duration,
	pool:    Option<Arc<BufferPool>>
}

impl ResponseBuffers {
	pub fn new(header: MessageHeader, body: Vec<u8>, elapsed: Duration, pool: Option<Arc<BufferPool>>) -> Self {
		Self { header, body: Some(body), elapsed, pool }
	}

	pub fn header(&self) -> &MessageHeader {
		&self.header
	}

	/// The raw body, empty once released.
	pub fn body(&self) -> &[u8] {
		self.body.as_deref().unwrap_or(&[])
	}

	pub fn elapsed(&self) -> Duration {
		self.elapsed
	}

	pub fn reply_prefix(&self) -> std::result::Result<ReplyPrefix, FramingError> {
		ReplyPrefix::parse(self.body())
	}

	/// The document section of the body: after the reply prefix for OP_REPLY and after the flag
	/// bits and section kind for OP_MSG.
	pub fn document_bytes(&self) -> &[u8] {
		let offset = match self.header.op_code {
			OpCode::Reply => REPLY_PREFIX_SIZE,
			OpCode::Msg   => 5,
			_             => 0
		};
		self.body().get(offset..).unwrap_or(&[])
	}

	/// Iterates over the length prefixed documents, stopping at the first malformed one.
	pub fn documents(&self) -> Documents<'_> {
		Documents(self.document_bytes())
	}

	pub fn is_released(&self) -> bool {
		self.body.is_none()
	}

	pub fn release(&mut self) {
		if let Some(body) = self.body.take() {
			if let Some(pool) = &self.pool {
				pool.release(body);
			}
		}
	}
}

impl Drop for ResponseBuffers {
	fn drop(&mut self) {
		self.release();
	}
}

#[derive(Debug, Clone)]
pub struct Documents<'a>(&'a [u8]);

impl<'a> Iterator for Documents<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<Self::Item> {
		if self.0.len() < 5 {
			return None;
		}

		let len = read_i32(self.0, 0);
		if len < 5 || len as usize > self.0.len() {
			self.0 = &[];
			return None;
		}

		let (doc, rest) = self.0.split_at(len as usize);
		self.0 = rest;
		Some(doc)
	}
}
