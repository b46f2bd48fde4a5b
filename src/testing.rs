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

//! In-memory servers for unit tests.

use {
	crate::{
		common::*,
		wire::*,
		connection::{Stream, StreamFactory, InternalConnection},
		monitor::{ProbeReply, ServerProbe}
	},
	std::{
		fmt,
		io::{self, Read, Write},
		collections::{HashMap, HashSet, VecDeque},
		sync::{Arc, Mutex, atomic::{AtomicUsize, Ordering}}
	}
};

pub const EMPTY_DOCUMENT: [u8; 5] = [5, 0, 0, 0, 0];

/// Produces the bytes the server sends back for a complete request frame, `None` closes the stream.
pub type Responder = Arc<dyn Fn(&ServerAddress, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

pub fn request_id_of(frame: &[u8]) -> i32 {
	i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]])
}

pub fn reply_frame(response_to: i32, docs: &[&[u8]]) -> Vec<u8> {
	let mut buf = vec![0u8; HEADER_SIZE];
	buf.extend_from_slice(&0u32.to_le_bytes());
	buf.extend_from_slice(&0i64.to_le_bytes());
	buf.extend_from_slice(&0i32.to_le_bytes());
	buf.extend_from_slice(&(docs.len() as i32).to_le_bytes());
	docs.iter().for_each(|doc| buf.extend_from_slice(doc));
	MessageHeader {
		message_length: buf.len() as _,
		request_id:     next_request_id(),
		response_to,
		op_code:        OpCode::Reply
	}.copy_to_slice(&mut buf[..HEADER_SIZE]);
	buf
}

/// Answers every request with an empty document.
pub fn echo_responder() -> Responder {
	Arc::new(|_: &ServerAddress, frame: &[u8]| Some(reply_frame(request_id_of(frame), &[&EMPTY_DOCUMENT])))
}

#[derive(Default)]
struct Shared {
	sent:      Mutex<Vec<Vec<u8>>>,
	created:   AtomicUsize,
	shutdowns: AtomicUsize,
	refused:   Mutex<HashSet<ServerAddress>>
}

pub struct MockStream {
	address:  ServerAddress,
	responder: Responder,
	shared:   Arc<Shared>,
	inbound:  VecDeque<u8>,
	outbound: Vec<u8>
}

impl Read for MockStream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let n = buf.len().min(self.inbound.len());
		for (dst, src) in buf.iter_mut().zip(self.inbound.drain(..n)) {
			*dst = src;
		}
		Ok(n)
	}
}

impl Write for MockStream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.outbound.extend_from_slice(buf);

		while self.outbound.len() >= 4 {
			let len = request_len(&self.outbound);
			if self.outbound.len() < len {
				break;
			}

			let frame = self.outbound.drain(..len).collect::<Vec<_>>();
			if let Some(reply) = (self.responder)(&self.address, &frame) {
				self.inbound.extend(reply);
			}
			self.shared.sent.lock().unwrap().push(frame);
		}

		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

fn request_len(buf: &[u8]) -> usize {
	i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]).max(4) as usize
}

impl Stream for MockStream {
	fn shutdown(&mut self) -> io::Result<()> {
		self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

#[derive(Clone)]
pub struct MockStreamFactory {
	responder: Responder,
	shared:    Arc<Shared>
}

impl fmt::Debug for MockStreamFactory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MockStreamFactory").finish()
	}
}

impl MockStreamFactory {
	pub fn new(responder: Responder) -> Self {
		Self { responder, shared: Arc::new(Shared::default()) }
	}

	/// Makes connection attempts to `address` fail (or succeed again).
	pub fn refuse(&self, address: &ServerAddress, refuse: bool) {
		let mut refused = self.shared.refused.lock().unwrap();
		if refuse {
			refused.insert(address.clone());
		} else {
			refused.remove(address);
		}
	}

	pub fn sent(&self) -> Vec<Vec<u8>> {
		self.shared.sent.lock().unwrap().clone()
	}

	pub fn created(&self) -> usize {
		self.shared.created.load(Ordering::SeqCst)
	}

	pub fn shutdowns(&self) -> usize {
		self.shared.shutdowns.load(Ordering::SeqCst)
	}
}

impl StreamFactory for MockStreamFactory {
	fn create(&self, address: &ServerAddress) -> Result<Box<dyn Stream>> {
		if self.shared.refused.lock()?.contains(address) {
			return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
		}

		self.shared.created.fetch_add(1, Ordering::SeqCst);
		Ok(Box::new(MockStream {
			address:   address.clone(),
			responder: self.responder.clone(),
			shared:    self.shared.clone(),
			inbound:   VecDeque::new(),
			outbound:  Vec::new()
		}))
	}
}

/// A probe answering from a per address script, unknown addresses fail.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
	replies: Mutex<HashMap<ServerAddress, std::result::Result<ProbeReply, String>>>,
	probes:  AtomicUsize
}

impl ScriptedProbe {
	pub fn set(&self, address: &ServerAddress, reply: std::result::Result<ProbeReply, String>) {
		self.replies.lock().unwrap().insert(address.clone(), reply);
	}

	pub fn probes(&self) -> usize {
		self.probes.load(Ordering::SeqCst)
	}
}

impl ServerProbe for ScriptedProbe {
	fn probe(&self, connection: &mut InternalConnection) -> Result<ProbeReply> {
		self.probes.fetch_add(1, Ordering::SeqCst);
		match self.replies.lock()?.get(connection.address()) {
			Some(Ok(reply)) => Ok(reply.clone()),
			Some(Err(e))    => Err(Error::Protocol(e.clone())),
			None            => Err(Error::Protocol(format!("no reply scripted for {}", connection.address())))
		}
	}
}

pub fn standalone() -> ProbeReply {
	ProbeReply { ismaster: true, ..ProbeReply::default() }
}

pub fn primary(set_name: &str, hosts: &[&str]) -> ProbeReply {
	ProbeReply {
		ismaster: true,
		set_name: Some(set_name.to_string()),
		hosts:    hosts.iter().map(|h| h.parse().unwrap()).collect(),
		..ProbeReply::default()
	}
}

pub fn secondary(set_name: &str, hosts: &[&str]) -> ProbeReply {
	ProbeReply { ismaster: false, secondary: true, ..primary(set_name, hosts) }
}

pub fn router() -> ProbeReply {
	ProbeReply { ismaster: true, msg: Some("isdbgrid".to_string()), ..ProbeReply::default() }
}
