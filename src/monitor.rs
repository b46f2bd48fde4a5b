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

#![allow(clippy::float_cmp)]

use {
	crate::{
		common::*,
		wire::*,
		connection::{ConnectionFactory, InternalConnection},
		topology::{ServerDescription, ServerType, ServerConnectionState}
	},
	std::{fmt, thread, sync::{Arc, Mutex, Condvar}, time::{Duration, Instant}},
	serde::Deserialize
};

/// `{ismaster: 1}`
const IS_MASTER_COMMAND: [u8; 19] = [
	0x13, 0, 0, 0,
	0x10, b'i', b's', b'm', b'a', b's', b't', b'e', b'r', 0, 1, 0, 0, 0,
	0
];

pub const LATENCY_SMOOTHING_FACTOR: f64 = 0.2;

/// The fields of an `ismaster` reply the topology is derived from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeReply {
	pub ok:               f64,
	pub errmsg:           Option<String>,
	pub ismaster:         bool,
	pub secondary:        bool,
	pub arbiter_only:     bool,
	pub hidden:           bool,
	// sharded instances
	pub msg:              Option<String>,
	// replica sets
	pub set_name:         Option<String>,
	pub hosts:            Vec<ServerAddress>,
	pub passives:         Vec<ServerAddress>,
	pub arbiters:         Vec<ServerAddress>,
	pub primary:          Option<ServerAddress>,
	pub tags:             TagSet,
	pub min_wire_version: i32,
	pub max_wire_version: i32
}

impl Default for ProbeReply {
	fn default() -> Self {
		Self {
			ok:               1.0,
			errmsg:           None,
			ismaster:         false,
			secondary:        false,
			arbiter_only:     false,
			hidden:           false,
			msg:              None,
			set_name:         None,
			hosts:            Vec::new(),
			passives:         Vec::new(),
			arbiters:         Vec::new(),
			primary:          None,
			tags:             TagSet::new(),
			min_wire_version: 0,
			max_wire_version: 0
		}
	}
}

impl ProbeReply {
	pub fn is_ok(&self) -> bool {
		self.ok == 1.0
	}

	pub fn server_type(&self) -> ServerType {
		match self {
			Self { msg: Some(msg), .. } if msg == "isdbgrid"          => ServerType::ShardRouter,
			Self { set_name: Some(_), hidden:       true, .. }        => ServerType::ReplicaSetOther,
			Self { set_name: Some(_), ismaster:     true, .. }        => ServerType::ReplicaSetPrimary,
			Self { set_name: Some(_), secondary:    true, .. }        => ServerType::ReplicaSetSecondary,
			Self { set_name: Some(_), arbiter_only: true, .. }        => ServerType::ReplicaSetArbiter,
			Self { set_name: Some(_), .. }                            => ServerType::ReplicaSetOther,
			_                                                         => ServerType::Standalone
		}
	}
}

/// Queries a server's state over a dedicated connection.
pub trait ServerProbe: Send + Sync + fmt::Debug {
	fn probe(&self, connection: &mut InternalConnection) -> Result<ProbeReply>;
}

pub type ReplyDecoder = Arc<dyn Fn(&[u8]) -> std::result::Result<ProbeReply, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Runs the `ismaster` command and hands the reply document to a decoder.
#[derive(Clone)]
pub struct IsMasterProbe {
	decoder: ReplyDecoder
}

impl IsMasterProbe {
	pub fn new(decoder: ReplyDecoder) -> Self {
		Self { decoder }
	}
}

impl fmt::Debug for IsMasterProbe {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IsMasterProbe").finish()
	}
}

impl ServerProbe for IsMasterProbe {
	fn probe(&self, connection: &mut InternalConnection) -> Result<ProbeReply> {
		let request_id = next_request_id();
		let frame = RequestMessage::Query {
			namespace:        "admin.$cmd",
			flags:            QueryFlags::SLAVE_OK,
			number_to_skip:   0,
			number_to_return: -1,
			query:            &IS_MASTER_COMMAND,
			fields:           None
		}.encode(request_id, connection.settings())?;

		let response = connection.send_and_receive(request_id, &frame)?;
		if response.reply_prefix()?.is_query_failure() {
			return Err(Error::Protocol("ismaster query failed".to_string()));
		}

		let document = response.documents()
			.next()
			.ok_or_else(|| Error::Protocol("ismaster reply contains no document".to_string()))?;
		let reply = (self.decoder)(document)
			.map_err(|e| Error::Protocol(format!("invalid ismaster reply: {}", e)))?;

		if reply.is_ok() {
			Ok(reply)
		} else {
			Err(Error::Protocol(reply.errmsg.unwrap_or_else(|| "ismaster failed".to_string())))
		}
	}
}

#[derive(Debug, Clone)]
pub struct ExponentiallyWeightedMovingAverage {
	alpha:   f64,
	average: Option<f64>
}

impl ExponentiallyWeightedMovingAverage {
	pub fn new(alpha: f64) -> Self {
		debug_assert!((0.0..=1.0).contains(&alpha));
		Self { alpha, average: None }
	}

	/// Adds a sample and returns the new average. The first sample is taken as is.
	pub fn add_sample(&mut self, sample: Duration) -> Duration {
		let sample = sample.as_secs_f64();
		let average = match self.average {
			None          => sample,
			Some(average) => self.alpha * sample + (1.0 - self.alpha) * average
		};
		self.average = Some(average);
		Duration::from_secs_f64(average)
	}

	pub fn average(&self) -> Option<Duration> {
		self.average.map(Duration::from_secs_f64)
	}

	pub fn reset(&mut self) {
		self.average = None;
	}
}

impl Default for ExponentiallyWeightedMovingAverage {
	fn default() -> Self {
		Self::new(LATENCY_SMOOTHING_FACTOR)
	}
}

/// Receives every new description a monitor produces.
pub type ChangeListener = Arc<dyn Fn(ServerDescription) + Send + Sync>;

#[derive(Debug, Default)]
struct Signal {
	closed: bool,
	wake:   bool
}

struct MonitorShared {
	address:     ServerAddress,
	settings:    ServerSettings,
	factory:     Arc<dyn ConnectionFactory>,
	probe:       Arc<dyn ServerProbe>,
	listener:    ChangeListener,
	description: Mutex<ServerDescription>,
	signal:      Mutex<Signal>,
	condvar:     Condvar
}

/// Keeps the description of one server up to date on a background thread.
#[derive(Clone)]
pub struct ServerMonitor(Arc<MonitorShared>);

impl fmt::Debug for ServerMonitor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerMonitor")
			.field("address", &self.0.address)
			.finish()
	}
}

impl ServerMonitor {
	pub fn new(
		address:  ServerAddress,
		settings: ServerSettings,
		factory:  Arc<dyn ConnectionFactory>,
		probe:    Arc<dyn ServerProbe>,
		listener: ChangeListener
	) -> Self {
		Self(Arc::new(MonitorShared {
			description: Mutex::new(ServerDescription::new(address.clone())),
			address,
			settings,
			factory,
			probe,
			listener,
			signal:      Mutex::new(Signal::default()),
			condvar:     Condvar::new()
		}))
	}

	pub fn start(&self) -> Result<()> {
		let monitor = MonitorLoop::new(self.0.clone());
		thread::Builder::new()
			.name("server-monitor".to_string())
			.spawn(move || monitor.run())?;
		Ok(())
	}

	pub fn address(&self) -> &ServerAddress {
		&self.0.address
	}

	/// The most recently published description.
	pub fn description(&self) -> ServerDescription {
		self.0.description.lock()
			.map(|description| description.clone())
			.unwrap_or_else(|_| ServerDescription::unknown(self.0.address.clone(), "monitor state poisoned"))
	}

	/// Wakes the monitor for an immediate probe.
	pub fn invalidate(&self) {
		if let Ok(mut signal) = self.0.signal.lock() {
			signal.wake = true;
			self.0.condvar.notify_all();
		}
	}

	pub fn close(&self) {
		if let Ok(mut signal) = self.0.signal.lock() {
			signal.closed = true;
			self.0.condvar.notify_all();
		}
	}
}

struct MonitorLoop {
	shared:      Arc<MonitorShared>,
	connection:  Option<InternalConnection>,
	average:     ExponentiallyWeightedMovingAverage,
	description: ServerDescription,
	next_id:     u32
}

impl MonitorLoop {
	fn new(shared: Arc<MonitorShared>) -> Self {
		Self {
			description: ServerDescription::new(shared.address.clone()),
			shared,
			connection:  None,
			average:     ExponentiallyWeightedMovingAverage::new(LATENCY_SMOOTHING_FACTOR),
			next_id:     0
		}
	}

	fn run(mut self) {
		tracing::debug!(address = %self.shared.address, "server monitor started");

		loop {
			let interval = self.check();
			if !self.wait(interval) {
				break;
			}
		}

		if let Some(connection) = self.connection.as_mut() {
			connection.close();
		}

		tracing::debug!(address = %self.shared.address, "server monitor stopped");
	}

	/// Probes the server once, publishes the outcome and returns the delay until the next probe.
	fn check(&mut self) -> Duration {
		match self.probe() {
			Ok((reply, elapsed)) => {
				let latency = self.average.add_sample(elapsed);
				self.publish(ServerDescription::from_reply(self.shared.address.clone(), &reply, latency));
				self.shared.settings.heartbeat_frequency
			}
			Err(e) => {
				let error = e.to_string();
				if self.description.error.as_deref() != Some(error.as_str()) {
					tracing::warn!(address = %self.shared.address, "server monitor probe failed: {}", error);
				}

				self.average.reset();
				self.connection = None;
				self.publish(ServerDescription::unknown(self.shared.address.clone(), error));
				self.shared.settings.heartbeat_connect_retry_frequency
			}
		}
	}

	fn probe(&mut self) -> Result<(ProbeReply, Duration)> {
		if self.connection.as_ref().map_or(true, InternalConnection::is_closed) {
			if self.description.state == ServerConnectionState::Unknown {
				self.publish(ServerDescription {
					error: self.description.error.clone(),
					..ServerDescription::new(self.shared.address.clone())
				});
			}

			self.next_id = self.next_id.wrapping_add(1);
			self.connection = Some(self.shared.factory.create(&self.shared.address, self.next_id)?);
		}

		let shared = &self.shared;
		match self.connection.as_mut() {
			Some(connection) => {
				let start = Instant::now();
				let reply = shared.probe.probe(connection)?;
				Ok((reply, start.elapsed()))
			}
			None => Err(Error::ConnectionClosed(shared.address.clone()))
		}
	}

	fn publish(&mut self, description: ServerDescription) {
		if description == self.description {
			return;
		}

		if description.is_connected() != self.description.is_connected()
			|| description.server_type != self.description.server_type {
			tracing::info!(address = %description.address, state = ?description.state,
				server_type = ?description.server_type, "server description changed");
		}

		self.description = description.clone();
		if let Ok(mut shared) = self.shared.description.lock() {
			*shared = description.clone();
		}

		(self.shared.listener)(description);
	}

	/// Returns false once the monitor is closed.
	fn wait(&self, interval: Duration) -> bool {
		let signal = match self.shared.signal.lock() {
			Ok(signal) => signal,
			Err(_) => return false
		};

		match self.shared.condvar.wait_timeout_while(signal, interval, |s| !s.closed && !s.wake) {
			Ok((mut signal, _)) => {
				signal.wake = false;
				!signal.closed
			}
			Err(_) => false
		}
	}
}
