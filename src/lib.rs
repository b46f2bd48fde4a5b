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

#![warn(clippy::all)]
#![forbid(unsafe_code)]

use {
	self::{
		connection::{InternalConnectionFactory, TcpStreamFactory},
		monitor::ServerProbe,
		auth::Authenticator,
		wire::{QueryFlags, RequestMessage, ResponseBuffers}
	},
	std::{fmt, time::Duration, sync::{Arc, atomic::{AtomicI32, Ordering}}}
};

pub use self::{common::*, command::*, selector::*, topology::*};

pub mod wire;
pub mod auth;
pub mod common;
pub mod connection;
pub mod pool;
pub mod monitor;
pub mod topology;
pub mod selector;
pub mod command;
#[cfg(test)]
mod testing;

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

pub struct ClientInner {
	pub settings: ClientSettings,
	cluster:      Cluster,
	request_id:   AtomicI32,
	mongos_ha:    Arc<MongosHaServerSelector>
}

impl std::ops::Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl fmt::Debug for ClientInner {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("ClientInner")
			.field("settings", &self.settings)
			.field("cluster", &self.cluster)
			.field("request_id", &self.request_id)
			.finish()
	}
}

impl Client {
	pub fn new(settings: ClientSettings, servers: Arc<dyn ServerFactory>) -> Result<Self> {
		settings.validate()?;
		let cluster = Cluster::new(settings.cluster.clone(), servers)?;
		Ok(Self(Arc::new(ClientInner {
			settings,
			cluster,
			request_id: AtomicI32::new(1),
			mongos_ha:  Arc::new(MongosHaServerSelector::new())
		})))
	}

	/// Connects over TCP. Monitor connections use the heartbeat socket settings and skip
	/// authentication.
	pub fn connect(
		settings:      ClientSettings,
		probe:         Arc<dyn ServerProbe>,
		authenticator: Option<Arc<dyn Authenticator>>
	) -> Result<Self> {
		let connections = Arc::new(InternalConnectionFactory::new(
			Arc::new(TcpStreamFactory::new(settings.socket)),
			authenticator,
			settings.message
		));
		let heartbeats = Arc::new(InternalConnectionFactory::new(
			Arc::new(TcpStreamFactory::new(settings.server.heartbeat_socket)),
			None,
			settings.message
		));
		let servers = DefaultServerFactory::new(settings.server, settings.pool, connections, heartbeats, probe);
		Self::new(settings, Arc::new(servers))
	}

	pub fn cluster(&self) -> &Cluster {
		&self.cluster
	}

	pub fn connection_source(&self, selector: &dyn ServerSelector, timeout: Duration) -> Result<ConnectionSource> {
		self.cluster.connection_source(selector, timeout)
	}

	pub fn command_read_preference(&self, command: &CommandRequest, requested: &ReadPreference) -> Result<ReadPreference> {
		Ok(get_command_read_preference(command, requested, &*self.cluster.description()?))
	}

	/// The selector operations with `read_preference` are dispatched with.
	pub fn selector_for(&self, read_preference: &ReadPreference) -> CompositeServerSelector {
		CompositeServerSelector::new(vec![
			Arc::new(ReadPreferenceServerSelector::new(
				read_preference.clone(), self.settings.acceptable_latency_difference)),
			self.mongos_ha.clone(),
			Arc::new(LatencyMinimizingServerSelector::new(self.settings.acceptable_latency_difference))
		])
	}

	/// Runs the pre-serialized command document `body` against `db`. Uses the client's read
	/// preference if `read_preference` is `None`.
	pub fn run_command(
		&self,
		db:              &str,
		command:         &CommandRequest,
		body:            &[u8],
		read_preference: Option<&ReadPreference>
	) -> Result<ResponseBuffers> {
		let requested = read_preference.unwrap_or(&self.settings.read_preference);
		requested.validate()?;
		let read_preference = self.command_read_preference(command, requested)?;
		let source = self.connection_source(
			&self.selector_for(&read_preference), self.settings.cluster.server_selection_timeout)?;

		let flags = if read_preference.is_slave_ok() || self.settings.cluster.mode() == ClusterConnectionMode::Single {
			QueryFlags::SLAVE_OK
		} else {
			QueryFlags::NONE
		};

		let namespace = format!("{}.$cmd", db);
		let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
		let mut connection = source.get_connection()?;
		let frame = RequestMessage::Query {
			namespace:        &namespace,
			flags,
			number_to_skip:   0,
			number_to_return: -1,
			query:            body,
			fields:           None
		}.encode(request_id, connection.settings())?;

		tracing::debug!(command = %command, address = %source.server().address(), request_id,
			connection_id = connection.id(), "running command");

		connection.send_and_receive(request_id, &frame).map_err(|e| {
			if matches!(e, Error::Io(_) | Error::SocketTimeout(_) | Error::ConnectionClosed(_)) {
				source.server().invalidate();
			}
			e
		})
	}

	pub fn close(&self) {
		self.cluster.close();
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::testing::*,
		std::sync::Mutex
	};

	type Received = Arc<Mutex<Vec<(ServerAddress, Vec<u8>)>>>;

	fn address(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}

	fn client(hosts: &[&str], probe: &Arc<ScriptedProbe>, responder: Responder) -> Client {
		let connections = Arc::new(InternalConnectionFactory::new(
			Arc::new(MockStreamFactory::new(responder)), None, MessageSettings::default()));
		let settings = ClientSettings {
			cluster: ClusterSettings {
				hosts: hosts.iter().map(|h| address(h)).collect(),
				server_selection_timeout: Duration::from_secs(5),
				..ClusterSettings::default()
			},
			server: ServerSettings {
				heartbeat_frequency: Duration::from_millis(20),
				..ServerSettings::default()
			},
			..ClientSettings::default()
		};
		let servers = DefaultServerFactory::new(
			settings.server, settings.pool, connections.clone(), connections, probe.clone());
		Client::new(settings, Arc::new(servers)).unwrap()
	}

	fn recording() -> (Responder, Received) {
		let received = Received::default();
		let responder = {
			let received = received.clone();
			Arc::new(move |address: &ServerAddress, frame: &[u8]| {
				received.lock().unwrap().push((address.clone(), frame.to_vec()));
				Some(reply_frame(request_id_of(frame), &[&EMPTY_DOCUMENT]))
			}) as Responder
		};
		(responder, received)
	}

	fn flags_of(frame: &[u8]) -> QueryFlags {
		QueryFlags(u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]))
	}

	fn namespace_of(frame: &[u8]) -> &str {
		let end = frame[20..].iter().position(|b| *b == 0).unwrap() + 20;
		std::str::from_utf8(&frame[20..end]).unwrap()
	}

	#[test]
	fn test_run_command_direct() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("a"), Ok(secondary("rs0", &["a:27017"])));
		let (responder, received) = recording();
		let client = client(&["a"], &probe, responder);

		let reply = client.run_command("admin", &CommandRequest::new("shutdown"), &EMPTY_DOCUMENT, None).unwrap();
		assert_eq!(reply.documents().count(), 1);

		let received = received.lock().unwrap();
		assert_eq!(received.len(), 1);
		assert_eq!(namespace_of(&received[0].1), "admin.$cmd");
		assert!(flags_of(&received[0].1).contains(QueryFlags::SLAVE_OK));
		client.close();
	}

	#[test]
	fn test_run_command_routing() {
		let probe = Arc::new(ScriptedProbe::default());
		let hosts = ["a:27017", "b:27017"];
		probe.set(&address("a"), Ok(primary("rs0", &hosts)));
		probe.set(&address("b"), Ok(secondary("rs0", &hosts)));
		let (responder, received) = recording();
		let client = client(&hosts, &probe, responder);

		let secondary = ReadPreference::secondary();
		client.run_command("test", &CommandRequest::new("count"), &EMPTY_DOCUMENT, Some(&secondary)).unwrap();
		client.run_command("admin", &CommandRequest::new("shutdown"), &EMPTY_DOCUMENT, Some(&secondary)).unwrap();

		let received = received.lock().unwrap();
		assert_eq!(received[0].0, address("b"));
		assert_eq!(namespace_of(&received[0].1), "test.$cmd");
		assert!(flags_of(&received[0].1).contains(QueryFlags::SLAVE_OK));
		assert_eq!(received[1].0, address("a"));
		assert_eq!(flags_of(&received[1].1), QueryFlags::NONE);
		assert_ne!(request_id_of(&received[0].1), request_id_of(&received[1].1));
		client.close();
	}

	#[test]
	fn test_connection_failure_invalidates_server() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("a"), Ok(standalone()));
		let client = client(&["a"], &probe, Arc::new(|_: &ServerAddress, _: &[u8]| -> Option<Vec<u8>> { None }));

		let err = client.run_command("admin", &CommandRequest::new("ping"), &EMPTY_DOCUMENT, None).err().unwrap();
		assert!(matches!(err, Error::ConnectionClosed(_)));
		let server = client.cluster().server(&address("a")).unwrap();
		assert_eq!(server.pool().generation(), 1);
		assert_eq!(server.pool().size(), 0);
		client.close();
	}

	#[test]
	fn test_primary_only_command_times_out_without_primary() {
		let probe = Arc::new(ScriptedProbe::default());
		let hosts = ["a:27017", "b:27017"];
		probe.set(&address("a"), Ok(secondary("rs0", &hosts)));
		probe.set(&address("b"), Ok(secondary("rs0", &hosts)));
		let (responder, received) = recording();
		let mut client = client(&hosts, &probe, responder);
		Arc::get_mut(&mut client.0).unwrap().settings.cluster.server_selection_timeout = Duration::from_millis(100);

		let secondary = ReadPreference::secondary();
		let err = client.run_command("admin", &CommandRequest::new("shutdown"), &EMPTY_DOCUMENT, Some(&secondary))
			.err().unwrap();
		assert!(matches!(err, Error::SelectionTimeout { .. }));
		assert!(received.lock().unwrap().is_empty());

		let tagged_primary = ReadPreference::primary().with_tag_sets(vec![TagSet::of(&[("dc", "east")])]);
		assert!(matches!(client.run_command("admin", &CommandRequest::new("ping"), &EMPTY_DOCUMENT, Some(&tagged_primary)),
			Err(Error::InvalidSettings(_))));
		client.close();
	}
}
