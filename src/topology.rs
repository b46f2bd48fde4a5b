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

use {
	crate::{
		common::*,
		pool::{ConnectionPool, PooledConnection},
		monitor::{ChangeListener, ProbeReply, ServerMonitor, ServerProbe},
		connection::ConnectionFactory,
		selector::ServerSelector
	},
	std::{
		fmt,
		ops::Deref,
		collections::BTreeSet,
		sync::{Arc, Mutex, Condvar},
		time::{Duration, Instant}
	},
	rand::seq::SliceRandom
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerConnectionState {
	Connecting,
	Connected,
	Unknown
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerType {
	Standalone,
	ReplicaSetPrimary,
	ReplicaSetSecondary,
	ReplicaSetArbiter,
	ReplicaSetOther,
	ShardRouter,
	Unknown
}

impl Default for ServerType {
	fn default() -> Self {
		Self::Unknown
	}
}

impl ServerType {
	pub fn cluster_type(self) -> ClusterType {
		match self {
			Self::Standalone              => ClusterType::Standalone,
			Self::ReplicaSetPrimary
			| Self::ReplicaSetSecondary
			| Self::ReplicaSetArbiter
			| Self::ReplicaSetOther       => ClusterType::ReplicaSet,
			Self::ShardRouter             => ClusterType::Sharded,
			Self::Unknown                 => ClusterType::Unknown
		}
	}
}

/// Snapshot of one server as observed by its monitor. A refresh produces a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
	pub address:          ServerAddress,
	pub state:            ServerConnectionState,
	pub server_type:      ServerType,
	/// Smoothed round trip time of the monitor's probes.
	pub average_latency:  Duration,
	pub tags:             TagSet,
	pub set_name:         Option<String>,
	pub hosts:            Vec<ServerAddress>,
	pub passives:         Vec<ServerAddress>,
	pub arbiters:         Vec<ServerAddress>,
	pub primary:          Option<ServerAddress>,
	pub min_wire_version: i32,
	pub max_wire_version: i32,
	/// The failure that made this server unknown.
	pub error:            Option<String>
}

impl ServerDescription {
	/// A server that has not been probed yet.
	pub fn new(address: ServerAddress) -> Self {
		Self {
			address,
			state:            ServerConnectionState::Connecting,
			server_type:      ServerType::Unknown,
			average_latency:  Duration::from_secs(0),
			tags:             TagSet::new(),
			set_name:         None,
			hosts:            Vec::new(),
			passives:         Vec::new(),
			arbiters:         Vec::new(),
			primary:          None,
			min_wire_version: 0,
			max_wire_version: 0,
			error:            None
		}
	}

	pub fn unknown(address: ServerAddress, error: impl Into<String>) -> Self {
		Self {
			state: ServerConnectionState::Unknown,
			error: Some(error.into()),
			..Self::new(address)
		}
	}

	pub fn from_reply(address: ServerAddress, reply: &ProbeReply, average_latency: Duration) -> Self {
		Self {
			address,
			state:            ServerConnectionState::Connected,
			server_type:      reply.server_type(),
			average_latency,
			tags:             reply.tags.clone(),
			set_name:         reply.set_name.clone(),
			hosts:            reply.hosts.clone(),
			passives:         reply.passives.clone(),
			arbiters:         reply.arbiters.clone(),
			primary:          reply.primary.clone(),
			min_wire_version: reply.min_wire_version,
			max_wire_version: reply.max_wire_version,
			error:            None
		}
	}

	pub fn is_connected(&self) -> bool {
		self.state == ServerConnectionState::Connected
	}

	pub fn is_primary(&self) -> bool {
		self.is_connected() && self.server_type == ServerType::ReplicaSetPrimary
	}

	pub fn is_secondary(&self) -> bool {
		self.is_connected() && self.server_type == ServerType::ReplicaSetSecondary
	}

	pub fn is_shard_router(&self) -> bool {
		self.is_connected() && self.server_type == ServerType::ShardRouter
	}

	pub fn is_replica_set_member(&self) -> bool {
		self.is_connected() && self.server_type.cluster_type() == ClusterType::ReplicaSet
	}

	pub fn has_tags(&self, tags: &TagSet) -> bool {
		tags.matches(&self.tags)
	}

	/// All members of the replica set this server reported.
	pub fn members(&self) -> impl Iterator<Item = &ServerAddress> {
		self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
	}

	pub fn check_replica_set_name(&self, required: Option<&str>) -> Result<()> {
		match required {
			Some(expected) if self.is_connected() && self.set_name.as_deref() != Some(expected) =>
				Err(Error::ReplicaSetMismatch {
					address:  self.address.clone(),
					expected: expected.to_string(),
					actual:   self.set_name.clone().unwrap_or_default()
				}),
			_ => Ok(())
		}
	}

	/// Keeps the reported fields for diagnostics, but excludes the server from selection.
	pub fn unusable(self, error: impl Into<String>) -> Self {
		Self {
			state:       ServerConnectionState::Unknown,
			server_type: ServerType::Unknown,
			error:       Some(error.into()),
			..self
		}
	}
}

impl fmt::Display for ServerDescription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{{} {:?} {:?} {:?}", self.address, self.state, self.server_type, self.average_latency)?;
		if let Some(error) = &self.error {
			write!(f, " error: {}", error)?;
		}
		f.write_str("}")
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClusterType {
	Standalone,
	ReplicaSet,
	Sharded,
	Unknown
}

/// Snapshot of all monitored servers, replaced whenever one of them changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDescription {
	mode:         ClusterConnectionMode,
	cluster_type: ClusterType,
	servers:      Vec<ServerDescription>
}

impl ClusterDescription {
	pub fn new(mode: ClusterConnectionMode, cluster_type: ClusterType, mut servers: Vec<ServerDescription>) -> Self {
		servers.sort_by(|a, b| a.address.cmp(&b.address));
		Self { mode, cluster_type, servers }
	}

	/// Derives the cluster type from the connected servers. Servers of different cluster types
	/// make the cluster type unknown.
	pub fn infer(mode: ClusterConnectionMode, servers: Vec<ServerDescription>) -> Self {
		let mut types = servers.iter()
			.filter(|server| server.is_connected())
			.map(|server| server.server_type.cluster_type())
			.filter(|cluster_type| *cluster_type != ClusterType::Unknown);

		let cluster_type = match types.next() {
			Some(first) if types.all(|t| t == first) => first,
			_ => ClusterType::Unknown
		};

		Self::new(mode, cluster_type, servers)
	}

	pub fn mode(&self) -> ClusterConnectionMode {
		self.mode
	}

	pub fn cluster_type(&self) -> ClusterType {
		self.cluster_type
	}

	/// Ordered by address.
	pub fn servers(&self) -> &[ServerDescription] {
		&self.servers
	}

	pub fn get(&self, address: &ServerAddress) -> Option<&ServerDescription> {
		self.servers.iter().find(|server| &server.address == address)
	}

	pub fn connected(&self) -> impl Iterator<Item = &ServerDescription> {
		self.servers.iter().filter(|server| server.is_connected())
	}

	pub fn primaries(&self) -> impl Iterator<Item = &ServerDescription> {
		self.servers.iter().filter(|server| server.is_primary())
	}

	pub fn secondaries(&self) -> impl Iterator<Item = &ServerDescription> {
		self.servers.iter().filter(|server| server.is_secondary())
	}

	pub fn shard_routers(&self) -> impl Iterator<Item = &ServerDescription> {
		self.servers.iter().filter(|server| server.is_shard_router())
	}
}

impl fmt::Display for ClusterDescription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{mode: {:?}, type: {:?}, servers: [", self.mode, self.cluster_type)?;
		for (i, server) in self.servers.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			write!(f, "{}", server)?;
		}
		f.write_str("]}")
	}
}

#[derive(Debug)]
pub struct ServerInner {
	address: ServerAddress,
	pool:    ConnectionPool,
	monitor: ServerMonitor
}

/// A monitored server and its connection pool.
#[derive(Debug, Clone)]
pub struct Server(Arc<ServerInner>);

impl Deref for Server {
	type Target = ServerInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Server {
	pub fn new(address: ServerAddress, pool: ConnectionPool, monitor: ServerMonitor) -> Self {
		Self(Arc::new(ServerInner { address, pool, monitor }))
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	/// The description most recently published by the monitor.
	pub fn description(&self) -> ServerDescription {
		self.monitor.description()
	}

	/// Starts monitoring.
	pub fn start(&self) -> Result<()> {
		self.monitor.start()
	}

	pub fn connection(&self) -> Result<PooledConnection> {
		self.pool.get()
	}

	/// Drops pooled connections and requests an immediate re-probe, called after a connection
	/// level failure.
	pub fn invalidate(&self) {
		if let Err(e) = self.pool.invalidate() {
			tracing::warn!(address = %self.address, "failed to invalidate connection pool: {}", e);
		}
		self.monitor.invalidate();
	}

	pub fn close(&self) {
		self.monitor.close();
		self.pool.close();
	}
}

pub trait ServerFactory: Send + Sync + fmt::Debug {
	/// Creates a server whose monitor reports to `listener` once started.
	fn create(&self, address: &ServerAddress, listener: ChangeListener) -> Result<Server>;
}

#[derive(Debug)]
pub struct DefaultServerFactory {
	server_settings:    ServerSettings,
	pool_settings:      ConnectionPoolSettings,
	connection_factory: Arc<dyn ConnectionFactory>,
	heartbeat_factory:  Arc<dyn ConnectionFactory>,
	probe:              Arc<dyn ServerProbe>
}

impl DefaultServerFactory {
	pub fn new(
		server_settings:    ServerSettings,
		pool_settings:      ConnectionPoolSettings,
		connection_factory: Arc<dyn ConnectionFactory>,
		heartbeat_factory:  Arc<dyn ConnectionFactory>,
		probe:              Arc<dyn ServerProbe>
	) -> Self {
		Self { server_settings, pool_settings, connection_factory, heartbeat_factory, probe }
	}
}

impl ServerFactory for DefaultServerFactory {
	fn create(&self, address: &ServerAddress, listener: ChangeListener) -> Result<Server> {
		let pool = ConnectionPool::new(address.clone(), self.pool_settings, self.connection_factory.clone())?;
		let monitor = ServerMonitor::new(
			address.clone(),
			self.server_settings,
			self.heartbeat_factory.clone(),
			self.probe.clone(),
			listener
		);
		Ok(Server::new(address.clone(), pool, monitor))
	}
}

/// A selected server together with the description it was selected by.
#[derive(Debug, Clone)]
pub struct ConnectionSource {
	server:      Server,
	description: ServerDescription
}

impl ConnectionSource {
	pub fn server(&self) -> &Server {
		&self.server
	}

	pub fn description(&self) -> &ServerDescription {
		&self.description
	}

	pub fn get_connection(&self) -> Result<PooledConnection> {
		self.server.connection()
	}
}

#[derive(Debug)]
struct ClusterMember {
	server:      Server,
	description: ServerDescription
}

#[derive(Debug)]
struct ClusterState {
	members:     Vec<ClusterMember>,
	description: Arc<ClusterDescription>,
	closed:      bool
}

#[derive(Debug)]
pub struct ClusterInner {
	settings: ClusterSettings,
	factory:  Arc<dyn ServerFactory>,
	state:    Mutex<ClusterState>,
	changed:  Condvar
}

impl Drop for ClusterInner {
	fn drop(&mut self) {
		if let Ok(state) = self.state.get_mut() {
			state.members.iter().for_each(|member| member.server.close());
		}
	}
}

/// Owns one monitored server per known address and aggregates their descriptions.
#[derive(Debug, Clone)]
pub struct Cluster(Arc<ClusterInner>);

impl Deref for Cluster {
	type Target = ClusterInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Cluster {
	pub fn new(settings: ClusterSettings, factory: Arc<dyn ServerFactory>) -> Result<Self> {
		settings.validate()?;
		let mode = settings.mode();
		let cluster = Self(Arc::new(ClusterInner {
			settings,
			factory,
			state:   Mutex::new(ClusterState {
				members:     Vec::new(),
				description: Arc::new(ClusterDescription::new(mode, ClusterType::Unknown, Vec::new())),
				closed:      false
			}),
			changed: Condvar::new()
		}));

		{
			let mut state = cluster.state.lock()?;
			for address in &cluster.settings.hosts {
				cluster.add_server(&mut state, address)?;
			}
			cluster.publish(&mut state);
		}

		tracing::info!(mode = ?mode, hosts = cluster.settings.hosts.len(), "cluster created");
		Ok(cluster)
	}

	pub fn settings(&self) -> &ClusterSettings {
		&self.settings
	}

	/// The current snapshot.
	pub fn description(&self) -> Result<Arc<ClusterDescription>> {
		Ok(self.state.lock()?.description.clone())
	}

	pub fn server(&self, address: &ServerAddress) -> Option<Server> {
		self.state.lock().ok()?.members.iter()
			.find(|member| member.server.address() == address)
			.map(|member| member.server.clone())
	}

	/// Waits until `selector` matches at least one server and picks one of the matches at random.
	pub fn select_server(&self, selector: &dyn ServerSelector, timeout: Duration) -> Result<Server> {
		self.connection_source(selector, timeout).map(|source| source.server)
	}

	/// Like [`Self::select_server`], but also returns the description the server was selected by.
	pub fn connection_source(&self, selector: &dyn ServerSelector, timeout: Duration) -> Result<ConnectionSource> {
		let deadline = Instant::now() + timeout;
		let mut state = self.state.lock()?;
		let mut logged = false;

		loop {
			if state.closed {
				return Err(Error::ClusterClosed);
			}

			let candidates = selector.select(&state.description);
			if let Some(chosen) = candidates.choose(&mut rand::thread_rng()) {
				if let Some(member) = state.members.iter().find(|m| m.server.address() == &chosen.address) {
					return Ok(ConnectionSource { server: member.server.clone(), description: chosen.clone() });
				}
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(Error::SelectionTimeout {
					timeout,
					selector: format!("{:?}", selector),
					cluster:  state.description.to_string()
				});
			}

			if !logged {
				tracing::debug!(selector = ?selector, cluster = %state.description,
					"no server matches, waiting for the cluster to change");
				logged = true;
			}

			state = self.changed.wait_timeout(state, deadline - now)?.0;
		}
	}

	pub fn close(&self) {
		let members = match self.state.lock() {
			Ok(mut state) if !state.closed => {
				state.closed = true;
				std::mem::take(&mut state.members)
			}
			_ => return
		};

		self.changed.notify_all();
		members.iter().for_each(|member| member.server.close());
		tracing::info!("cluster closed");
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().map(|state| state.closed).unwrap_or(true)
	}

	fn add_server(&self, state: &mut ClusterState, address: &ServerAddress) -> Result<()> {
		if state.members.iter().any(|member| member.server.address() == address) {
			return Ok(());
		}

		let cluster = Arc::downgrade(&self.0);
		let listener: ChangeListener = Arc::new(move |description| {
			if let Some(cluster) = cluster.upgrade() {
				Cluster(cluster).on_change(description);
			}
		});

		let server = self.factory.create(address, listener)?;
		state.members.push(ClusterMember {
			server:      server.clone(),
			description: ServerDescription::new(address.clone())
		});

		// the listener blocks on the cluster lock until the member is in place
		if let Err(e) = server.start() {
			state.members.pop();
			server.close();
			return Err(e);
		}

		tracing::info!(address = %address, "monitoring server");
		Ok(())
	}

	fn on_change(&self, mut description: ServerDescription) {
		let removed = {
			let mut state = match self.state.lock() {
				Ok(state) => state,
				Err(_) => return
			};

			if state.closed {
				return;
			}

			let member = match state.members.iter_mut().find(|m| m.server.address() == &description.address) {
				Some(member) => member,
				None => return
			};

			if let Err(e) = description.check_replica_set_name(self.settings.required_replica_set_name.as_deref()) {
				tracing::warn!(address = %description.address, "excluding server from selection: {}", e);
				description = description.unusable(e.to_string());
			}

			member.description = description;
			let removed = match self.settings.mode() {
				ClusterConnectionMode::Multiple => self.discover(&mut state),
				ClusterConnectionMode::Single   => Vec::new()
			};

			self.publish(&mut state);
			removed
		};

		for server in removed {
			tracing::info!(address = %server.address(), "server is no longer a replica set member, closing it");
			server.close();
		}
	}

	/// Starts monitoring newly reported replica set members and returns the servers no longer
	/// reported by any of them.
	fn discover(&self, state: &mut ClusterState) -> Vec<Server> {
		let mut reported = BTreeSet::new();
		let mut any_reported = false;

		for member in &state.members {
			if member.description.is_replica_set_member() && member.description.members().next().is_some() {
				any_reported = true;
				reported.extend(member.description.members().cloned());
			}
		}

		for address in &reported {
			if let Err(e) = self.add_server(state, address) {
				tracing::warn!(address = %address, "failed to start monitoring server: {}", e);
			}
		}

		if !any_reported {
			return Vec::new();
		}

		let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut state.members)
			.into_iter()
			.partition(|member| reported.contains(member.server.address()));
		state.members = kept;
		removed.into_iter().map(|member| member.server).collect()
	}

	/// Replaces the snapshot and wakes selection waiters if anything changed.
	fn publish(&self, state: &mut ClusterState) {
		let servers = state.members.iter().map(|member| member.description.clone()).collect();
		let description = ClusterDescription::infer(self.settings.mode(), servers);

		if *state.description != description {
			if description.cluster_type() != state.description.cluster_type() {
				tracing::info!(cluster_type = ?description.cluster_type(), "cluster type changed");
			}

			state.description = Arc::new(description);
			self.changed.notify_all();
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{testing::*, connection::InternalConnectionFactory, selector::*},
		std::thread
	};

	fn address(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}

	fn cluster(hosts: &[&str], required_replica_set_name: Option<&str>, probe: &Arc<ScriptedProbe>) -> Cluster {
		let streams = MockStreamFactory::new(echo_responder());
		let connections = Arc::new(InternalConnectionFactory::new(
			Arc::new(streams), None, MessageSettings::default()));
		let factory = DefaultServerFactory::new(
			ServerSettings {
				heartbeat_frequency:               Duration::from_millis(20),
				heartbeat_connect_retry_frequency: Duration::from_millis(10),
				..ServerSettings::default()
			},
			ConnectionPoolSettings::default(),
			connections.clone(),
			connections,
			probe.clone()
		);

		Cluster::new(ClusterSettings {
			hosts:                     hosts.iter().map(|h| address(h)).collect(),
			mode:                      None,
			required_replica_set_name: required_replica_set_name.map(str::to_string),
			server_selection_timeout:  Duration::from_secs(5)
		}, Arc::new(factory)).unwrap()
	}

	fn wait_for(cluster: &Cluster, f: impl Fn(&ClusterDescription) -> bool) -> Arc<ClusterDescription> {
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			let description = cluster.description().unwrap();
			if f(&description) {
				return description;
			}
			assert!(Instant::now() < deadline, "cluster never reached the expected state: {}", description);
			thread::sleep(Duration::from_millis(5));
		}
	}

	fn connected(address: &str, reply: &ProbeReply) -> ServerDescription {
		ServerDescription::from_reply(self::address(address), reply, Duration::from_millis(1))
	}

	#[test]
	fn test_infer_cluster_type() {
		let mode = ClusterConnectionMode::Multiple;
		let rs = ClusterDescription::infer(mode, vec![
			connected("a", &primary("rs0", &[])),
			connected("b", &secondary("rs0", &[])),
			ServerDescription::unknown(address("c"), "down")
		]);
		assert_eq!(rs.cluster_type(), ClusterType::ReplicaSet);
		assert_eq!(rs.primaries().count(), 1);
		assert_eq!(rs.secondaries().count(), 1);
		assert_eq!(rs.connected().count(), 2);

		let mixed = ClusterDescription::infer(mode, vec![
			connected("a", &standalone()),
			connected("b", &secondary("rs0", &[]))
		]);
		assert_eq!(mixed.cluster_type(), ClusterType::Unknown);

		let none = ClusterDescription::infer(mode, vec![ServerDescription::new(address("a"))]);
		assert_eq!(none.cluster_type(), ClusterType::Unknown);

		let sharded = ClusterDescription::infer(mode, vec![connected("b", &router()), connected("a", &router())]);
		assert_eq!(sharded.cluster_type(), ClusterType::Sharded);
		assert_eq!(sharded.servers()[0].address, address("a"));
	}

	#[test]
	fn test_replica_set_name_check() {
		let description = connected("a", &primary("rs1", &[]));
		assert!(description.check_replica_set_name(None).is_ok());
		assert!(description.check_replica_set_name(Some("rs1")).is_ok());
		assert!(matches!(description.check_replica_set_name(Some("rs0")),
			Err(Error::ReplicaSetMismatch { expected, actual, .. }) if expected == "rs0" && actual == "rs1"));
		assert!(ServerDescription::new(address("a")).check_replica_set_name(Some("rs0")).is_ok());

		let unusable = description.unusable("mismatch");
		assert!(!unusable.is_connected());
		assert_eq!(unusable.set_name.as_deref(), Some("rs1"));
	}

	#[test]
	fn test_single_standalone() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("localhost"), Ok(standalone()));
		let cluster = cluster(&["localhost"], None, &probe);

		let source = cluster.connection_source(&ReadPreferenceServerSelector::new(
			ReadPreference::secondary(), DEFAULT_ACCEPTABLE_LATENCY_DIFFERENCE), Duration::from_secs(5)).unwrap();
		assert_eq!(source.description().server_type, ServerType::Standalone);
		assert_eq!(cluster.description().unwrap().mode(), ClusterConnectionMode::Single);
		assert!(source.get_connection().is_ok());
		cluster.close();
	}

	#[test]
	fn test_discovers_members() {
		let probe = Arc::new(ScriptedProbe::default());
		let hosts = ["a:27017", "b:27017", "c:27017"];
		probe.set(&address("a"), Ok(primary("rs0", &hosts)));
		probe.set(&address("b"), Ok(secondary("rs0", &hosts)));
		probe.set(&address("c"), Ok(secondary("rs0", &hosts)));
		let cluster = cluster(&["a", "b"], Some("rs0"), &probe);

		let description = wait_for(&cluster, |d| d.connected().count() == 3);
		assert_eq!(description.cluster_type(), ClusterType::ReplicaSet);
		assert_eq!(description.servers().iter().map(|s| s.address.clone()).collect::<Vec<_>>(),
			hosts.iter().map(|h| address(h)).collect::<Vec<_>>());
		cluster.close();
	}

	#[test]
	fn test_drops_unreported_members() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("a"), Ok(primary("rs0", &["a:27017", "b:27017"])));
		probe.set(&address("b"), Ok(secondary("rs0", &["a:27017", "b:27017"])));
		probe.set(&address("z"), Err("connection refused".to_string()));
		let cluster = cluster(&["a", "z"], None, &probe);

		wait_for(&cluster, |d| d.servers().len() == 2 && d.connected().count() == 2 && d.get(&address("z")).is_none());
		assert!(cluster.server(&address("z")).is_none());
		cluster.close();
	}

	#[test]
	fn test_replica_set_mismatch_is_excluded() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("a"), Ok(primary("rs1", &["a:27017"])));
		let cluster = cluster(&["a", "b"], Some("rs0"), &probe);

		let description = wait_for(&cluster, |d| d.get(&address("a")).map_or(false, |s| s.error.is_some()
			&& s.set_name.is_some()));
		let a = description.get(&address("a")).unwrap();
		assert_eq!(a.state, ServerConnectionState::Unknown);
		assert!(a.error.as_deref().unwrap().contains("rs1"));

		let err = cluster.select_server(&PrimaryServerSelector, Duration::from_millis(100)).err().unwrap();
		assert!(matches!(err, Error::SelectionTimeout { .. }));
		assert!(cluster.server(&address("a")).is_some());
		cluster.close();
	}

	#[test]
	fn test_selection_timeout() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("a"), Ok(secondary("rs0", &["a:27017", "b:27017"])));
		probe.set(&address("b"), Ok(secondary("rs0", &["a:27017", "b:27017"])));
		let cluster = cluster(&["a", "b"], None, &probe);
		wait_for(&cluster, |d| d.secondaries().count() == 2);

		let start = Instant::now();
		let err = cluster.select_server(&PrimaryServerSelector, Duration::from_millis(100)).err().unwrap();
		assert!(err.is_timeout());
		assert!(start.elapsed() >= Duration::from_millis(100));
		match err {
			Error::SelectionTimeout { selector, cluster: snapshot, .. } => {
				assert!(selector.contains("PrimaryServerSelector"));
				assert!(snapshot.contains("ReplicaSetSecondary"));
			}
			e => panic!("unexpected error: {}", e)
		}
		cluster.close();
	}

	#[test]
	fn test_selection_waits_for_primary() {
		let probe = Arc::new(ScriptedProbe::default());
		probe.set(&address("a"), Err("no election yet".to_string()));
		let cluster = cluster(&["a", "b"], None, &probe);

		let elect = {
			let probe = probe.clone();
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(50));
				probe.set(&address("a"), Ok(primary("rs0", &["a:27017", "b:27017"])));
			})
		};

		let server = cluster.select_server(&PrimaryServerSelector, Duration::from_secs(5)).unwrap();
		assert_eq!(server.address(), &address("a"));
		assert!(server.description().is_primary());
		elect.join().unwrap();
		cluster.close();
	}

	#[test]
	fn test_close_fails_waiters() {
		let probe = Arc::new(ScriptedProbe::default());
		let cluster = cluster(&["a", "b"], None, &probe);

		let waiter = {
			let cluster = cluster.clone();
			thread::spawn(move || cluster.select_server(&PrimaryServerSelector, Duration::from_secs(5)).map(|_| ()))
		};

		thread::sleep(Duration::from_millis(50));
		cluster.close();
		assert!(matches!(waiter.join().unwrap(), Err(Error::ClusterClosed)));
		assert!(matches!(cluster.connection_source(&PrimaryServerSelector, Duration::from_secs(1)), Err(Error::ClusterClosed)));
		assert!(cluster.is_closed());
	}
}
