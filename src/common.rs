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
	crate::wire::FramingError,
	std::{
		fmt,
		io,
		str::FromStr,
		time::Duration,
		iter::FromIterator,
		collections::BTreeMap,
		net::{SocketAddr, ToSocketAddrs}
	},
	serde::{Deserialize, Deserializer}
};

pub const DEFAULT_MONGO_PORT:                        u16      = 27017;
pub const DEFAULT_HOST:                              &str     = "127.0.0.1";
pub const DEFAULT_CONNECT_TIMEOUT:                   Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_POOL_SIZE:                     usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:                     usize    = 100;
pub const DEFAULT_WAIT_QUEUE_MULTIPLIER:             usize    = 5;
pub const DEFAULT_MAX_WAIT_TIME:                     Duration = Duration::from_secs(120);
pub const DEFAULT_MAINTENANCE_FREQUENCY:             Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT_FREQUENCY:               Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_CONNECT_RETRY_FREQUENCY: Duration = Duration::from_millis(10);
pub const DEFAULT_HEARTBEAT_TIMEOUT:                 Duration = Duration::from_secs(20);
pub const DEFAULT_HEARTBEAT_THREAD_COUNT:            usize    = 1;
pub const DEFAULT_SERVER_SELECTION_TIMEOUT:          Duration = Duration::from_secs(30);
pub const DEFAULT_ACCEPTABLE_LATENCY_DIFFERENCE:     Duration = Duration::from_millis(15);
pub const DEFAULT_MAX_MESSAGE_SIZE:                  usize    = 48_000_000;
pub const DEFAULT_MAX_DOCUMENT_SIZE:                 usize    = 16 * 1024 * 1024;

/// Host and port of a server. Host names are trimmed and lower-cased so that
/// `LocalHost:27017` and `localhost` compare equal.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServerAddress {
	host: String,
	port: u16
}

impl ServerAddress {
	pub fn new(host: &str, port: u16) -> Self {
		Self {
			host: host.trim().trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase(),
			port
		}
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	/// Resolves this address, in the order the resolver returns them.
	pub fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
		(self.host.as_str(), self.port).to_socket_addrs().map(Iterator::collect)
	}
}

impl Default for ServerAddress {
	fn default() -> Self {
		Self::new(DEFAULT_HOST, DEFAULT_MONGO_PORT)
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for ServerAddress {
	type Err = Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		let s = s.trim();
		let invalid = || Error::InvalidAddress(s.to_string());
		let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());

		if s.is_empty() {
			return Err(invalid());
		}

		let (host, port) = if s.starts_with('[') {
			// [ipv6]:port
			let i = s.find(']').ok_or_else(invalid)?;
			let port = match &s[i + 1..] {
				""   => DEFAULT_MONGO_PORT,
				rest => parse_port(rest.strip_prefix(':').ok_or_else(invalid)?)?
			};
			(&s[1..i], port)
		} else {
			match s.find(':') {
				Some(i) if s[i + 1..].contains(':') => (s, DEFAULT_MONGO_PORT),
				Some(i) => (&s[..i], parse_port(&s[i + 1..])?),
				None    => (s, DEFAULT_MONGO_PORT)
			}
		};

		if host.is_empty() {
			return Err(invalid());
		}

		Ok(Self::new(host, port))
	}
}

impl<'de> Deserialize<'de> for ServerAddress {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: Deserializer<'de> {
		String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
	}
}

/// Durations in configuration are given in milliseconds.
mod duration_ms {
	use {super::*};

	pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error> where
		D: Deserializer<'de> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterConnectionMode {
	/// Direct connection to exactly one server.
	Single,
	/// Seed list based discovery of a replica set or a set of routers.
	Multiple
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketSettings {
	/// Zero means the operating system default.
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub connect_timeout: Duration,
	/// Zero means reads and writes never time out.
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub read_timeout:    Duration
}

impl Default for SocketSettings {
	fn default() -> Self {
		Self {
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			read_timeout:    Duration::from_secs(0)
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionPoolSettings {
	pub min_size:              usize,
	pub max_size:              usize,
	/// The wait queue holds at most `max_size * wait_queue_multiplier` callers.
	pub wait_queue_multiplier: usize,
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub max_wait_time:         Duration,
	/// Zero disables idle eviction.
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub max_idle_time:         Duration,
	/// Zero disables lifetime eviction.
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub max_life_time:         Duration,
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub maintenance_frequency: Duration
}

impl ConnectionPoolSettings {
	pub fn max_wait_queue_size(&self) -> usize {
		self.max_size.saturating_mul(self.wait_queue_multiplier)
	}

	pub fn validate(&self) -> Result<()> {
		if self.max_size == 0 {
			Err(Error::InvalidSettings("maxSize must be greater than zero".to_string()))
		} else if self.min_size > self.max_size {
			Err(Error::InvalidSettings(format!(
				"minSize ({}) must not exceed maxSize ({})", self.min_size, self.max_size)))
		} else if self.wait_queue_multiplier == 0 {
			Err(Error::InvalidSettings("waitQueueMultiplier must be greater than zero".to_string()))
		} else if self.maintenance_frequency == Duration::from_secs(0) {
			Err(Error::InvalidSettings("maintenanceFrequency must be greater than zero".to_string()))
		} else {
			Ok(())
		}
	}
}

impl Default for ConnectionPoolSettings {
	fn default() -> Self {
		Self {
			min_size:              DEFAULT_MIN_POOL_SIZE,
			max_size:              DEFAULT_MAX_POOL_SIZE,
			wait_queue_multiplier: DEFAULT_WAIT_QUEUE_MULTIPLIER,
			max_wait_time:         DEFAULT_MAX_WAIT_TIME,
			max_idle_time:         Duration::from_secs(0),
			max_life_time:         Duration::from_secs(0),
			maintenance_frequency: DEFAULT_MAINTENANCE_FREQUENCY
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub heartbeat_frequency:               Duration,
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub heartbeat_connect_retry_frequency: Duration,
	/// Socket settings of the monitor's probe connection, independent of the
	/// ones used for ordinary traffic.
	pub heartbeat_socket:                  SocketSettings,
	/// Kept for configuration compatibility. Every monitored address runs its own loop,
	/// the value is only validated.
	pub heartbeat_thread_count:            usize
}

impl ServerSettings {
	pub fn validate(&self) -> Result<()> {
		if self.heartbeat_frequency == Duration::from_secs(0) {
			Err(Error::InvalidSettings("heartbeatFrequency must be greater than zero".to_string()))
		} else if self.heartbeat_connect_retry_frequency == Duration::from_secs(0) {
			Err(Error::InvalidSettings("heartbeatConnectRetryFrequency must be greater than zero".to_string()))
		} else if self.heartbeat_thread_count == 0 {
			Err(Error::InvalidSettings("heartbeatThreadCount must be greater than zero".to_string()))
		} else {
			Ok(())
		}
	}
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			heartbeat_frequency:               DEFAULT_HEARTBEAT_FREQUENCY,
			heartbeat_connect_retry_frequency: DEFAULT_HEARTBEAT_CONNECT_RETRY_FREQUENCY,
			heartbeat_socket:                  SocketSettings {
				connect_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
				read_timeout:    DEFAULT_HEARTBEAT_TIMEOUT
			},
			heartbeat_thread_count:            DEFAULT_HEARTBEAT_THREAD_COUNT
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
	pub hosts:                     Vec<ServerAddress>,
	/// Derived from the number of hosts if not set.
	pub mode:                      Option<ClusterConnectionMode>,
	pub required_replica_set_name: Option<String>,
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub server_selection_timeout:  Duration
}

impl ClusterSettings {
	pub fn mode(&self) -> ClusterConnectionMode {
		self.mode.unwrap_or(if self.hosts.len() == 1 {
			ClusterConnectionMode::Single
		} else {
			ClusterConnectionMode::Multiple
		})
	}

	pub fn validate(&self) -> Result<()> {
		if self.hosts.is_empty() {
			Err(Error::InvalidSettings("at least one host is required".to_string()))
		} else if self.mode() == ClusterConnectionMode::Single && self.hosts.len() > 1 {
			Err(Error::InvalidSettings(format!(
				"single mode requires exactly one host, got {}", self.hosts.len())))
		} else {
			Ok(())
		}
	}
}

impl Default for ClusterSettings {
	fn default() -> Self {
		Self {
			hosts:                     vec![ServerAddress::default()],
			mode:                      None,
			required_replica_set_name: None,
			server_selection_timeout:  DEFAULT_SERVER_SELECTION_TIMEOUT
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageSettings {
	pub max_message_size:  usize,
	pub max_document_size: usize
}

impl Default for MessageSettings {
	fn default() -> Self {
		Self {
			max_message_size:  DEFAULT_MAX_MESSAGE_SIZE,
			max_document_size: DEFAULT_MAX_DOCUMENT_SIZE
		}
	}
}

/// Everything the core consumes from the outer configuration layer.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
	pub cluster:                       ClusterSettings,
	pub server:                        ServerSettings,
	pub pool:                          ConnectionPoolSettings,
	pub socket:                        SocketSettings,
	pub message:                       MessageSettings,
	pub read_preference:               ReadPreference,
	#[serde(deserialize_with = "duration_ms::deserialize")]
	pub acceptable_latency_difference: Duration
}

impl ClientSettings {
	pub fn validate(&self) -> Result<()> {
		self.cluster.validate()?;
		self.server.validate()?;
		self.pool.validate()?;
		self.read_preference.validate()
	}
}

impl Default for ClientSettings {
	fn default() -> Self {
		Self {
			cluster:                       ClusterSettings::default(),
			server:                        ServerSettings::default(),
			pool:                          ConnectionPoolSettings::default(),
			socket:                        SocketSettings::default(),
			message:                       MessageSettings::default(),
			read_preference:               ReadPreference::default(),
			acceptable_latency_difference: DEFAULT_ACCEPTABLE_LATENCY_DIFFERENCE
		}
	}
}

/// Key/value labels of a replica set member, also used as one alternative of
/// a read preference. An empty set matches every server.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn of(tags: &[(&str, &str)]) -> Self {
		tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// Returns true if every tag of this set is present with the same value in `tags`.
	pub fn matches(&self, tags: &TagSet) -> bool {
		self.0.iter().all(|(k, v)| tags.0.get(k) == Some(v))
	}
}

impl FromIterator<(String, String)> for TagSet {
	fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadPreference {
	pub mode:     ReadPreferenceMode,
	/// Alternatives tried in order, the first one matching at least one server wins.
	pub tag_sets: Vec<TagSet>
}

impl ReadPreference {
	pub fn new(mode: ReadPreferenceMode, tag_sets: Vec<TagSet>) -> Self {
		Self { mode, tag_sets }
	}

	pub fn primary() -> Self {
		Self::new(ReadPreferenceMode::Primary, Vec::new())
	}

	pub fn primary_preferred() -> Self {
		Self::new(ReadPreferenceMode::PrimaryPreferred, Vec::new())
	}

	pub fn secondary() -> Self {
		Self::new(ReadPreferenceMode::Secondary, Vec::new())
	}

	pub fn secondary_preferred() -> Self {
		Self::new(ReadPreferenceMode::SecondaryPreferred, Vec::new())
	}

	pub fn nearest() -> Self {
		Self::new(ReadPreferenceMode::Nearest, Vec::new())
	}

	pub fn with_tag_sets(self, tag_sets: Vec<TagSet>) -> Self {
		Self { tag_sets, ..self }
	}

	pub fn is_slave_ok(&self) -> bool {
		self.mode != ReadPreferenceMode::Primary
	}

	pub fn validate(&self) -> Result<()> {
		if self.mode == ReadPreferenceMode::Primary && !self.tag_sets.is_empty() {
			Err(Error::InvalidSettings("read preference `primary` cannot have tag sets".to_string()))
		} else {
			Ok(())
		}
	}
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self::primary()
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl Default for ReadPreferenceMode {
	fn default() -> Self {
		Self::Primary
	}
}

impl FromStr for ReadPreferenceMode {
	type Err = Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(Error::InvalidSettings(format!("unknown read preference `{}`", s)))
		})
	}
}

pub type MDBResult<T> = std::result::Result<T, Error>;
pub type Result<T> = MDBResult<T>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("timed out connecting to {0}")]
	ConnectTimeout(ServerAddress),
	#[error("timed out reading from or writing to {0}")]
	SocketTimeout(ServerAddress),
	#[error("too many threads are waiting for a connection to {address} (max {max_wait_queue_size})")]
	PoolExhausted {
		address:             ServerAddress,
		max_wait_queue_size: usize
	},
	#[error("timed out after {timeout:?} waiting for a connection to {address}")]
	PoolWaitTimeout {
		address: ServerAddress,
		timeout: Duration
	},
	#[error("the connection pool to {0} is closed")]
	PoolClosed(ServerAddress),
	#[error("timed out after {timeout:?} waiting for a server that matches {selector}, cluster is {cluster}")]
	SelectionTimeout {
		timeout:  Duration,
		selector: String,
		cluster:  String
	},
	#[error("invalid message frame: {0}")]
	Framing(#[from] FramingError),
	#[error("{address} belongs to replica set `{actual}`, but `{expected}` is required")]
	ReplicaSetMismatch {
		address:  ServerAddress,
		expected: String,
		actual:   String
	},
	#[error("failed to authenticate user {user:?}: {source}")]
	Authentication {
		user:   Option<String>,
		source: Box<dyn std::error::Error + Send + Sync>
	},
	#[error("protocol error: {0}")]
	Protocol(String),
	#[error("the connection to {0} is closed")]
	ConnectionClosed(ServerAddress),
	#[error("the cluster is closed")]
	ClusterClosed,
	#[error("invalid settings: {0}")]
	InvalidSettings(String),
	#[error("invalid server address `{0}`")]
	InvalidAddress(String),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("a lock was poisoned")]
	Sync
}

impl Error {
	/// Timeouts are retryable by the caller, unlike most other failures.
	pub fn is_timeout(&self) -> bool {
		matches!(self,
			Self::ConnectTimeout(_)
			| Self::SocketTimeout(_)
			| Self::PoolWaitTimeout { .. }
			| Self::SelectionTimeout { .. })
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_address() {
		let address: ServerAddress = " LocalHost:27018 ".parse().unwrap();
		assert_eq!(address, ServerAddress::new("localhost", 27018));
		assert_eq!(address.to_string(), "localhost:27018");

		assert_eq!("db.example.com".parse::<ServerAddress>().unwrap().port(), DEFAULT_MONGO_PORT);
		assert_eq!("[::1]:1234".parse::<ServerAddress>().unwrap(), ServerAddress::new("::1", 1234));
		assert_eq!("[::1]".parse::<ServerAddress>().unwrap().to_string(), "[::1]:27017");
		assert_eq!("fe80::1".parse::<ServerAddress>().unwrap().host(), "fe80::1");

		assert!(matches!("".parse::<ServerAddress>(), Err(Error::InvalidAddress(_))));
		assert!(matches!("host:port".parse::<ServerAddress>(), Err(Error::InvalidAddress(_))));
		assert!(matches!(":27017".parse::<ServerAddress>(), Err(Error::InvalidAddress(_))));
		assert!(matches!("[::1]x".parse::<ServerAddress>(), Err(Error::InvalidAddress(_))));
	}

	#[test]
	fn test_defaults() {
		let settings = ClientSettings::default();
		assert_eq!(settings.pool.min_size, 0);
		assert_eq!(settings.pool.max_size, 100);
		assert_eq!(settings.pool.max_wait_queue_size(), 500);
		assert_eq!(settings.socket.connect_timeout, Duration::from_secs(10));
		assert_eq!(settings.read_preference, ReadPreference::primary());
		assert_eq!(settings.cluster.mode(), ClusterConnectionMode::Single);
		assert!(settings.validate().is_ok());
	}

	#[test]
	fn test_deserialize_settings() {
		let settings: ClientSettings = serde_json::from_str(r#"{
			"cluster": {
				"hosts": ["a:27017", "B:27018"],
				"requiredReplicaSetName": "rs0",
				"serverSelectionTimeout": 500
			},
			"server": { "heartbeatFrequency": 5, "heartbeatConnectRetryFrequency": 10, "heartbeatThreadCount": 4 },
			"pool": { "minSize": 30, "maxSize": 500, "maxWaitTime": 200, "maxIdleTime": 300, "maxLifeTime": 400, "waitQueueMultiplier": 1 },
			"readPreference": { "mode": "secondary", "tagSets": [{ "dc": "east" }, {}] },
			"acceptableLatencyDifference": 20
		}"#).unwrap();

		assert_eq!(settings.cluster.hosts, vec![ServerAddress::new("a", 27017), ServerAddress::new("b", 27018)]);
		assert_eq!(settings.cluster.mode(), ClusterConnectionMode::Multiple);
		assert_eq!(settings.cluster.required_replica_set_name.as_deref(), Some("rs0"));
		assert_eq!(settings.cluster.server_selection_timeout, Duration::from_millis(500));
		assert_eq!(settings.server.heartbeat_frequency, Duration::from_millis(5));
		assert_eq!(settings.server.heartbeat_connect_retry_frequency, Duration::from_millis(10));
		assert_eq!(settings.server.heartbeat_socket, ServerSettings::default().heartbeat_socket);
		assert_eq!(settings.server.heartbeat_thread_count, 4);
		assert_eq!(settings.pool.min_size, 30);
		assert_eq!(settings.pool.max_size, 500);
		assert_eq!(settings.pool.max_wait_time, Duration::from_millis(200));
		assert_eq!(settings.pool.max_idle_time, Duration::from_millis(300));
		assert_eq!(settings.pool.max_life_time, Duration::from_millis(400));
		assert_eq!(settings.pool.max_wait_queue_size(), 500);
		assert_eq!(settings.read_preference, ReadPreference::secondary()
			.with_tag_sets(vec![TagSet::of(&[("dc", "east")]), TagSet::new()]));
		assert_eq!(settings.acceptable_latency_difference, Duration::from_millis(20));
		assert!(settings.validate().is_ok());
	}

	#[test]
	fn test_invalid_settings() {
		let mut pool = ConnectionPoolSettings::default();
		pool.max_size = 0;
		assert!(matches!(pool.validate(), Err(Error::InvalidSettings(_))));

		let mut pool = ConnectionPoolSettings::default();
		pool.wait_queue_multiplier = 0;
		assert!(matches!(pool.validate(), Err(Error::InvalidSettings(_))));

		let mut pool = ConnectionPoolSettings::default();
		pool.min_size = 101;
		assert!(matches!(pool.validate(), Err(Error::InvalidSettings(_))));

		let server = ServerSettings { heartbeat_thread_count: 0, ..ServerSettings::default() };
		assert!(matches!(server.validate(), Err(Error::InvalidSettings(_))));

		let cluster = ClusterSettings {
			hosts: vec![ServerAddress::new("a", 1), ServerAddress::new("b", 1)],
			mode:  Some(ClusterConnectionMode::Single),
			..ClusterSettings::default()
		};
		assert!(matches!(cluster.validate(), Err(Error::InvalidSettings(_))));

		let read_preference = ReadPreference::primary().with_tag_sets(vec![TagSet::of(&[("dc", "east")])]);
		assert!(matches!(read_preference.validate(), Err(Error::InvalidSettings(_))));

		assert!(serde_json::from_str::<ClusterSettings>(r#"{ "hosts": ["a:b"] }"#).is_err());
	}

	#[test]
	fn test_tag_set_matches() {
		let tags = TagSet::of(&[("dc", "east"), ("rack", "1")]);
		assert!(TagSet::new().matches(&tags));
		assert!(TagSet::of(&[("dc", "east")]).matches(&tags));
		assert!(!TagSet::of(&[("dc", "west")]).matches(&tags));
		assert!(!TagSet::of(&[("dc", "east"), ("disk", "ssd")]).matches(&tags));
		assert_eq!(tags.get("rack"), Some("1"));
	}

	#[test]
	fn test_timeout_classification() {
		let address = ServerAddress::default();
		assert!(Error::ConnectTimeout(address.clone()).is_timeout());
		assert!(Error::PoolWaitTimeout { address: address.clone(), timeout: Duration::from_secs(1) }.is_timeout());
		assert!(!Error::PoolExhausted { address, max_wait_queue_size: 1 }.is_timeout());
		assert!(!Error::ClusterClosed.is_timeout());
	}
}
