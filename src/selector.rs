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
	crate::{common::*, topology::*},
	std::{fmt, sync::{Arc, Mutex}, time::Duration}
};

/// Narrows a cluster snapshot down to the servers an operation may run on.
pub trait ServerSelector: Send + Sync + fmt::Debug {
	fn select(&self, cluster: &ClusterDescription) -> Vec<ServerDescription>;
}

/// With a direct connection there is nothing to choose from.
fn single(cluster: &ClusterDescription) -> Option<Vec<ServerDescription>> {
	match cluster.mode() {
		ClusterConnectionMode::Single   => Some(cluster.connected().cloned().collect()),
		ClusterConnectionMode::Multiple => None
	}
}

/// Drops every server slower than the fastest one plus `window`.
pub fn within_latency_window(servers: Vec<ServerDescription>, window: Duration) -> Vec<ServerDescription> {
	let fastest = match servers.iter().map(|server| server.average_latency).min() {
		Some(fastest) => fastest,
		None => return servers
	};

	servers.into_iter()
		.filter(|server| server.average_latency <= fastest + window)
		.collect()
}

#[derive(Debug, Copy, Clone, Default)]
pub struct PrimaryServerSelector;

impl ServerSelector for PrimaryServerSelector {
	fn select(&self, cluster: &ClusterDescription) -> Vec<ServerDescription> {
		single(cluster).unwrap_or_else(|| cluster.primaries().cloned().collect())
	}
}

#[derive(Debug, Clone)]
pub struct ReadPreferenceServerSelector {
	read_preference:               ReadPreference,
	acceptable_latency_difference: Duration
}

impl ReadPreferenceServerSelector {
	pub fn new(read_preference: ReadPreference, acceptable_latency_difference: Duration) -> Self {
		Self { read_preference, acceptable_latency_difference }
	}

	pub fn read_preference(&self) -> &ReadPreference {
		&self.read_preference
	}

	/// Applies the first tag set alternative that matches at least one candidate.
	fn tagged<'a>(&self, candidates: impl Iterator<Item = &'a ServerDescription>) -> Vec<ServerDescription> {
		let candidates = candidates.collect::<Vec<_>>();
		if self.read_preference.tag_sets.is_empty() {
			return candidates.into_iter().cloned().collect();
		}

		self.read_preference.tag_sets.iter()
			.map(|tags| candidates.iter()
				.filter(|server| server.has_tags(tags))
				.map(|server| (*server).clone())
				.collect::<Vec<_>>())
			.find(|matched| !matched.is_empty())
			.unwrap_or_default()
	}
}

impl ServerSelector for ReadPreferenceServerSelector {
	fn select(&self, cluster: &ClusterDescription) -> Vec<ServerDescription> {
		if let Some(servers) = single(cluster) {
			return servers;
		}

		match cluster.cluster_type() {
			ClusterType::Standalone | ClusterType::Sharded => return cluster.connected().cloned().collect(),
			ClusterType::Unknown => return Vec::new(),
			ClusterType::ReplicaSet => ()
		}

		let primaries = || cluster.primaries().cloned().collect::<Vec<_>>();
		match self.read_preference.mode {
			ReadPreferenceMode::Primary => primaries(),
			ReadPreferenceMode::PrimaryPreferred => match primaries() {
				primaries if primaries.is_empty() => self.tagged(cluster.secondaries()),
				primaries => primaries
			},
			ReadPreferenceMode::Secondary => self.tagged(cluster.secondaries()),
			ReadPreferenceMode::SecondaryPreferred => match self.tagged(cluster.secondaries()) {
				secondaries if secondaries.is_empty() => primaries(),
				secondaries => secondaries
			},
			ReadPreferenceMode::Nearest => within_latency_window(
				self.tagged(cluster.primaries().chain(cluster.secondaries())),
				self.acceptable_latency_difference
			)
		}
	}
}

#[derive(Debug, Copy, Clone)]
pub struct LatencyMinimizingServerSelector {
	acceptable_latency_difference: Duration
}

impl LatencyMinimizingServerSelector {
	pub fn new(acceptable_latency_difference: Duration) -> Self {
		Self { acceptable_latency_difference }
	}
}

impl Default for LatencyMinimizingServerSelector {
	fn default() -> Self {
		Self::new(DEFAULT_ACCEPTABLE_LATENCY_DIFFERENCE)
	}
}

impl ServerSelector for LatencyMinimizingServerSelector {
	fn select(&self, cluster: &ClusterDescription) -> Vec<ServerDescription> {
		within_latency_window(cluster.connected().cloned().collect(), self.acceptable_latency_difference)
	}
}

/// Runs each selector on the candidates of the previous one.
#[derive(Debug, Clone)]
pub struct CompositeServerSelector(Vec<Arc<dyn ServerSelector>>);

impl CompositeServerSelector {
	pub fn new(selectors: Vec<Arc<dyn ServerSelector>>) -> Self {
		Self(selectors)
	}
}

impl ServerSelector for CompositeServerSelector {
	fn select(&self, cluster: &ClusterDescription) -> Vec<ServerDescription> {
		let mut candidates = cluster.servers().to_vec();
		for selector in &self.0 {
			let narrowed = ClusterDescription::new(cluster.mode(), cluster.cluster_type(), candidates);
			candidates = selector.select(&narrowed);
			if candidates.is_empty() {
				break;
			}
		}
		candidates
	}
}

/// Keeps using the same router as long as it stays connected, so that consecutive operations see
/// a consistent view of the sharded cluster.
#[derive(Debug, Default)]
pub struct MongosHaServerSelector {
	stuck_to: Mutex<Option<ServerAddress>>
}

impl MongosHaServerSelector {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn stuck_to(&self) -> Option<ServerAddress> {
		self.stuck_to.lock().ok()?.clone()
	}
}

impl ServerSelector for MongosHaServerSelector {
	fn select(&self, cluster: &ClusterDescription) -> Vec<ServerDescription> {
		if cluster.cluster_type() != ClusterType::Sharded {
			return cluster.servers().to_vec();
		}

		let mut stuck_to = match self.stuck_to.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner()
		};

		if let Some(server) = stuck_to.as_ref()
			.and_then(|address| cluster.get(address))
			.filter(|server| server.is_shard_router()) {
			return vec![server.clone()];
		}

		let fastest = cluster.shard_routers().min_by_key(|server| server.average_latency);
		if let Some(server) = fastest {
			tracing::debug!(address = %server.address, "sticking to router");
		}

		*stuck_to = fastest.map(|server| server.address.clone());
		fastest.cloned().into_iter().collect()
	}
}
