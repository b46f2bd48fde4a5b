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
	crate::{common::*, connection::{ConnectionFactory, InternalConnection}},
	std::{
		thread,
		ops::{Deref, DerefMut},
		sync::{Arc, Weak, Mutex, Condvar},
		time::{Duration, Instant}
	}
};

#[derive(Debug)]
struct IdleConnection {
	connection: InternalConnection,
	generation: usize,
	last_used:  Instant
}

#[derive(Debug, Default)]
struct PoolState {
	/// Most recently returned connection last.
	idle:                  Vec<IdleConnection>,
	/// Idle, checked out and currently opening connections.
	total:                 usize,
	waiters:               usize,
	next_id:               u32,
	generation:            usize,
	closed:                bool,
	maintenance_requested: bool
}

#[derive(Debug)]
pub struct PoolInner {
	address:     ServerAddress,
	settings:    ConnectionPoolSettings,
	factory:     Arc<dyn ConnectionFactory>,
	state:       Mutex<PoolState>,
	available:   Condvar,
	maintenance: Condvar
}

/// A bounded set of connections to one server.
#[derive(Debug, Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

impl Deref for ConnectionPool {
	type Target = PoolInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

fn expired(limit: Duration, since: Instant, now: Instant) -> bool {
	limit != Duration::from_secs(0) && now.saturating_duration_since(since) > limit
}

enum Checkout {
	Idle(IdleConnection),
	Open { id: u32, generation: usize }
}

impl ConnectionPool {
	pub fn new(
		address:  ServerAddress,
		settings: ConnectionPoolSettings,
		factory:  Arc<dyn ConnectionFactory>
	) -> Result<Self> {
		settings.validate()?;

		let pool = Self(Arc::new(PoolInner {
			address,
			settings,
			factory,
			state:       Mutex::new(PoolState::default()),
			available:   Condvar::new(),
			maintenance: Condvar::new()
		}));

		if settings.min_size > 0
			|| settings.max_idle_time != Duration::from_secs(0)
			|| settings.max_life_time != Duration::from_secs(0) {
			let weak = Arc::downgrade(&pool.0);
			thread::Builder::new()
				.name("pool-maintenance".to_string())
				.spawn(move || run_maintenance(weak))?;
		}

		tracing::debug!(address = %pool.address, max_size = settings.max_size, "connection pool created");
		Ok(pool)
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn settings(&self) -> &ConnectionPoolSettings {
		&self.settings
	}

	/// Checks out a connection, waiting at most the configured `max_wait_time`.
	pub fn get(&self) -> Result<PooledConnection> {
		self.get_with_timeout(self.settings.max_wait_time)
	}

	pub fn get_with_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
		let deadline = Instant::now() + timeout;
		let mut discarded = Vec::new();
		let mut state = self.state.lock()?;
		let mut queued = false;

		let checkout = loop {
			if state.closed {
				break Err(Error::PoolClosed(self.address.clone()));
			}

			// idle connections past their limits are never handed out
			let now = Instant::now();
			let mut reusable = None;
			while let Some(idle) = state.idle.pop() {
				if self.is_stale(&idle, state.generation, now) {
					state.total -= 1;
					discarded.push(idle);
				} else {
					reusable = Some(idle);
					break;
				}
			}

			if let Some(idle) = reusable {
				break Ok(Checkout::Idle(idle));
			}

			if state.total < self.settings.max_size {
				state.total += 1;
				state.next_id = state.next_id.wrapping_add(1);
				break Ok(Checkout::Open { id: state.next_id, generation: state.generation });
			}

			if !queued {
				if state.waiters >= self.settings.max_wait_queue_size() {
					break Err(Error::PoolExhausted {
						address:             self.address.clone(),
						max_wait_queue_size: self.settings.max_wait_queue_size()
					});
				}

				state.waiters += 1;
				queued = true;
			}

			if now >= deadline {
				break Err(Error::PoolWaitTimeout { address: self.address.clone(), timeout });
			}

			state = self.available.wait_timeout(state, deadline - now)?.0;
		};

		if queued {
			state.waiters -= 1;
		}

		let refill = !discarded.is_empty() && state.total < self.settings.min_size;
		if refill {
			state.maintenance_requested = true;
		}

		drop(state);
		for idle in discarded {
			tracing::debug!(address = %self.address, connection_id = idle.connection.id(),
				"discarding stale idle connection");
		}

		if refill {
			self.maintenance.notify_one();
		}

		match checkout? {
			Checkout::Idle(idle) => {
				tracing::debug!(address = %self.address, connection_id = idle.connection.id(), "connection checked out");
				Ok(PooledConnection {
					connection: Some(idle.connection),
					generation: idle.generation,
					pool:       self.clone()
				})
			}
			Checkout::Open { id, generation } => match self.factory.create(&self.address, id) {
				Ok(connection) => {
					let closed = self.state.lock()?.closed;
					if closed {
						self.abandon(connection);
						return Err(Error::PoolClosed(self.address.clone()));
					}

					tracing::debug!(address = %self.address, connection_id = id, "connection checked out");
					Ok(PooledConnection { connection: Some(connection), generation, pool: self.clone() })
				}
				Err(e) => {
					self.state.lock()?.total -= 1;
					self.available.notify_one();
					Err(e)
				}
			}
		}
	}

	/// Closes all idle connections and makes checked out connections of the current generation
	/// stale, they are discarded when released.
	pub fn invalidate(&self) -> Result<()> {
		let idle = {
			let mut state = self.state.lock()?;
			state.generation += 1;
			let idle = std::mem::take(&mut state.idle);
			state.total -= idle.len();
			if state.total < self.settings.min_size {
				state.maintenance_requested = true;
			}
			idle
		};

		tracing::debug!(address = %self.address, discarded = idle.len(), "connection pool invalidated");
		self.maintenance.notify_one();
		Ok(())
	}

	/// Closes idle connections, fails current and future checkouts. Checked out connections are
	/// closed when released.
	pub fn close(&self) {
		let idle = match self.state.lock() {
			Ok(mut state) if !state.closed => {
				state.closed = true;
				let idle = std::mem::take(&mut state.idle);
				state.total -= idle.len();
				idle
			}
			_ => return
		};

		self.available.notify_all();
		self.maintenance.notify_all();
		tracing::debug!(address = %self.address, discarded = idle.len(), "connection pool closed");
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().map(|state| state.closed).unwrap_or(true)
	}

	pub fn size(&self) -> usize {
		self.state.lock().map(|state| state.total).unwrap_or(0)
	}

	pub fn idle_count(&self) -> usize {
		self.state.lock().map(|state| state.idle.len()).unwrap_or(0)
	}

	pub fn checked_out_count(&self) -> usize {
		self.state.lock().map(|state| state.total - state.idle.len()).unwrap_or(0)
	}

	pub fn wait_queue_len(&self) -> usize {
		self.state.lock().map(|state| state.waiters).unwrap_or(0)
	}

	pub fn generation(&self) -> usize {
		self.state.lock().map(|state| state.generation).unwrap_or(0)
	}
}

impl PoolInner {
	fn is_stale(&self, idle: &IdleConnection, generation: usize, now: Instant) -> bool {
		idle.connection.is_closed()
			|| idle.generation != generation
			|| expired(self.settings.max_idle_time, idle.last_used, now)
			|| expired(self.settings.max_life_time, idle.connection.opened_at(), now)
	}

	fn release(&self, mut connection: InternalConnection, generation: usize) {
		let mut state = match self.state.lock() {
			Ok(state) => state,
			Err(_) => return
		};

		let id = connection.id();
		let reason = if state.closed {
			Some("pool closed")
		} else if connection.is_closed() {
			Some("connection closed")
		} else if generation != state.generation {
			Some("stale generation")
		} else if expired(self.settings.max_life_time, connection.opened_at(), Instant::now()) {
			Some("lifetime exceeded")
		} else {
			None
		};

		match reason {
			None => {
				state.idle.push(IdleConnection { connection, generation, last_used: Instant::now() });
				drop(state);
				self.available.notify_one();
				tracing::debug!(address = %self.address, connection_id = id, "connection checked in");
			}
			Some(reason) => {
				state.total -= 1;
				let refill = !state.closed && state.total < self.settings.min_size;
				if refill {
					state.maintenance_requested = true;
				}

				drop(state);
				connection.close();
				tracing::debug!(address = %self.address, connection_id = id, reason, "connection discarded");
				self.available.notify_one();
				if refill {
					self.maintenance.notify_one();
				}
			}
		}
	}

	/// Prunes expired idle connections and opens new ones until `min_size` is reached.
	fn maintain(&self) -> Result<()> {
		let stale = {
			let mut state = self.state.lock()?;
			let (now, generation) = (Instant::now(), state.generation);
			let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
				.into_iter()
				.partition(|idle| self.is_stale(idle, generation, now));
			state.idle = fresh;
			state.total -= stale.len();
			state.maintenance_requested = false;
			stale
		};

		if !stale.is_empty() {
			tracing::debug!(address = %self.address, discarded = stale.len(), "pruned idle connections");
		}

		loop {
			let (id, generation) = {
				let mut state = self.state.lock()?;
				if state.closed || state.total >= self.settings.min_size {
					return Ok(());
				}

				state.total += 1;
				state.next_id = state.next_id.wrapping_add(1);
				(state.next_id, state.generation)
			};

			let connection = match self.factory.create(&self.address, id) {
				Ok(connection) => connection,
				Err(e) => {
					self.state.lock()?.total -= 1;
					self.available.notify_one();
					return Err(e);
				}
			};

			let mut state = self.state.lock()?;
			if state.closed {
				drop(state);
				self.abandon(connection);
				return Ok(());
			}

			state.idle.push(IdleConnection { connection, generation, last_used: Instant::now() });
			drop(state);
			self.available.notify_one();
		}
	}

	/// Closes a connection that was opened while the pool was being closed and frees its slot.
	fn abandon(&self, mut connection: InternalConnection) {
		if let Ok(mut state) = self.state.lock() {
			state.total -= 1;
		}

		connection.close();
		tracing::debug!(address = %self.address, connection_id = connection.id(),
			"closing connection opened after the pool was closed");
		self.available.notify_all();
	}

	/// Blocks until the next maintenance run is due, returns false once the pool is closed.
	fn wait_for_maintenance(&self) -> bool {
		let state = match self.state.lock() {
			Ok(state) => state,
			Err(_) => return false
		};

		match self.maintenance.wait_timeout_while(
			state,
			self.settings.maintenance_frequency,
			|state| !state.closed && !state.maintenance_requested
		) {
			Ok((state, _)) => !state.closed,
			Err(_) => false
		}
	}
}

fn run_maintenance(pool: Weak<PoolInner>) {
	while let Some(inner) = pool.upgrade() {
		if let Err(e) = inner.maintain() {
			tracing::warn!(address = %inner.address, "connection pool maintenance failed: {}", e);
		}

		if !inner.wait_for_maintenance() {
			break;
		}
	}
}

/// A checked out connection, returned to its pool on drop.
#[derive(Debug)]
pub struct PooledConnection {
	connection: Option<InternalConnection>,
	generation: usize,
	pool:       ConnectionPool
}

impl PooledConnection {
	pub fn generation(&self) -> usize {
		self.generation
	}

	/// Closes the connection, so that it is discarded instead of returned to the pool.
	pub fn discard(mut self) {
		if let Some(connection) = self.connection.as_mut() {
			connection.close();
		}
	}
}

#[cfg(feature = "async")]
impl PooledConnection {
	pub fn send_message_async<F>(mut self, frame: Vec<u8>, callback: F) where
		F: FnOnce(Self, Result<()>) + Send + 'static {
		let (pool, generation) = (self.pool.clone(), self.generation);
		match self.connection.take() {
			Some(connection) => connection.send_message_async(frame, move |connection, result|
				callback(Self { connection: Some(connection), generation, pool }, result)),
			None => {
				let err = Error::ConnectionClosed(pool.address.clone());
				callback(self, Err(err))
			}
		}
	}

	pub fn receive_message_async<F>(mut self, response_to: i32, callback: F) where
		F: FnOnce(Self, Result<crate::wire::ResponseBuffers>) + Send + 'static {
		let (pool, generation) = (self.pool.clone(), self.generation);
		match self.connection.take() {
			Some(connection) => connection.receive_message_async(response_to, move |connection, result|
				callback(Self { connection: Some(connection), generation, pool }, result)),
			None => {
				let err = Error::ConnectionClosed(pool.address.clone());
				callback(self, Err(err))
			}
		}
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			self.pool.release(connection, self.generation);
		}
	}
}

impl Deref for PooledConnection {
	type Target = InternalConnection;

	fn deref(&self) -> &Self::Target {
		// only empty while handed to an async task, which owns `self` meanwhile
		self.connection.as_ref().expect("connection is checked out")
	}
}

impl DerefMut for PooledConnection {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.connection.as_mut().expect("connection is checked out")
	}
}
