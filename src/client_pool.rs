//! FIFO-fair hand-out of clients across threads.
//!
//! The core client is single-threaded by design; this pool owns up to
//! `max_clients` of them and lends one per thread at a time. Waiters are
//! served in arrival order via a ticket queue; released clients are reused
//! LIFO for cache warmth. The pool grows on demand while below its cap.

use crate::client::Client;
use crate::config::{ClientConfig, ServerSpec};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use tracing::debug;

struct PoolState {
    /// Slot storage; `None` while the slot's client is lent out.
    clients: Vec<Option<Client>>,
    /// Idle slot indices, most recently released first.
    idle: VecDeque<usize>,
    /// Next ticket to hand to an arriving waiter.
    queue_tail: u64,
    /// Ticket currently allowed to take a client.
    queue_head: u64,
}

pub struct ClientPool {
    state: Mutex<PoolState>,
    available: Condvar,
    servers: Vec<ServerSpec>,
    config: ClientConfig,
    max_clients: usize,
}

impl ClientPool {
    /// Build a pool of at most `max_clients`, with `initial_clients`
    /// constructed up front.
    pub fn new(
        servers: Vec<ServerSpec>,
        config: ClientConfig,
        initial_clients: usize,
        max_clients: usize,
    ) -> Self {
        let initial = initial_clients.min(max_clients).max(1);
        let mut clients = Vec::with_capacity(initial);
        let mut idle = VecDeque::with_capacity(initial);
        for i in 0..initial {
            clients.push(Some(Client::new(&servers, &config)));
            idle.push_back(i);
        }
        Self {
            state: Mutex::new(PoolState {
                clients,
                idle,
                queue_tail: 0,
                queue_head: 0,
            }),
            available: Condvar::new(),
            servers,
            config,
            max_clients: max_clients.max(1),
        }
    }

    /// Current number of constructed clients.
    pub fn size(&self) -> usize {
        self.state.lock().expect("client pool poisoned").clients.len()
    }

    /// Borrow a client, waiting FIFO behind earlier callers if none is
    /// idle and the pool is at capacity.
    pub fn acquire(&self) -> PooledClient<'_> {
        let mut state = self.state.lock().expect("client pool poisoned");
        let ticket = state.queue_tail;
        state.queue_tail += 1;
        loop {
            if state.queue_head == ticket {
                if let Some(slot) = state.idle.pop_front() {
                    state.queue_head += 1;
                    let client = state.clients[slot].take().expect("idle slot empty");
                    drop(state);
                    self.available.notify_all();
                    return PooledClient {
                        pool: self,
                        slot,
                        client: Some(client),
                    };
                }
                if state.clients.len() < self.max_clients {
                    let slot = state.clients.len();
                    state.clients.push(None);
                    state.queue_head += 1;
                    drop(state);
                    self.available.notify_all();
                    debug!(slot, "growing client pool");
                    // construction happens outside the lock
                    let client = Client::new(&self.servers, &self.config);
                    return PooledClient {
                        pool: self,
                        slot,
                        client: Some(client),
                    };
                }
            }
            state = self
                .available
                .wait(state)
                .expect("client pool poisoned");
        }
    }

    fn release(&self, slot: usize, client: Client) {
        let mut state = self.state.lock().expect("client pool poisoned");
        state.clients[slot] = Some(client);
        state.idle.push_front(slot);
        drop(state);
        self.available.notify_all();
    }
}

/// A borrowed client; returns to the pool on drop.
pub struct PooledClient<'a> {
    pool: &'a ClientPool,
    slot: usize,
    client: Option<Client>,
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("client already released")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("client already released")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(self.slot, client);
        }
    }
}
