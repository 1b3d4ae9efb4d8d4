//! Ketama consistent-hash routing.
//!
//! Each server contributes 100 virtual points to a continuum sorted by
//! hash. A key maps to the first point whose hash is >= the key's hash,
//! wrapping around. Continuum points always hash with MD5 (libmemcached's
//! ketama behavior) regardless of the configured key hash.
//!
//! The continuum stores indices into the pool's connection arena rather
//! than references, so lookups borrow the arena only transiently.

use crate::config::DEFAULT_PORT;
use crate::connection::Connection;
use crate::hash::{hash_md5, HashFunction};
use tracing::warn;

const POINTS_PER_SERVER: usize = 100;
const POINTS_PER_HASH: usize = 1;

#[derive(Debug, Clone, Copy)]
struct ContinuumItem {
    hash_value: u32,
    conn_idx: usize,
}

#[derive(Debug, Default)]
pub struct KetamaSelector {
    continuum: Vec<ContinuumItem>,
    n_servers: usize,
    failover: bool,
    hash_function: HashFunction,
}

impl KetamaSelector {
    pub fn new(hash_function: HashFunction, failover: bool) -> Self {
        Self {
            continuum: Vec::new(),
            n_servers: 0,
            failover,
            hash_function,
        }
    }

    pub fn set_hash_function(&mut self, hash_function: HashFunction) {
        self.hash_function = hash_function;
    }

    pub fn enable_failover(&mut self) {
        self.failover = true;
    }

    pub fn disable_failover(&mut self) {
        self.failover = false;
    }

    pub fn reset(&mut self) {
        self.continuum.clear();
        self.n_servers = 0;
    }

    /// Build the continuum over the connection arena.
    pub fn add_servers(&mut self, conns: &[Connection]) {
        for (idx, conn) in conns.iter().enumerate() {
            for pointer_idx in 0..POINTS_PER_SERVER / POINTS_PER_HASH {
                let sort_host = if conn.has_alias() {
                    format!("{}-{}", conn.name(), pointer_idx)
                } else if conn.port() != DEFAULT_PORT {
                    format!("{}:{}-{}", conn.host(), conn.port(), pointer_idx)
                } else {
                    format!("{}-{}", conn.host(), pointer_idx)
                };
                self.continuum.push(ContinuumItem {
                    hash_value: hash_md5(sort_host.as_bytes()),
                    conn_idx: idx,
                });
            }
        }
        self.n_servers = conns.len();
        // stable: equal hashes keep insertion order
        self.continuum.sort_by_key(|item| item.hash_value);
    }

    pub fn point_count(&self) -> usize {
        self.continuum.len()
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.continuum
            .windows(2)
            .all(|w| w[0].hash_value <= w[1].hash_value)
    }

    /// Map a key to a connection index.
    ///
    /// With `check_alive`, a dead selection triggers either a failover walk
    /// (skipping every point of the origin server, reconnecting candidates)
    /// or a direct reconnect attempt, depending on configuration.
    pub fn select(&self, key: &[u8], check_alive: bool, conns: &mut [Connection]) -> Option<usize> {
        let mut pos = match self.n_servers {
            0 => return None,
            1 => 0,
            _ => {
                let target = self.hash_function.hash(key);
                self.continuum
                    .partition_point(|item| item.hash_value < target)
            }
        };
        if pos == self.continuum.len() {
            pos = 0;
        }
        let origin = self.continuum[pos].conn_idx;

        if !check_alive || conns[origin].alive() {
            return Some(origin);
        }

        if self.failover {
            let mut cursor = pos;
            for _ in 0..self.continuum.len() {
                cursor += 1;
                if cursor == self.continuum.len() {
                    cursor = 0;
                }
                let candidate = self.continuum[cursor].conn_idx;
                if candidate != origin && conns[candidate].try_reconnect(true) {
                    return Some(candidate);
                }
            }
            warn!(
                key = %String::from_utf8_lossy(key),
                "no server available for key"
            );
            None
        } else if conns[origin].try_reconnect(true) {
            Some(origin)
        } else {
            None
        }
    }
}
