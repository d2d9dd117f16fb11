//! The ephemeral source-port pool for outbound iterative queries.
//!
//! Source-port randomness is part of the spoofing-resistance entropy budget,
//! so draws come from a cryptographically strong generator (`thread_rng` is
//! a CSPRNG) and each port is single-use: a port stays leased until the
//! query completes, and a reaper reclaims leaked leases after two minutes.
//! This RNG stream is for ports and transaction IDs only; the rate limiter
//! keys its hash separately.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// The ephemeral port range drawn from, 28,232 ports.  With the 16-bit
/// transaction ID this gives log2(65536 * 28232) ≈ 30.78 bits of entropy
/// per in-flight query.
pub const PORT_RANGE: RangeInclusive<u16> = 32768..=60999;

/// How long a leased port may remain unreturned before the reaper takes it
/// back.
pub const LEASE_LIFETIME: Duration = Duration::from_secs(120);

const ACQUIRE_ATTEMPTS: usize = 64;

/// Cloning gives another handle to the same pool.
#[derive(Clone, Default)]
pub struct PortPool {
    leased: Arc<Mutex<HashMap<u16, Instant>>>,
}

impl PortPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a random unused port.  Returns `None` if the pool is so
    /// contended that repeated random draws all collide, which the caller
    /// surfaces as pool exhaustion.
    pub fn acquire(&self) -> Option<PortLease> {
        let mut leased = self.leased.lock();
        for _ in 0..ACQUIRE_ATTEMPTS {
            let port = rand::thread_rng().gen_range(PORT_RANGE);
            if let std::collections::hash_map::Entry::Vacant(entry) = leased.entry(port) {
                entry.insert(Instant::now());
                return Some(PortLease {
                    port,
                    pool: self.clone(),
                });
            }
        }
        None
    }

    /// Reclaim leases older than `LEASE_LIFETIME`.  Returns how many were
    /// reaped.
    pub fn reap(&self) -> usize {
        let mut leased = self.leased.lock();
        let before = leased.len();
        leased.retain(|_, acquired_at| acquired_at.elapsed() < LEASE_LIFETIME);
        before - leased.len()
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }

    fn release(&self, port: u16) {
        self.leased.lock().remove(&port);
    }
}

/// A leased port.  The lease returns to the pool when this is dropped, i.e.
/// when the query completes.
pub struct PortLease {
    port: u16,
    pool: PortPool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}
