//! Per-server record of endpoint failures.
//!
//! One cache is shared by every operation a client runs (and may be shared between clients by
//! handing them the same `Arc`). It remembers, for each logical server name, the addresses the
//! name last resolved to and how often and how recently each of them failed. Records never
//! expire; they are only dropped when a rank finds the address missing from the resolved set,
//! which keeps the cache bounded by the candidate count per name.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

/// Failure history of one endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Number of recorded failures.
    pub count: u32,
    /// Monotonic time of the most recent failure, used for ordering.
    pub last_failure: Instant,
    /// Wall-clock time of the most recent failure, for reporting.
    pub last_failure_at: DateTime<Utc>,
}

/// Point-in-time copy of one failure record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSnapshot {
    /// Logical server name.
    pub server: String,
    /// Failed address.
    pub address: IpAddr,
    /// Number of recorded failures.
    pub count: u32,
    /// Wall-clock time of the most recent failure.
    pub last_failure_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ServerRecord {
    candidates: Vec<IpAddr>,
    failures: HashMap<IpAddr, FailureRecord>,
}

impl ServerRecord {
    fn sort_key(&self, address: &IpAddr) -> (u32, Option<Instant>) {
        self.failures
            .get(address)
            .map_or((0, None), |record| (record.count, Some(record.last_failure)))
    }
}

/// Concurrency-safe failure cache keyed by logical server name.
#[derive(Debug, Default)]
pub struct FailureCache {
    servers: Mutex<HashMap<String, ServerRecord>>,
}

impl FailureCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerRecord>> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable.
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `resolved` as the candidate set for `server` and returns it in preference order.
    ///
    /// Addresses without failures come first, in resolution order. Failed addresses follow,
    /// fewest failures first, and among equal counts the one that failed longest ago first.
    /// Failure records for addresses no longer in `resolved` are discarded.
    pub fn rank(&self, server: &str, resolved: &[IpAddr]) -> Vec<IpAddr> {
        let mut servers = self.lock();
        let record = servers.entry(server.to_ascii_lowercase()).or_default();

        record.candidates = resolved.to_vec();
        let before = record.failures.len();
        record
            .failures
            .retain(|address, _| resolved.contains(address));
        if record.failures.len() != before {
            debug!(
                server,
                pruned = before - record.failures.len(),
                "dropped failure records for addresses no longer resolved"
            );
        }

        let mut ordered = record.candidates.clone();
        ordered.sort_by_key(|address| record.sort_key(address));
        ordered
    }

    /// Records a failure of `address` while serving `server`.
    ///
    /// The failure is kept even if another call has since replaced the candidate set with one
    /// that lacks `address`; the next [`FailureCache::rank`] drops it if it is still absent.
    pub fn record_failure(&self, server: &str, address: IpAddr) {
        let mut servers = self.lock();
        let record = servers.entry(server.to_ascii_lowercase()).or_default();
        if !record.candidates.contains(&address) {
            debug!(server, %address, "recording failure for address outside the candidate set");
        }

        let now = Instant::now();
        let at = Utc::now();
        record
            .failures
            .entry(address)
            .and_modify(|existing| {
                existing.count = existing.count.saturating_add(1);
                existing.last_failure = now;
                existing.last_failure_at = at;
            })
            .or_insert(FailureRecord {
                count: 1,
                last_failure: now,
                last_failure_at: at,
            });
    }

    /// Returns the failure record for one address, if any.
    #[must_use]
    pub fn failure(&self, server: &str, address: IpAddr) -> Option<FailureRecord> {
        self.lock()
            .get(&server.to_ascii_lowercase())
            .and_then(|record| record.failures.get(&address).copied())
    }

    /// Total failures recorded across all addresses of `server`.
    #[must_use]
    pub fn total_failures(&self, server: &str) -> u32 {
        self.lock()
            .get(&server.to_ascii_lowercase())
            .map_or(0, |record| {
                record.failures.values().map(|failure| failure.count).sum()
            })
    }

    /// Copies every failure record, ordered by server then address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FailureSnapshot> {
        let servers = self.lock();
        let mut snapshot = servers
            .iter()
            .flat_map(|(server, record)| {
                record
                    .failures
                    .iter()
                    .map(move |(address, failure)| FailureSnapshot {
                        server: server.clone(),
                        address: *address,
                        count: failure.count,
                        last_failure_at: failure.last_failure_at,
                    })
            })
            .collect::<Vec<_>>();
        snapshot.sort_by(|a, b| (&a.server, a.address).cmp(&(&b.server, b.address)));
        snapshot
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
