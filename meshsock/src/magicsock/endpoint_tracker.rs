//! Keeps advertising recently discovered direct addresses for a while.
//!
//! A single net report can miss an address, e.g. when a STUN server does not answer in
//! time. Without this cache the address would be withdrawn from our peers and re-added on
//! the next report, starting discovery from scratch each time.

use std::{collections::HashMap, net::SocketAddr};

use n0_future::time::Instant;
use tracing::trace;

use super::direct_addrs::DirectAddr;
use crate::defaults::timeouts::ENDPOINT_TRACKER_LIFETIME;

#[derive(Debug)]
struct Entry {
    addr: DirectAddr,
    until: Instant,
}

/// Cache of discovered direct addresses, each kept for [`ENDPOINT_TRACKER_LIFETIME`] after
/// it was last seen.
#[derive(Debug, Default)]
pub(super) struct EndpointTracker {
    cache: HashMap<SocketAddr, Entry>,
}

impl EndpointTracker {
    /// Returns `fresh` followed by every cached address not in `fresh` that has not
    /// expired yet.
    ///
    /// The addresses in `fresh` have their lifetime extended.
    pub(super) fn update(&mut self, now: Instant, fresh: Vec<DirectAddr>) -> Vec<DirectAddr> {
        let mut addrs = fresh;
        let mut cached: Vec<DirectAddr> = self
            .cache
            .iter()
            .filter(|(addr, entry)| now <= entry.until && !addrs.iter().any(|a| a.addr == **addr))
            .map(|(_, entry)| entry.addr.clone())
            .collect();
        cached.sort();
        if !cached.is_empty() {
            trace!(?cached, "advertising cached direct addresses");
        }

        let until = now + ENDPOINT_TRACKER_LIFETIME;
        for addr in &addrs {
            self.cache
                .entry(addr.addr)
                .and_modify(|entry| entry.until = until)
                .or_insert_with(|| Entry {
                    addr: addr.clone(),
                    until,
                });
        }
        self.cache.retain(|_, entry| now <= entry.until);

        addrs.extend(cached);
        addrs
    }

    /// Forgets all cached addresses.
    pub(super) fn clear(&mut self) {
        self.cache.clear();
    }
}
