//! Bounded replay window
//!
//! Remembers the most recent accepted nonces per source chain. Memory stays
//! bounded by evicting the oldest nonce once a source exceeds the capacity; a
//! replay of an evicted nonce is caught downstream by the issuance ledger,
//! which never applies the same (user, milestone, chain) twice.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;

use crate::ChainId;

#[derive(Debug, Default)]
struct SourceWindow {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

#[derive(Debug)]
pub struct ReplayWindow {
    capacity: usize,
    windows: DashMap<ChainId, SourceWindow>,
}

impl ReplayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `(source, nonce)`. Returns `false` if it was already in the window.
    ///
    /// Check and insert happen under the per-source entry lock, so two
    /// concurrent deliveries of the same message cannot both observe it as new.
    pub fn observe(&self, source_chain: &ChainId, nonce: u64) -> bool {
        let mut window = self.windows.entry(source_chain.clone()).or_default();
        if !window.seen.insert(nonce) {
            return false;
        }
        window.order.push_back(nonce);
        while window.order.len() > self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, source_chain: &ChainId, nonce: u64) -> bool {
        self.windows
            .get(source_chain)
            .map(|window| window.seen.contains(&nonce))
            .unwrap_or(false)
    }

    /// Number of nonces remembered for a source
    pub fn len(&self, source_chain: &ChainId) -> usize {
        self.windows
            .get(source_chain)
            .map(|window| window.order.len())
            .unwrap_or(0)
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(crate::DEFAULT_REPLAY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_detected() {
        let window = ReplayWindow::new(8);
        let source = ChainId::new("ethereum");

        assert!(window.observe(&source, 1));
        assert!(!window.observe(&source, 1));
        assert!(window.contains(&source, 1));

        // Same nonce from another source is independent
        assert!(window.observe(&ChainId::new("arbitrum"), 1));
    }

    #[test]
    fn test_out_of_order_accepted() {
        let window = ReplayWindow::new(8);
        let source = ChainId::new("ethereum");
        for nonce in [5, 2, 9, 3] {
            assert!(window.observe(&source, nonce));
        }
        assert!(!window.observe(&source, 2));
    }

    #[test]
    fn test_eviction_bounds_memory() {
        let window = ReplayWindow::new(3);
        let source = ChainId::new("ethereum");
        for nonce in 1..=5 {
            assert!(window.observe(&source, nonce));
        }

        assert_eq!(window.len(&source), 3);
        assert!(!window.contains(&source, 1));
        assert!(!window.contains(&source, 2));
        assert!(window.contains(&source, 5));
    }

    #[test]
    fn test_concurrent_observe_admits_once() {
        let window = Arc::new(ReplayWindow::new(64));
        let source = ChainId::new("ethereum");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let window = Arc::clone(&window);
                let source = source.clone();
                std::thread::spawn(move || window.observe(&source, 77))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(admitted, 1);
    }
}
