//! Backend bookkeeping: the weighted sampler, per-backend estimators, and the
//! mapping between the two.
//!
//! Weights are only ever moved by `report_rtt` / `report_timeout`; `choose`
//! never touches them. An unsampled backend keeps its last weight
//! indefinitely, and a backend whose weight decays to zero is effectively
//! retired without disturbing the tree indices of its neighbours.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;

use crate::counted_tree::CountedTree;
use crate::estimator::SpeedEstimator;

/// One worker endpoint. `id` is stable and process-global so that an address
/// reused by a different worker does not inherit the old smoothing state;
/// equality is by address only.
#[derive(Debug, Clone, Copy)]
pub struct Backend {
    pub id: u64,
    pub addr: SocketAddrV4,
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Backend {}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Owns the set of backends, their sampling weights, and their estimators.
/// Lives for the process; shared across dispatcher threads behind a mutex.
pub struct ServerTable {
    tree: CountedTree<Backend>,
    /// backend id → tree slot
    slots: HashMap<u64, usize>,
    /// Estimators are created lazily on first lookup and never destroyed.
    estimators: HashMap<u64, SpeedEstimator>,
    rng: StdRng,
}

impl ServerTable {
    pub fn new() -> Self {
        Self {
            tree: CountedTree::new(),
            slots: HashMap::new(),
            estimators: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sampling for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            tree: CountedTree::new(),
            slots: HashMap::new(),
            estimators: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.tree.total_weight()
    }

    /// Append a backend with a starting weight (overwritten by the first
    /// measurement).
    pub fn push(&mut self, backend: Backend, initial_weight: u64) {
        let slot = self.tree.len();
        self.slots.insert(backend.id, slot);
        self.tree.push_back(backend, initial_weight);
    }

    /// Draw a backend with probability proportional to its weight, or `None`
    /// when every weight has decayed to zero (or the table is empty).
    pub fn choose(&mut self) -> Option<Backend> {
        let total = self.tree.total_weight();
        if total == 0 {
            return None;
        }

        let r = self.rng.gen_range(0..total);
        let index = self.tree.sample_at(r)?;
        tracing::debug!(total, r, index, "sampled backend");
        self.tree.get(index).copied()
    }

    /// Fold a measured round trip into the backend's estimator and republish
    /// its weight.
    pub fn report_rtt(&mut self, backend: &Backend, rtt_us: u64) {
        let est = self.estimators.entry(backend.id).or_default();
        est.update_rtt(rtt_us);
        let weight = est.reqs_per_sec();
        self.reweigh(backend.id, weight);
    }

    /// Record a lost reply: decay the backend's weight, leave its RTT state
    /// alone.
    pub fn report_timeout(&mut self, backend: &Backend) {
        let est = self.estimators.entry(backend.id).or_default();
        est.update_timeout();
        let weight = est.reqs_per_sec();
        self.reweigh(backend.id, weight);
    }

    /// Adaptive per-request timeout for this backend.
    pub fn timeout_for(&mut self, backend: &Backend) -> Duration {
        let est = self.estimators.entry(backend.id).or_default();
        Duration::from_micros(est.rto_us())
    }

    /// Estimator view for reporting; `None` until the backend has been
    /// reported on at least once.
    pub fn estimator(&self, backend: &Backend) -> Option<&SpeedEstimator> {
        self.estimators.get(&backend.id)
    }

    fn reweigh(&mut self, backend_id: u64, weight: u64) {
        if let Some(&slot) = self.slots.get(&backend_id) {
            self.tree.set_weight(slot, weight);
        }
    }
}

impl Default for ServerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn backend(id: u64, port: u16) -> Backend {
        Backend {
            id,
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        }
    }

    #[test]
    fn test_empty_table_chooses_none() {
        let mut table = ServerTable::with_seed(7);
        assert!(table.choose().is_none());
        assert_eq!(table.total_weight(), 0);
    }

    #[test]
    fn test_equality_is_by_address() {
        let a = backend(1, 9000);
        let b = backend(2, 9000);
        let c = backend(1, 9001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rtt_report_moves_weight() {
        let mut table = ServerTable::with_seed(7);
        let a = backend(1, 9000);
        let b = backend(2, 9001);
        table.push(a, 1_000);
        table.push(b, 1_000);
        assert_eq!(table.total_weight(), 2_000);

        // 500 µs round trip projects to 2000 reqs/sec.
        table.report_rtt(&a, 500);
        assert_eq!(table.estimator(&a).unwrap().reqs_per_sec(), 2_000);
        assert_eq!(table.total_weight(), 3_000);
    }

    #[test]
    fn test_timeout_decay_to_exhaustion() {
        let mut table = ServerTable::with_seed(7);
        let a = backend(1, 9000);
        table.push(a, 1_000);

        // First timeout decays the 100_000 sentinel, and the published
        // weight replaces the seed weight entirely.
        table.report_timeout(&a);
        assert_eq!(table.total_weight(), 25_000);

        for _ in 0..8 {
            table.report_timeout(&a);
        }
        assert_eq!(table.total_weight(), 0);
        assert!(table.choose().is_none());
    }

    #[test]
    fn test_zero_weight_backend_never_sampled() {
        let mut table = ServerTable::with_seed(7);
        let a = backend(1, 9000);
        let b = backend(2, 9001);
        table.push(a, 1_000);
        table.push(b, 1_000);

        // Decay b to zero; every draw must return a.
        for _ in 0..9 {
            table.report_timeout(&b);
        }
        for _ in 0..100 {
            assert_eq!(table.choose(), Some(a));
        }
    }

    #[test]
    fn test_sampling_tracks_weights() {
        let mut table = ServerTable::with_seed(42);
        let a = backend(1, 9000);
        let b = backend(2, 9001);
        table.push(a, 1_000);
        table.push(b, 3_000);

        let mut hits_a = 0;
        for _ in 0..10_000 {
            if table.choose() == Some(a) {
                hits_a += 1;
            }
        }
        // Expected 2500; a generous band keeps this robust to RNG choice.
        assert!((1_500..3_500).contains(&hits_a), "hits_a = {}", hits_a);
    }

    #[test]
    fn test_timeout_for_defaults_and_adapts() {
        let mut table = ServerTable::with_seed(7);
        let a = backend(1, 9000);
        table.push(a, 1_000);

        assert_eq!(table.timeout_for(&a), Duration::from_millis(200));

        table.report_rtt(&a, 1_000);
        table.report_rtt(&a, 1_200);
        assert_eq!(table.timeout_for(&a), Duration::from_micros(201_025));
    }
}
