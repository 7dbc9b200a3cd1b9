use crate::peer::{Peer, PeerId};
use parking_lot::RwLock;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::sync::Arc;

/// The set of peers driven by the producer.
///
/// Peers may be added and removed at any time. A production round works on the `snapshot`
/// taken when it starts; removing a peer mid-round only stops further calls to it.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<Vec<Arc<Peer>>>,
}

impl PeerRegistry {
    /// Returns `false` if a peer with the same id is already registered.
    pub fn add(&self, peer: Arc<Peer>) -> bool {
        let mut peers = self.peers.write();
        if peers.iter().any(|p| p.id() == peer.id()) {
            return false;
        }
        peer.set_retired(false);
        peers.push(peer);
        true
    }

    /// The removed peer is retired: its calls still in flight no longer record faults.
    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write();
        let index = peers.iter().position(|p| p.id() == id)?;
        let peer = peers.swap_remove(index);
        peer.set_retired(true);
        Some(peer)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.read().iter().any(|p| p.id() == id)
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// A random peer with no recorded faults.
    pub fn random_healthy<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<Peer>> {
        let healthy = self
            .peers
            .read()
            .iter()
            .filter(|p| !p.is_degraded())
            .cloned()
            .collect::<Vec<_>>();
        healthy.choose(rng).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockExecutionEngine;
    use alloy_primitives::U256;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::time::Duration;

    fn peer(name: &str) -> (Arc<Peer>, Arc<MockExecutionEngine>) {
        let engine = Arc::new(MockExecutionEngine::new(U256::ZERO));
        let peer = Peer::new(name, "registry_tests", engine.clone(), Duration::from_secs(1));
        (Arc::new(peer), engine)
    }

    #[test]
    fn add_and_remove_by_identity() {
        let registry = PeerRegistry::default();
        let (a, _) = peer("a");
        let (b, _) = peer("b");

        assert!(registry.add(a.clone()));
        assert!(registry.add(b.clone()));
        assert!(!registry.add(a.clone()));
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(a.id()).unwrap();
        assert_eq!(removed.id(), a.id());
        assert!(!registry.contains(a.id()));
        assert!(registry.contains(b.id()));
        assert!(registry.remove(a.id()).is_none());
    }

    #[test]
    fn removal_retires_and_re_adding_reinstates() {
        let registry = PeerRegistry::default();
        let (a, _) = peer("a");

        registry.add(a.clone());
        assert!(!a.is_retired());

        registry.remove(a.id());
        assert!(a.is_retired());

        assert!(registry.add(a.clone()));
        assert!(!a.is_retired());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_removal() {
        let registry = PeerRegistry::default();
        let (a, _) = peer("a");
        let (b, _) = peer("b");
        registry.add(a.clone());
        registry.add(b.clone());

        let snapshot = registry.snapshot();
        registry.remove(b.id());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn random_healthy_skips_degraded_peers() {
        let registry = PeerRegistry::default();
        let (healthy, _) = peer("healthy");
        let (broken, broken_engine) = peer("broken");
        registry.add(healthy.clone());
        registry.add(broken.clone());

        broken_engine.set_offline(true);
        assert!(broken.block_number().await.is_err());

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..16 {
            assert_eq!(
                registry.random_healthy(&mut rng).unwrap().id(),
                healthy.id()
            );
        }

        registry.remove(healthy.id());
        assert!(registry.random_healthy(&mut rng).is_none());
        assert!(!registry.is_empty());
    }
}
