//! Shared chain handle

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use crate::consensus::ChainRecord;
use crate::crypto::Hash;
use super::{Blockchain, ChainUpdate, Subscription};

/// Cloneable handle to one `Blockchain`. Writers take the lock for a whole
/// `add_records` pipeline; readers share it.
#[derive(Clone, Debug)]
pub struct SharedChain {
    inner: Arc<RwLock<Blockchain>>,
}

impl SharedChain {
    pub fn new(chain: Blockchain) -> Self {
        Self {
            inner: Arc::new(RwLock::new(chain)),
        }
    }

    /// Read access
    pub fn chain(&self) -> impl Deref<Target = Blockchain> + '_ {
        self.inner.read()
    }

    /// Write access
    pub fn chain_mut(&self) -> impl DerefMut<Target = Blockchain> + '_ {
        self.inner.write()
    }

    pub fn add_records<I>(&self, records: I) -> ChainUpdate
    where
        I: IntoIterator<Item = ChainRecord>,
    {
        self.inner.write().add_records(records)
    }

    pub fn canonical_tip(&self) -> Hash {
        self.inner.read().canonical_tip()
    }

    pub fn length(&self) -> u64 {
        self.inner.read().length()
    }

    pub fn missing_parents(&self) -> BTreeSet<Hash> {
        self.inner.read().missing_parents()
    }

    pub fn locator_hashes(&self) -> Vec<Hash> {
        self.inner.read().locator_hashes()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.read().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ChainConfig, ChainEvent};

    fn h(n: u64) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        bytes[31] = 0x77;
        Hash(bytes)
    }

    fn record(n: u64) -> ChainRecord {
        let parent = if n == 0 { Hash::zero() } else { h(n - 1) };
        ChainRecord::new(h(n), parent, 1)
    }

    #[tokio::test]
    async fn test_concurrent_writers_converge() {
        let chain = Blockchain::new(Hash::zero(), ChainConfig::default()).unwrap();
        let shared = SharedChain::new(chain);
        let sub = shared.subscribe();

        // Two writers deliver interleaved halves of the same chain
        let mut handles = Vec::new();
        for parity in 0..2u64 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                for n in (0..40).filter(|n| n % 2 == parity) {
                    shared.add_records([record(n)]);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(shared.canonical_tip(), h(39));
        assert_eq!(shared.length(), 40);
        assert!(shared.missing_parents().is_empty());

        // Every block was announced exactly once, in index order
        let adds: Vec<ChainEvent> = sub.drain();
        assert_eq!(adds, (0..40).map(|n| ChainEvent::add(h(n), n)).collect::<Vec<_>>());
    }

    #[test]
    fn test_reader_sees_writes() {
        let chain = Blockchain::new(Hash::zero(), ChainConfig::default()).unwrap();
        let shared = SharedChain::new(chain);
        shared.chain_mut().add_records((0..3).map(record));
        assert_eq!(shared.chain().canonical_path(), vec![h(0), h(1), h(2)]);
        assert_eq!(shared.locator_hashes().first(), Some(&h(2)));
    }
}
