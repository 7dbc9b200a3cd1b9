use crate::Error;
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::HashMap;

/// The `prev_randao` value each produced block was built with, keyed by block number.
///
/// Entries are written once by the producer when a block is finalized and never removed.
#[derive(Default)]
pub struct PrevRandaoHistory {
    values: RwLock<HashMap<u64, B256>>,
}

impl PrevRandaoHistory {
    pub fn insert(&self, block_number: u64, prev_randao: B256) -> Result<(), Error> {
        let mut values = self.values.write();
        if values.contains_key(&block_number) {
            return Err(Error::DuplicatePrevRandao(block_number));
        }
        values.insert(block_number, prev_randao);
        Ok(())
    }

    pub fn get(&self, block_number: u64) -> Option<B256> {
        self.values.read().get(&block_number).copied()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_write_once() {
        let history = PrevRandaoHistory::default();
        assert!(history.is_empty());

        history.insert(6, B256::repeat_byte(6)).unwrap();
        assert!(matches!(
            history.insert(6, B256::repeat_byte(7)),
            Err(Error::DuplicatePrevRandao(6))
        ));

        assert_eq!(history.get(6), Some(B256::repeat_byte(6)));
        assert_eq!(history.get(7), None);
        assert_eq!(history.len(), 1);
    }
}
