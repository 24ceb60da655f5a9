//! Bitmap data structure helper.

use std::fmt;

use crate::partition::PartitionId;
use crate::utils::GridError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for partition ID -> bool mapping, sized to the cluster's
/// partition count.
#[derive(Clone, PartialEq, Eq)]
pub struct PartitionSet(FixedBitSet);

impl PartitionSet {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u32, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size as usize);
        if ones {
            bitset.set_range(.., true);
        }
        PartitionSet(bitset)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: PartitionId, flag: bool) -> Result<(), GridError> {
        if idx as usize >= self.0.len() {
            return Err(GridError::Misuse(format!(
                "partition {} out of bound",
                idx
            )));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u32 {
        self.0.len() as u32
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count_ones(..) as u32
    }

    /// Whether every slot is true.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.size()
    }

    /// Partition IDs whose slot is false, in ascending order.
    pub fn missing(&self) -> Vec<PartitionId> {
        (0..self.0.len())
            .filter(|&i| !self.0.contains(i))
            .map(|i| i as PartitionId)
            .collect()
    }

    /// Partition IDs whose slot is true, in ascending order.
    pub fn ones(&self) -> Vec<PartitionId> {
        self.0.ones().map(|i| i as PartitionId).collect()
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; {:?}}}", self.size(), self.ones())
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn set_out_of_bound() {
        let mut map = PartitionSet::new(7, false);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(1, false).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.ones(), vec![0, 2]);
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn claims_and_missing() -> Result<(), GridError> {
        let mut covered = PartitionSet::new(4, false);
        for p in [0, 1, 1, 2] {
            covered.set(p, true)?;
        }
        assert_eq!(covered.count(), 3);
        assert!(!covered.is_full());
        assert_eq!(covered.missing(), vec![3]);
        covered.set(3, true)?;
        assert!(covered.is_full());
        assert!(covered.missing().is_empty());
        Ok(())
    }

    #[test]
    fn new_full() {
        let map = PartitionSet::new(5, true);
        assert!(map.is_full());
        assert_eq!(map.ones(), vec![0, 1, 2, 3, 4]);
        assert_eq!(format!("{:?}", map), "{5; [0, 1, 2, 3, 4]}");
    }
}
