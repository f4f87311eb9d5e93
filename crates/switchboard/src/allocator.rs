//! Identifier allocation for remote nodes and buses.

use oscwire::NodeId;
use std::collections::BTreeMap;

/// First-fit block allocator over the fixed range `[start, start + size)`.
///
/// Free space is kept as a sorted list of `(index, length)` runs; freeing
/// a block merges it with adjacent runs.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    start: i32,
    size: u32,
    free: Vec<(i32, u32)>,
    used: BTreeMap<i32, u32>,
}

impl BlockAllocator {
    pub fn new(start: i32, size: u32) -> Self {
        let mut allocator = Self {
            start,
            size,
            free: Vec::new(),
            used: BTreeMap::new(),
        };
        allocator.reset();
        allocator
    }

    /// Reserve `count` contiguous identifiers, returning the first.
    pub fn allocate(&mut self, count: u32) -> Option<i32> {
        if count == 0 {
            return None;
        }
        let slot = self.free.iter().position(|(_, length)| *length >= count)?;
        let (index, length) = self.free[slot];
        if length == count {
            self.free.remove(slot);
        } else {
            self.free[slot] = (index + count as i32, length - count);
        }
        self.used.insert(index, count);
        Some(index)
    }

    /// Return the block starting at `index`. Yields its length, or `None`
    /// when no such block is live.
    pub fn free(&mut self, index: i32) -> Option<u32> {
        let count = self.used.remove(&index)?;
        let slot = self.free.partition_point(|(start, _)| *start < index);
        self.free.insert(slot, (index, count));

        // merge with the following run, then the preceding one
        if slot + 1 < self.free.len() {
            let (next_start, next_length) = self.free[slot + 1];
            if index + self.free[slot].1 as i32 == next_start {
                self.free[slot].1 += next_length;
                self.free.remove(slot + 1);
            }
        }
        if slot > 0 {
            let (previous_start, previous_length) = self.free[slot - 1];
            if previous_start + previous_length as i32 == index {
                self.free[slot - 1].1 += self.free[slot].1;
                self.free.remove(slot);
            }
        }
        Some(count)
    }

    /// Number of live blocks.
    pub fn live(&self) -> usize {
        self.used.len()
    }

    pub fn is_live(&self, index: i32) -> bool {
        self.used.contains_key(&index)
    }

    pub fn reset(&mut self) {
        self.used.clear();
        self.free.clear();
        if self.size > 0 {
            self.free.push((self.start, self.size));
        }
    }
}

/// Bump allocator for node ids. Ids are never handed out twice until reset.
#[derive(Debug, Clone)]
pub struct NodeIdAllocator {
    initial: NodeId,
    next: NodeId,
}

impl Default for NodeIdAllocator {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl NodeIdAllocator {
    pub fn new(initial: NodeId) -> Self {
        Self {
            initial,
            next: initial,
        }
    }

    pub fn allocate(&mut self) -> NodeId {
        self.allocate_block(1)
    }

    /// Reserve `count` consecutive ids, returning the first.
    pub fn allocate_block(&mut self, count: u32) -> NodeId {
        let id = self.next;
        self.next += count.max(1) as NodeId;
        id
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_freed_space() {
        let mut buses = BlockAllocator::new(16, 8);
        assert_eq!(buses.allocate(2), Some(16));
        assert_eq!(buses.allocate(2), Some(18));
        assert_eq!(buses.allocate(2), Some(20));

        assert_eq!(buses.free(18), Some(2));
        assert_eq!(buses.allocate(1), Some(18));
        assert_eq!(buses.allocate(2), Some(22));
        assert_eq!(buses.allocate(1), Some(19));
        assert_eq!(buses.allocate(1), None);
    }

    #[test]
    fn freeing_coalesces_neighbours() {
        let mut buses = BlockAllocator::new(0, 6);
        let a = buses.allocate(2).unwrap();
        let b = buses.allocate(2).unwrap();
        let c = buses.allocate(2).unwrap();
        assert_eq!(buses.allocate(1), None);

        buses.free(a);
        buses.free(c);
        assert_eq!(buses.allocate(4), None);
        buses.free(b);
        assert_eq!(buses.allocate(6), Some(0));
        assert_eq!(buses.live(), 1);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut buses = BlockAllocator::new(0, 4);
        let block = buses.allocate(3).unwrap();
        assert_eq!(buses.free(block), Some(3));
        assert_eq!(buses.free(block), None);
        assert_eq!(buses.allocate(4), Some(0));
    }

    #[test]
    fn zero_sized_requests_fail() {
        let mut buses = BlockAllocator::new(0, 4);
        assert_eq!(buses.allocate(0), None);
        assert_eq!(buses.live(), 0);
    }

    #[test]
    fn node_ids_bump_and_reset() {
        let mut ids = NodeIdAllocator::default();
        assert_eq!(ids.allocate(), 1000);
        assert_eq!(ids.allocate_block(4), 1001);
        assert_eq!(ids.allocate(), 1005);
        ids.reset();
        assert_eq!(ids.allocate(), 1000);
    }
}
