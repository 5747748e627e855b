//! Contiguous block allocator over a virtual arena: four fit disciplines,
//! split on allocate, eager coalescing on free.

use std::str::FromStr;
use std::sync::Mutex;

use serde_json::Value;

use weft_protocol::ErrorKind;

pub const DEFAULT_ARENA_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitAlgorithm {
    FirstFit,
    BestFit,
    WorstFit,
    NextFit,
}

impl FromStr for FitAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FIRST_FIT" | "FIRST" => Ok(FitAlgorithm::FirstFit),
            "BEST_FIT" | "BEST" => Ok(FitAlgorithm::BestFit),
            "WORST_FIT" | "WORST" => Ok(FitAlgorithm::WorstFit),
            "NEXT_FIT" | "NEXT" => Ok(FitAlgorithm::NextFit),
            other => Err(format!("unknown fit algorithm: {other}")),
        }
    }
}

impl FitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitAlgorithm::FirstFit => "FIRST_FIT",
            FitAlgorithm::BestFit => "BEST_FIT",
            FitAlgorithm::WorstFit => "WORST_FIT",
            FitAlgorithm::NextFit => "NEXT_FIT",
        }
    }
}

#[derive(Debug, Clone)]
struct Block {
    start: u64,
    size: u64,
    /// Owning pid, or None when free.
    owner: Option<String>,
}

pub struct BlockAllocator {
    total: u64,
    algorithm: FitAlgorithm,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Sorted by start offset; adjacent free blocks never both survive a free.
    blocks: Vec<Block>,
    /// Scan start for NEXT_FIT.
    cursor: usize,
}

impl BlockAllocator {
    pub fn new(total: u64, algorithm: FitAlgorithm) -> Self {
        Self {
            total,
            algorithm,
            inner: Mutex::new(Inner {
                blocks: vec![Block { start: 0, size: total, owner: None }],
                cursor: 0,
            }),
        }
    }

    /// Allocate `size` bytes for `pid`; returns the arena offset.
    /// A pid holds at most one block at a time.
    pub fn allocate(&self, pid: &str, size: u64) -> Result<u64, (ErrorKind, String)> {
        if size == 0 {
            return Err((ErrorKind::BadRequest, "zero-size allocation".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.blocks.iter().any(|b| b.owner.as_deref() == Some(pid)) {
            return Err((ErrorKind::BadRequest, format!("{pid} already holds a block")));
        }

        let index = match self.find(&inner, size) {
            Some(i) => i,
            None => {
                tracing::warn!(pid, size, "allocation failed, out of memory");
                return Err((ErrorKind::OutOfMemory, format!("no free block of {size} bytes")));
            }
        };

        let start = inner.blocks[index].start;
        if inner.blocks[index].size == size {
            inner.blocks[index].owner = Some(pid.to_string());
        } else {
            let remainder = Block {
                start: start + size,
                size: inner.blocks[index].size - size,
                owner: None,
            };
            inner.blocks[index].size = size;
            inner.blocks[index].owner = Some(pid.to_string());
            inner.blocks.insert(index + 1, remainder);
        }
        inner.cursor = (index + 1) % inner.blocks.len();
        tracing::debug!(pid, start, size, "block allocated");
        Ok(start)
    }

    fn find(&self, inner: &Inner, size: u64) -> Option<usize> {
        let free = |b: &Block| b.owner.is_none() && b.size >= size;
        match self.algorithm {
            FitAlgorithm::FirstFit => inner.blocks.iter().position(free),
            FitAlgorithm::BestFit => inner
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| free(b))
                .min_by_key(|(_, b)| b.size)
                .map(|(i, _)| i),
            FitAlgorithm::WorstFit => inner
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| free(b))
                .max_by_key(|(_, b)| b.size)
                .map(|(i, _)| i),
            FitAlgorithm::NextFit => {
                let n = inner.blocks.len();
                (0..n)
                    .map(|offset| (inner.cursor + offset) % n)
                    .find(|&i| free(&inner.blocks[i]))
            }
        }
    }

    /// Free `pid`'s block and merge with any adjacent free neighbours.
    pub fn deallocate(&self, pid: &str) -> Result<(), (ErrorKind, String)> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .blocks
            .iter()
            .position(|b| b.owner.as_deref() == Some(pid))
            .ok_or_else(|| (ErrorKind::UnknownPid, format!("{pid} holds no block")))?;
        inner.blocks[index].owner = None;
        Self::coalesce(&mut inner, index);
        tracing::debug!(pid, "block freed");
        Ok(())
    }

    fn coalesce(inner: &mut Inner, index: usize) {
        let mut index = index;
        // Merge with the previous block first so `index` stays valid.
        if index > 0 && inner.blocks[index - 1].owner.is_none() {
            let merged = inner.blocks.remove(index);
            index -= 1;
            inner.blocks[index].size += merged.size;
        }
        if index + 1 < inner.blocks.len() && inner.blocks[index + 1].owner.is_none() {
            let merged = inner.blocks.remove(index + 1);
            inner.blocks[index].size += merged.size;
        }
        inner.cursor = inner.cursor.min(inner.blocks.len() - 1);
    }

    pub fn fragmentation(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut total_free = 0u64;
        let mut largest_free = 0u64;
        let mut free_blocks = 0u64;
        let mut allocated = 0u64;
        for block in &inner.blocks {
            match block.owner {
                None => {
                    total_free += block.size;
                    largest_free = largest_free.max(block.size);
                    free_blocks += 1;
                }
                Some(_) => allocated += block.size,
            }
        }
        let fragmentation = if total_free > 0 {
            1.0 - largest_free as f64 / total_free as f64
        } else {
            0.0
        };
        serde_json::json!({
            "algorithm": self.algorithm.as_str(),
            "total_memory": self.total,
            "allocated_memory": allocated,
            "free_memory": total_free,
            "largest_free_block": largest_free,
            "free_blocks_count": free_blocks,
            "fragmentation_percentage": fragmentation * 100.0,
        })
    }

    #[cfg(test)]
    fn free_block_layout(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .iter()
            .filter(|b| b.owner.is_none())
            .map(|b| (b.start, b.size))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_splits_and_free_coalesces() {
        let alloc = BlockAllocator::new(1000, FitAlgorithm::FirstFit);
        let a = alloc.allocate("P1", 100).unwrap();
        let b = alloc.allocate("P2", 200).unwrap();
        let c = alloc.allocate("P3", 300).unwrap();
        assert_eq!((a, b, c), (0, 100, 300));

        alloc.deallocate("P2").unwrap();
        // Free hole at 100..300 plus the 400-byte tail.
        assert_eq!(alloc.free_block_layout(), vec![(100, 200), (600, 400)]);

        alloc.deallocate("P1").unwrap();
        alloc.deallocate("P3").unwrap();
        // Everything merges back into a single arena-sized block.
        assert_eq!(alloc.free_block_layout(), vec![(0, 1000)]);
    }

    #[test]
    fn no_two_adjacent_free_blocks_after_any_free() {
        let alloc = BlockAllocator::new(1024, FitAlgorithm::FirstFit);
        for (pid, size) in [("P1", 128), ("P2", 128), ("P3", 128), ("P4", 128)] {
            alloc.allocate(pid, size).unwrap();
        }
        for pid in ["P2", "P4", "P3", "P1"] {
            alloc.deallocate(pid).unwrap();
            let layout = alloc.free_block_layout();
            for pair in layout.windows(2) {
                assert!(
                    pair[0].0 + pair[0].1 < pair[1].0,
                    "adjacent free blocks left unmerged: {layout:?}"
                );
            }
        }
    }

    #[test]
    fn best_fit_prefers_tightest_hole() {
        let alloc = BlockAllocator::new(1000, FitAlgorithm::BestFit);
        alloc.allocate("P1", 100).unwrap();
        alloc.allocate("P2", 300).unwrap();
        alloc.allocate("P3", 100).unwrap();
        alloc.deallocate("P2").unwrap(); // 300-byte hole at 100
        // Tail hole is 500 bytes; best fit takes the 300-byte hole.
        assert_eq!(alloc.allocate("P4", 250).unwrap(), 100);
    }

    #[test]
    fn worst_fit_prefers_largest_hole() {
        let alloc = BlockAllocator::new(1000, FitAlgorithm::WorstFit);
        alloc.allocate("P1", 100).unwrap();
        alloc.allocate("P2", 300).unwrap();
        alloc.allocate("P3", 100).unwrap();
        alloc.deallocate("P2").unwrap();
        // Tail hole (500) is larger than the 300-byte hole.
        assert_eq!(alloc.allocate("P4", 250).unwrap(), 500);
    }

    #[test]
    fn next_fit_resumes_after_last_allocation() {
        let alloc = BlockAllocator::new(300, FitAlgorithm::NextFit);
        alloc.allocate("P1", 100).unwrap();
        alloc.allocate("P2", 100).unwrap();
        alloc.deallocate("P1").unwrap();
        // Cursor sits past P2; the tail hole comes first, then wraps to 0.
        assert_eq!(alloc.allocate("P3", 100).unwrap(), 200);
        assert_eq!(alloc.allocate("P4", 100).unwrap(), 0);
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let alloc = BlockAllocator::new(100, FitAlgorithm::FirstFit);
        alloc.allocate("P1", 100).unwrap();
        assert!(matches!(alloc.allocate("P2", 1), Err((ErrorKind::OutOfMemory, _))));
        alloc.deallocate("P1").unwrap();
        alloc.allocate("P2", 1).unwrap();
    }

    #[test]
    fn one_block_per_pid() {
        let alloc = BlockAllocator::new(100, FitAlgorithm::FirstFit);
        alloc.allocate("P1", 10).unwrap();
        assert!(matches!(alloc.allocate("P1", 10), Err((ErrorKind::BadRequest, _))));
        assert!(matches!(alloc.deallocate("P9"), Err((ErrorKind::UnknownPid, _))));
    }

    #[test]
    fn fragmentation_reports_scattered_free_space() {
        let alloc = BlockAllocator::new(400, FitAlgorithm::FirstFit);
        alloc.allocate("P1", 100).unwrap();
        alloc.allocate("P2", 100).unwrap();
        alloc.allocate("P3", 100).unwrap();
        alloc.deallocate("P1").unwrap();
        alloc.deallocate("P3").unwrap();
        let report = alloc.fragmentation();
        // Free: 100 at offset 0, 200 at offset 200 (tail merged with P3's block).
        assert_eq!(report["free_memory"], 300);
        assert_eq!(report["largest_free_block"], 200);
        let pct = report["fragmentation_percentage"].as_f64().unwrap();
        assert!((pct - 33.333).abs() < 0.01, "got {pct}");
    }
}
