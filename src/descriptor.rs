//! Contiguous slot ranges from one fixed shader-visible descriptor table.
//!
//! The table's size is chosen once at startup and never grows; exhaustion is
//! an immediate, loud failure meant to be caught during capacity planning.
//! Ranges are carved out by buddy splitting: an oversized candidate is split
//! at a 3:1 ratio repeatedly until a close-fit child remains, and collapsed
//! back on release once both children of a node are free and past their lock
//! point.
//!
//! Slots freed while shaders may still read them carry a `lock_until` sync
//! value; no slot is reused until the completed counter passes it.
//!
//! # Usage
//!
//! ```
//! use scoria::descriptor::DescriptorTable;
//!
//! let table = DescriptorTable::new(1024);
//! let range = table.alloc(16, 0).unwrap();
//! assert!(range.count >= 16);
//!
//! // The range was read by work fenced at sync value 3; slots return once
//! // the queue completes past it.
//! table.release(range, 3, 0);
//! ```

use parking_lot::Mutex;

use crate::error::{Error, Result};

const INVALID: u32 = u32::MAX;

/// A contiguous span of descriptor slots.
///
/// `count` may exceed what was asked for: it is the smallest buddy-split
/// block that fits the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorRange {
    pub first: u32,
    pub count: u32,
    node: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeKind {
    Free { lock_until: u64 },
    Allocated,
    Split,
}

/// Binary-tree node over a span of slots. A parent's span is exactly the
/// union of its children's spans.
struct Node {
    first: u32,
    count: u32,
    parent: u32,
    children: [u32; 2],
    kind: NodeKind,
}

struct TableState {
    nodes: Vec<Node>,
    /// Ids of nodes currently `Free`.
    free: Vec<u32>,
    /// Dead node ids available for reuse.
    node_pool: Vec<u32>,
}

/// Buddy allocator over one fixed-size shader-visible binding table.
///
/// Thread-safe; the mutex is held only for the duration of one alloc/release
/// call, and release never blocks.
pub struct DescriptorTable {
    capacity: u32,
    state: Mutex<TableState>,
}

impl DescriptorTable {
    /// Creates a table with `capacity` slots, all initially free.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            state: Mutex::new(TableState {
                nodes: vec![Node {
                    first: 0,
                    count: capacity,
                    parent: INVALID,
                    children: [INVALID; 2],
                    kind: NodeKind::Free { lock_until: 0 },
                }],
                free: vec![0],
                node_pool: Vec::new(),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots currently sitting on free nodes, whether or not their lock has
    /// elapsed.
    pub fn free_slots(&self) -> u32 {
        let state = self.state.lock();
        state
            .free
            .iter()
            .map(|&id| state.nodes[id as usize].count)
            .sum()
    }

    /// Allocates a span of at least `count` slots, considering only free
    /// nodes not locked past `completed`.
    pub fn alloc(&self, count: u32, completed: u64) -> Result<DescriptorRange> {
        assert!(count > 0);
        let mut state = self.state.lock();

        // Smallest usable candidate wins.
        let candidate = state
            .free
            .iter()
            .enumerate()
            .filter(|(_, &id)| {
                let node = &state.nodes[id as usize];
                node.count >= count
                    && matches!(node.kind, NodeKind::Free { lock_until } if lock_until <= completed)
            })
            .min_by_key(|(_, &id)| state.nodes[id as usize].count)
            .map(|(pos, _)| pos);
        let Some(pos) = candidate else {
            tracing::error!(
                requested = count,
                table_size = self.capacity,
                "descriptor table exhausted"
            );
            return Err(Error::DescriptorTableExhausted {
                requested: count,
                table_size: self.capacity,
            });
        };
        let mut id = state.free.swap_remove(pos);

        // Split at 3:1 until the next split could no longer hold the request.
        loop {
            let node = &state.nodes[id as usize];
            let small = node.count.div_ceil(4);
            let large = node.count - small;
            if large == 0 || count > large {
                break;
            }
            let (first, total) = (node.first, node.count);
            let keep_small = count <= small;

            let large_id = Self::new_node(&mut state, first, large, id);
            let small_id = Self::new_node(&mut state, first + large, small, id);
            let node = &mut state.nodes[id as usize];
            node.kind = NodeKind::Split;
            node.children = [large_id, small_id];
            debug_assert_eq!(total, large + small);

            let (keep, give) = if keep_small {
                (small_id, large_id)
            } else {
                (large_id, small_id)
            };
            state.free.push(give);
            id = keep;
        }

        let node = &mut state.nodes[id as usize];
        node.kind = NodeKind::Allocated;
        Ok(DescriptorRange {
            first: node.first,
            count: node.count,
            node: id,
        })
    }

    /// Returns a span, locked until the completed counter passes
    /// `lock_until`, then collapses any fully free, fully elapsed parents.
    ///
    /// Never blocks.
    pub fn release(&self, range: DescriptorRange, lock_until: u64, completed: u64) {
        let mut state = self.state.lock();
        let node = &mut state.nodes[range.node as usize];
        assert_eq!(
            (node.first, node.count, node.kind),
            (range.first, range.count, NodeKind::Allocated),
            "released range does not match a live allocation"
        );
        node.kind = NodeKind::Free { lock_until };
        let mut id = range.node;
        state.free.push(id);

        // Collapse upward while both children are free and past their lock.
        loop {
            let parent = state.nodes[id as usize].parent;
            if parent == INVALID {
                break;
            }
            let [a, b] = state.nodes[parent as usize].children;
            let elapsed = |state: &TableState, id: u32| match state.nodes[id as usize].kind {
                NodeKind::Free { lock_until } => lock_until <= completed,
                _ => false,
            };
            if !elapsed(&state, a) || !elapsed(&state, b) {
                break;
            }
            for child in [a, b] {
                let pos = state
                    .free
                    .iter()
                    .position(|&f| f == child)
                    .expect("free child missing from the free list");
                let _ = state.free.swap_remove(pos);
                state.node_pool.push(child);
            }
            let parent_node = &mut state.nodes[parent as usize];
            parent_node.children = [INVALID; 2];
            parent_node.kind = NodeKind::Free { lock_until: 0 };
            state.free.push(parent);
            id = parent;
        }
    }

    fn new_node(state: &mut TableState, first: u32, count: u32, parent: u32) -> u32 {
        let node = Node {
            first,
            count,
            parent,
            children: [INVALID; 2],
            kind: NodeKind::Free { lock_until: 0 },
        };
        if let Some(id) = state.node_pool.pop() {
            state.nodes[id as usize] = node;
            id
        } else {
            state.nodes.push(node);
            (state.nodes.len() - 1) as u32
        }
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        let state = self.state.lock();
        state.nodes.len() - state.node_pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_the_smallest_fitting_split() {
        let table = DescriptorTable::new(64);
        // 64 -> keep 16 -> keep 4 -> keep 3: exact fit for the request.
        let range = table.alloc(3, 0).unwrap();
        assert_eq!(range.count, 3);
        assert_eq!(table.free_slots(), 64 - 3);
    }

    #[test]
    fn spans_never_overlap() {
        let table = DescriptorTable::new(64);
        let mut spans: Vec<DescriptorRange> = Vec::new();
        for count in [3, 7, 1, 16, 5] {
            let range = table.alloc(count, 0).unwrap();
            assert!(range.count >= count);
            for other in &spans {
                let disjoint = range.first + range.count <= other.first
                    || other.first + other.count <= range.first;
                assert!(disjoint, "{range:?} overlaps {other:?}");
            }
            spans.push(range);
        }
    }

    /// Three two-slot allocations from an eight-slot table, then releasing
    /// and re-allocating the first: the freed leaf is returned as-is, without
    /// growing the tree.
    #[test]
    fn freed_leaf_is_reused_without_tree_growth() {
        let table = DescriptorTable::new(8);
        let first = table.alloc(2, 0).unwrap();
        let _second = table.alloc(2, 0).unwrap();
        let _third = table.alloc(2, 0).unwrap();

        table.release(first, 1, 0);
        let nodes_before = table.node_count();

        let again = table.alloc(2, 1).unwrap();
        assert_eq!((again.first, again.count), (first.first, first.count));
        assert_eq!(table.node_count(), nodes_before);
    }

    #[test]
    fn locked_slots_stay_unusable_until_completed_passes() {
        let table = DescriptorTable::new(8);
        let a = table.alloc(8, 0).unwrap();
        table.release(a, 5, 0);

        // Completed counter has not passed the lock; the table is full of
        // unusable slots.
        assert!(matches!(
            table.alloc(1, 4),
            Err(Error::DescriptorTableExhausted {
                requested: 1,
                table_size: 8,
            })
        ));

        // Identical span becomes allocatable once the lock elapses.
        let b = table.alloc(8, 5).unwrap();
        assert_eq!((b.first, b.count), (a.first, a.count));
    }

    #[test]
    fn release_collapses_back_to_a_single_root() {
        let table = DescriptorTable::new(32);
        let a = table.alloc(2, 0).unwrap();
        let b = table.alloc(9, 0).unwrap();
        let c = table.alloc(1, 0).unwrap();
        for range in [a, b, c] {
            table.release(range, 0, 0);
        }
        assert_eq!(table.node_count(), 1);
        assert_eq!(table.free_slots(), 32);
        // And the whole table is again allocatable in one piece.
        let all = table.alloc(32, 0).unwrap();
        assert_eq!((all.first, all.count), (0, 32));
    }

    #[test]
    fn exhaustion_is_loud() {
        let table = DescriptorTable::new(16);
        let _held = table.alloc(16, 0).unwrap();
        assert!(matches!(
            table.alloc(1, 0),
            Err(Error::DescriptorTableExhausted { .. })
        ));
    }
}
