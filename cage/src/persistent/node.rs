use std::ptr::{self, NonNull};

use crate::{fatal::fatal_oom, visitor::RootVisitor};

pub const NODES_PER_BLOCK: usize = 256;

/// Reports the root held by `owner`.
///
/// # Safety
/// `owner` must point to the live owner registered with the node.
pub type TraceRootCallback = unsafe fn(owner: NonNull<()>, visitor: &mut dyn RootVisitor);

/// Owner kind that a region can force-clear during teardown.
pub trait PersistentOwner {
    /// Drops the owner's reference and its node link without touching the
    /// region. The region recycles the node afterwards.
    ///
    /// # Safety
    /// `owner` must point to a live `Self`.
    unsafe fn clear_from_gc(owner: NonNull<()>);
}

#[derive(Clone, Copy)]
pub(crate) enum NodeState {
    Used {
        owner: NonNull<()>,
        trace: TraceRootCallback,
    },
    Free {
        next: Option<NonNull<PersistentNode>>,
    },
}

pub struct PersistentNode {
    state: NodeState,
    generation: u32,
}

impl PersistentNode {
    const fn free() -> Self {
        Self {
            state: NodeState::Free { next: None },
            generation: 0,
        }
    }

    #[inline(always)]
    fn is_used(&self) -> bool {
        matches!(self.state, NodeState::Used { .. })
    }
}

/// Reference to an allocated node. The generation catches frees through a
/// reference that outlived its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    node: NonNull<PersistentNode>,
    generation: u32,
}

impl NodeRef {
    #[inline(always)]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Block-allocated node slots threaded by a free list.
///
/// Blocks are raw boxed slices so node addresses stay stable while the block
/// list itself grows or is compacted.
pub(crate) struct NodeSlots {
    blocks: Vec<NonNull<PersistentNode>>,
    free_list_head: Option<NonNull<PersistentNode>>,
    nodes_in_use: usize,
}

impl NodeSlots {
    pub(crate) const fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free_list_head: None,
            nodes_in_use: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn has_free_node(&self) -> bool {
        self.free_list_head.is_some()
    }

    #[inline(always)]
    pub(crate) fn nodes_in_use(&self) -> usize {
        self.nodes_in_use
    }

    #[inline(always)]
    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn alloc_block() -> NonNull<PersistentNode> {
        let mut nodes: Vec<PersistentNode> = Vec::new();
        if nodes.try_reserve_exact(NODES_PER_BLOCK).is_err() {
            fatal_oom("persistent node slots");
        }
        nodes.extend((0..NODES_PER_BLOCK).map(|_| PersistentNode::free()));
        let raw = Box::into_raw(nodes.into_boxed_slice()).cast::<PersistentNode>();
        // SAFETY: Box::into_raw never returns null
        unsafe { NonNull::new_unchecked(raw) }
    }

    /// # Safety
    /// `block` must come from `alloc_block` and not be used afterwards.
    unsafe fn free_block(block: NonNull<PersistentNode>) {
        let slice = ptr::slice_from_raw_parts_mut(block.as_ptr(), NODES_PER_BLOCK);
        // SAFETY: reconstructs the box leaked in alloc_block
        drop(unsafe { Box::from_raw(slice) });
    }

    /// Adds one block and threads all of its nodes onto the free list.
    /// Returns the new head.
    pub(crate) fn refill_free_list(&mut self) -> NonNull<PersistentNode> {
        if self.blocks.try_reserve(1).is_err() {
            fatal_oom("persistent node block list");
        }
        let block = Self::alloc_block();
        self.blocks.push(block);

        for i in (0..NODES_PER_BLOCK).rev() {
            // SAFETY: i is within the freshly allocated block
            let node = unsafe { block.add(i) };
            // SAFETY: the block is owned by self and nothing else refers to it
            unsafe { (*node.as_ptr()).state = NodeState::Free { next: self.free_list_head } };
            self.free_list_head = Some(node);
        }
        log::trace!(
            "persistent region grew to {} blocks",
            self.blocks.len()
        );
        block
    }

    pub(crate) fn allocate_node(&mut self, owner: NonNull<()>, trace: TraceRootCallback) -> NodeRef {
        let node = match self.free_list_head {
            Some(node) => node,
            None => self.refill_free_list(),
        };
        // SAFETY: free list nodes live in blocks owned by self
        let slot = unsafe { &mut *node.as_ptr() };
        let NodeState::Free { next } = slot.state else {
            crate::fatal::fatal(format_args!("persistent free list links a used node"));
        };
        self.free_list_head = next;
        slot.state = NodeState::Used { owner, trace };
        self.nodes_in_use += 1;
        NodeRef {
            node,
            generation: slot.generation,
        }
    }

    pub(crate) fn free_node(&mut self, node: NodeRef) {
        // SAFETY: node refs point into blocks owned by self; used blocks are
        // never released
        let slot = unsafe { &*node.node.as_ptr() };
        debug_assert_eq!(
            slot.generation, node.generation,
            "persistent node freed through a stale reference"
        );
        debug_assert!(slot.is_used(), "persistent node freed twice");
        self.recycle(node.node);
    }

    fn recycle(&mut self, node: NonNull<PersistentNode>) {
        // SAFETY: node lies in a block owned by self
        let slot = unsafe { &mut *node.as_ptr() };
        slot.state = NodeState::Free {
            next: self.free_list_head,
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list_head = Some(node);
        self.nodes_in_use -= 1;
    }

    /// Reports every used node's root, rebuilds the free list and releases
    /// blocks with no used node.
    pub(crate) fn trace(&mut self, visitor: &mut dyn RootVisitor) {
        let mut head = None;
        let mut released = 0usize;

        self.blocks.retain(|&block| {
            let mut used = 0usize;
            for i in 0..NODES_PER_BLOCK {
                // SAFETY: i is within the block
                if unsafe { (*block.add(i).as_ptr()).is_used() } {
                    used += 1;
                }
            }
            if used == 0 {
                // SAFETY: the block has no used node, and no free list link
                // into it survives this pass
                unsafe { Self::free_block(block) };
                released += 1;
                return false;
            }

            for i in 0..NODES_PER_BLOCK {
                // SAFETY: i is within the block
                let node = unsafe { block.add(i) };
                // SAFETY: owned by self
                let slot = unsafe { &mut *node.as_ptr() };
                match slot.state {
                    // SAFETY: owners outlive their nodes
                    NodeState::Used { owner, trace } => unsafe { trace(owner, visitor) },
                    NodeState::Free { .. } => {
                        slot.state = NodeState::Free { next: head };
                        head = Some(node);
                    }
                }
            }
            true
        });

        self.free_list_head = head;
        if released > 0 {
            log::debug!(
                "released {released} empty persistent node blocks, {} remain",
                self.blocks.len()
            );
        }
        debug_assert_eq!(self.nodes_in_use, self.count_used_nodes());
    }

    /// Notifies every used node's owner and recycles the node.
    pub(crate) fn clear_all_used_nodes<K: PersistentOwner>(&mut self) {
        for b in 0..self.blocks.len() {
            let block = self.blocks[b];
            for i in 0..NODES_PER_BLOCK {
                // SAFETY: i is within the block
                let node = unsafe { block.add(i) };
                // SAFETY: owned by self
                if let NodeState::Used { owner, .. } = unsafe { (*node.as_ptr()).state } {
                    // SAFETY: owners outlive their nodes and are of kind K
                    unsafe { K::clear_from_gc(owner) };
                    self.recycle(node);
                }
            }
        }
        debug_assert_eq!(self.nodes_in_use, 0);
    }

    /// Full traversal; cross-checks `nodes_in_use`.
    pub(crate) fn count_used_nodes(&self) -> usize {
        self.blocks
            .iter()
            .map(|&block| {
                (0..NODES_PER_BLOCK)
                    // SAFETY: i is within the block
                    .filter(|&i| unsafe { (*block.add(i).as_ptr()).is_used() })
                    .count()
            })
            .sum()
    }
}

impl Drop for NodeSlots {
    fn drop(&mut self) {
        for &block in &self.blocks {
            // SAFETY: every block came from alloc_block
            unsafe { Self::free_block(block) };
        }
    }
}
