//! Append-only trie of call stacks.
//!
//! Every node is a `(frame_id, parent)` pair; stacks sharing a prefix share
//! the corresponding nodes, so a stack is identified by its leaf index
//! alone. Index 0 is a reserved sentinel root. Node indices are never
//! reused and the structure only grows, which lets readers hold leaf
//! indices across further insertions.

/// Index of a node inside a [`FrameTree`].
pub type NodeIndex = u32;

/// Dense frame identifier assigned by a registry.
pub type FrameId = u32;

#[derive(Debug, Clone)]
struct Node {
    frame_id: FrameId,
    parent: NodeIndex,
    /// Child edges sorted by frame id for binary search.
    children: Vec<(FrameId, NodeIndex)>,
}

/// Trie of call stacks rooted at the sentinel node 0.
#[derive(Debug, Clone)]
pub struct FrameTree {
    nodes: Vec<Node>,
}

impl Default for FrameTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                frame_id: 0,
                parent: 0,
                children: Vec::new(),
            }],
        }
    }

    /// Find or insert the child of `parent_index` carrying `frame_id`.
    ///
    /// When the edge is missing, `on_new` is called with the would-be
    /// `(frame_id, parent_index)` before the node is published; the writer
    /// uses this to emit an index record first. If `on_new` returns false
    /// the node is not inserted and the sentinel index 0 is returned.
    ///
    /// Callers must hold exclusive access; the tree is not internally
    /// synchronized.
    pub fn get_or_create_child<F>(
        &mut self,
        parent_index: NodeIndex,
        frame_id: FrameId,
        on_new: F,
    ) -> NodeIndex
    where
        F: FnOnce(FrameId, NodeIndex) -> bool,
    {
        let slot = {
            let parent = &self.nodes[parent_index as usize];
            match parent
                .children
                .binary_search_by_key(&frame_id, |(id, _)| *id)
            {
                Ok(found) => return parent.children[found].1,
                Err(slot) => slot,
            }
        };

        if !on_new(frame_id, parent_index) {
            return 0;
        }

        let index = self.nodes.len() as NodeIndex;
        self.nodes.push(Node {
            frame_id,
            parent: parent_index,
            children: Vec::new(),
        });
        self.nodes[parent_index as usize]
            .children
            .insert(slot, (frame_id, index));
        index
    }

    /// Frame id and parent of `index`. Constant time; valid for any index
    /// previously returned by [`get_or_create_child`].
    ///
    /// [`get_or_create_child`]: FrameTree::get_or_create_child
    pub fn walk_to(&self, index: NodeIndex) -> (FrameId, NodeIndex) {
        let node = &self.nodes[index as usize];
        (node.frame_id, node.parent)
    }

    /// Collect the frame ids on the path from `leaf` up to the root,
    /// innermost first, visiting at most `max_frames` nodes.
    pub fn path_to_root(&self, leaf: NodeIndex, max_frames: usize) -> Vec<FrameId> {
        let mut out = Vec::new();
        let mut index = leaf;
        while index != 0 && out.len() < max_frames {
            let (frame_id, parent) = self.walk_to(index);
            out.push(frame_id);
            index = parent;
        }
        out
    }

    /// Number of nodes, sentinel included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(_: FrameId, _: NodeIndex) -> bool {
        true
    }

    #[test]
    fn same_stack_yields_same_leaf() {
        let mut tree = FrameTree::new();
        let a1 = tree.get_or_create_child(0, 10, accept);
        let b1 = tree.get_or_create_child(a1, 20, accept);
        let a2 = tree.get_or_create_child(0, 10, accept);
        let b2 = tree.get_or_create_child(a2, 20, accept);
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn shared_prefixes_share_nodes() {
        let mut tree = FrameTree::new();
        let a = tree.get_or_create_child(0, 1, accept);
        let b = tree.get_or_create_child(a, 2, accept);
        let c1 = tree.get_or_create_child(b, 3, accept);
        let c2 = tree.get_or_create_child(b, 4, accept);
        assert_ne!(c1, c2);
        assert_eq!(tree.walk_to(c1).1, b);
        assert_eq!(tree.walk_to(c2).1, b);
        // Only the two leaves beyond the shared prefix were added.
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn on_new_veto_returns_sentinel() {
        let mut tree = FrameTree::new();
        let index = tree.get_or_create_child(0, 99, |_, _| false);
        assert_eq!(index, 0);
        assert_eq!(tree.len(), 1);
        // A later accepting call inserts normally.
        let index = tree.get_or_create_child(0, 99, accept);
        assert_ne!(index, 0);
    }

    #[test]
    fn on_new_sees_edge_before_publication() {
        let mut tree = FrameTree::new();
        let mut seen = None;
        tree.get_or_create_child(0, 42, |frame_id, parent| {
            seen = Some((frame_id, parent));
            true
        });
        assert_eq!(seen, Some((42, 0)));
    }

    #[test]
    fn path_to_root_is_innermost_first() {
        let mut tree = FrameTree::new();
        let a = tree.get_or_create_child(0, 1, accept);
        let b = tree.get_or_create_child(a, 2, accept);
        let c = tree.get_or_create_child(b, 3, accept);
        assert_eq!(tree.path_to_root(c, 16), vec![3, 2, 1]);
        assert_eq!(tree.path_to_root(c, 2), vec![3, 2]);
        assert!(tree.path_to_root(0, 16).is_empty());
    }

    #[test]
    fn children_stay_sorted() {
        let mut tree = FrameTree::new();
        for id in [5u32, 1, 9, 3, 7] {
            tree.get_or_create_child(0, id, accept);
        }
        // Lookups after out-of-order insertion still succeed.
        for id in [1u32, 3, 5, 7, 9] {
            let index = tree.get_or_create_child(0, id, |_, _| {
                panic!("edge {id} should already exist")
            });
            assert_ne!(index, 0);
        }
    }
}
