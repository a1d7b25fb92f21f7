//! AVL tree of virtual nodes keyed by ring position.
//!
//! Nodes live in an arena (`Vec<Slot>`) and link to each other by index, so
//! rotations only rewrite child indices and never move a node. Freed slots are
//! recycled through a free list.
//!
//! Rebalancing follows the four textbook cases (left-left, left-right,
//! right-right, right-left). The child's balance factor picks single versus
//! double rotation: insertion compares it strictly (`> 0` / `< 0`), deletion
//! non-strictly (`>= 0` / `<= 0`). A deletion can leave the heavy child
//! perfectly balanced; that case takes the single rotation.

use std::cmp::Ordering;

use eddy_types::VirtualNode;

use crate::error::TreeViolation;

#[derive(Debug, Clone)]
struct Slot {
    vnode: VirtualNode,
    left: Option<usize>,
    right: Option<usize>,
    height: u32,
}

/// Self-balancing binary search tree of [`VirtualNode`]s ordered by position.
#[derive(Debug, Clone, Default)]
pub struct PositionTree {
    slots: Vec<Slot>,
    free: Vec<usize>,
    root: Option<usize>,
    len: usize,
}

impl PositionTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of virtual nodes in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no virtual nodes.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the tree (0 when empty, 1 for a single node).
    pub fn height(&self) -> u32 {
        self.height_of(self.root)
    }

    /// Insert a virtual node.
    ///
    /// If a node with the same position already exists the tree is left
    /// unchanged and the existing node is returned; ids are never merged or
    /// overwritten.
    pub fn insert(&mut self, vnode: VirtualNode) -> &VirtualNode {
        let (root, slot) = self.insert_at(self.root, vnode);
        self.root = Some(root);
        debug_assert!(self.validate().is_ok(), "{:?}", self.validate());
        &self.slots[slot].vnode
    }

    /// Remove the virtual node at `vnode.position`.
    ///
    /// Nothing is removed when the node stored at that position has a
    /// different `vnode_id` (a position collision owned by someone else).
    pub fn delete(&mut self, vnode: &VirtualNode) -> Option<VirtualNode> {
        match self.get(vnode.position) {
            Some(stored) if stored.vnode_id == vnode.vnode_id => self.remove(vnode.position),
            _ => None,
        }
    }

    /// Remove whatever virtual node sits at `position`.
    pub fn remove(&mut self, position: u32) -> Option<VirtualNode> {
        let mut removed = None;
        self.root = self.delete_at(self.root, position, &mut removed);
        debug_assert!(self.validate().is_ok(), "{:?}", self.validate());
        removed
    }

    /// Look up the virtual node at exactly `position`.
    pub fn get(&self, position: u32) -> Option<&VirtualNode> {
        let mut cur = self.root;
        while let Some(idx) = cur {
            let slot = &self.slots[idx];
            cur = match position.cmp(&slot.vnode.position) {
                Ordering::Less => slot.left,
                Ordering::Greater => slot.right,
                Ordering::Equal => return Some(&slot.vnode),
            };
        }
        None
    }

    /// First virtual node clockwise from `hash`.
    ///
    /// Returns the node with the smallest position `>= hash`, or the node with
    /// the minimum position when `hash` is past the last one. `None` only when
    /// the tree is empty.
    pub fn successor(&self, hash: u32) -> Option<&VirtualNode> {
        let mut cur = self.root;
        let mut candidate = None;
        while let Some(idx) = cur {
            let slot = &self.slots[idx];
            if slot.vnode.position >= hash {
                candidate = Some(idx);
                cur = slot.left;
            } else {
                cur = slot.right;
            }
        }
        candidate
            .or_else(|| self.root.map(|root| self.leftmost(root)))
            .map(|idx| &self.slots[idx].vnode)
    }

    /// First virtual node counter-clockwise from `hash`, exclusive.
    ///
    /// Returns the node with the largest position `< hash`, wrapping to the
    /// maximum position. With a single node, that node is its own predecessor.
    pub fn predecessor(&self, hash: u32) -> Option<&VirtualNode> {
        let mut cur = self.root;
        let mut candidate = None;
        while let Some(idx) = cur {
            let slot = &self.slots[idx];
            if slot.vnode.position < hash {
                candidate = Some(idx);
                cur = slot.right;
            } else {
                cur = slot.left;
            }
        }
        candidate
            .or_else(|| self.root.map(|root| self.rightmost(root)))
            .map(|idx| &self.slots[idx].vnode)
    }

    /// Virtual node with the smallest position.
    pub fn first(&self) -> Option<&VirtualNode> {
        self.root.map(|root| &self.slots[self.leftmost(root)].vnode)
    }

    /// Virtual node with the largest position.
    pub fn last(&self) -> Option<&VirtualNode> {
        self.root.map(|root| &self.slots[self.rightmost(root)].vnode)
    }

    /// Iterate virtual nodes in ascending position order.
    ///
    /// Each call starts a fresh traversal.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::with_capacity(self.height() as usize),
        };
        iter.push_left(self.root);
        iter
    }

    /// Check ordering, cached heights, balance factors and length.
    ///
    /// Returns the number of reachable nodes.
    pub fn validate(&self) -> Result<usize, TreeViolation> {
        let mut previous: Option<u32> = None;
        for vnode in self.iter() {
            if previous.is_some_and(|p| p >= vnode.position) {
                return Err(TreeViolation::OutOfOrder {
                    position: vnode.position,
                });
            }
            previous = Some(vnode.position);
        }

        let reachable = self.validate_at(self.root)?.1;
        if reachable != self.len {
            return Err(TreeViolation::LengthMismatch {
                reachable,
                tracked: self.len,
            });
        }
        Ok(reachable)
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Returns (new subtree root, slot holding the inserted or existing node).
    fn insert_at(&mut self, at: Option<usize>, vnode: VirtualNode) -> (usize, usize) {
        let Some(idx) = at else {
            let idx = self.alloc(vnode);
            return (idx, idx);
        };

        let position = vnode.position;
        let found = match position.cmp(&self.slots[idx].vnode.position) {
            Ordering::Less => {
                let (child, found) = self.insert_at(self.slots[idx].left, vnode);
                self.slots[idx].left = Some(child);
                found
            }
            Ordering::Greater => {
                let (child, found) = self.insert_at(self.slots[idx].right, vnode);
                self.slots[idx].right = Some(child);
                found
            }
            Ordering::Equal => return (idx, idx),
        };

        self.update_height(idx);
        let balance = self.balance(Some(idx));

        if balance > 1 {
            let left = self.slots[idx].left;
            if self.balance(left) > 0 {
                return (self.rotate_right(idx), found);
            }
            let rotated = self.rotate_left(self.child(left));
            self.slots[idx].left = Some(rotated);
            return (self.rotate_right(idx), found);
        }

        if balance < -1 {
            let right = self.slots[idx].right;
            if self.balance(right) < 0 {
                return (self.rotate_left(idx), found);
            }
            let rotated = self.rotate_right(self.child(right));
            self.slots[idx].right = Some(rotated);
            return (self.rotate_left(idx), found);
        }

        (idx, found)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    fn delete_at(
        &mut self,
        at: Option<usize>,
        position: u32,
        removed: &mut Option<VirtualNode>,
    ) -> Option<usize> {
        let idx = at?;

        match position.cmp(&self.slots[idx].vnode.position) {
            Ordering::Less => {
                let child = self.delete_at(self.slots[idx].left, position, removed);
                self.slots[idx].left = child;
            }
            Ordering::Greater => {
                let child = self.delete_at(self.slots[idx].right, position, removed);
                self.slots[idx].right = child;
            }
            Ordering::Equal => match (self.slots[idx].left, self.slots[idx].right) {
                (None, None) => {
                    *removed = Some(self.release(idx));
                    return None;
                }
                (Some(only), None) | (None, Some(only)) => {
                    *removed = Some(self.release(idx));
                    return Some(only);
                }
                (Some(_), Some(right)) => {
                    // Promote the in-order successor, then delete it from the
                    // right subtree.
                    let successor = self.leftmost(right);
                    let promoted = self.slots[successor].vnode.clone();
                    let promoted_position = promoted.position;
                    *removed = Some(std::mem::replace(&mut self.slots[idx].vnode, promoted));

                    let mut discarded = None;
                    let child = self.delete_at(Some(right), promoted_position, &mut discarded);
                    self.slots[idx].right = child;
                }
            },
        }

        self.update_height(idx);
        let balance = self.balance(Some(idx));

        if balance > 1 {
            let left = self.slots[idx].left;
            if self.balance(left) >= 0 {
                return Some(self.rotate_right(idx));
            }
            let rotated = self.rotate_left(self.child(left));
            self.slots[idx].left = Some(rotated);
            return Some(self.rotate_right(idx));
        }

        if balance < -1 {
            let right = self.slots[idx].right;
            if self.balance(right) <= 0 {
                return Some(self.rotate_left(idx));
            }
            let rotated = self.rotate_right(self.child(right));
            self.slots[idx].right = Some(rotated);
            return Some(self.rotate_left(idx));
        }

        Some(idx)
    }

    // ------------------------------------------------------------------
    // Rotations and bookkeeping
    // ------------------------------------------------------------------

    fn rotate_right(&mut self, y: usize) -> usize {
        let x = self.child(self.slots[y].left);
        let moved = self.slots[x].right;

        self.slots[x].right = Some(y);
        self.slots[y].left = moved;

        self.update_height(y);
        self.update_height(x);
        x
    }

    fn rotate_left(&mut self, x: usize) -> usize {
        let y = self.child(self.slots[x].right);
        let moved = self.slots[y].left;

        self.slots[y].left = Some(x);
        self.slots[x].right = moved;

        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Unwrap a child link that the balance factor guarantees is present.
    fn child(&self, link: Option<usize>) -> usize {
        link.expect("heavy side of an unbalanced node has a child")
    }

    fn height_of(&self, at: Option<usize>) -> u32 {
        at.map_or(0, |idx| self.slots[idx].height)
    }

    fn balance(&self, at: Option<usize>) -> i64 {
        at.map_or(0, |idx| {
            let slot = &self.slots[idx];
            i64::from(self.height_of(slot.left)) - i64::from(self.height_of(slot.right))
        })
    }

    fn update_height(&mut self, idx: usize) {
        let slot = &self.slots[idx];
        let height = 1 + self.height_of(slot.left).max(self.height_of(slot.right));
        self.slots[idx].height = height;
    }

    fn leftmost(&self, mut idx: usize) -> usize {
        while let Some(left) = self.slots[idx].left {
            idx = left;
        }
        idx
    }

    fn rightmost(&self, mut idx: usize) -> usize {
        while let Some(right) = self.slots[idx].right {
            idx = right;
        }
        idx
    }

    fn alloc(&mut self, vnode: VirtualNode) -> usize {
        self.len += 1;
        let slot = Slot {
            vnode,
            left: None,
            right: None,
            height: 1,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> VirtualNode {
        self.len -= 1;
        self.free.push(idx);
        let slot = &mut self.slots[idx];
        slot.left = None;
        slot.right = None;
        slot.vnode.clone()
    }

    /// Returns (height, node count) of the subtree rooted at `at`.
    fn validate_at(&self, at: Option<usize>) -> Result<(u32, usize), TreeViolation> {
        let Some(idx) = at else {
            return Ok((0, 0));
        };
        let slot = &self.slots[idx];
        let (left_height, left_count) = self.validate_at(slot.left)?;
        let (right_height, right_count) = self.validate_at(slot.right)?;

        let actual = 1 + left_height.max(right_height);
        if actual != slot.height {
            return Err(TreeViolation::StaleHeight {
                position: slot.vnode.position,
                cached: slot.height,
                actual,
            });
        }

        let balance = i64::from(left_height) - i64::from(right_height);
        if !(-1..=1).contains(&balance) {
            return Err(TreeViolation::Unbalanced {
                position: slot.vnode.position,
                balance,
            });
        }

        Ok((actual, left_count + right_count + 1))
    }
}

/// In-order iterator over a [`PositionTree`].
pub struct Iter<'a> {
    tree: &'a PositionTree,
    stack: Vec<usize>,
}

impl Iter<'_> {
    fn push_left(&mut self, mut at: Option<usize>) {
        while let Some(idx) = at {
            self.stack.push(idx);
            at = self.tree.slots[idx].left;
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a VirtualNode;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        self.push_left(self.tree.slots[idx].right);
        Some(&self.tree.slots[idx].vnode)
    }
}

impl<'a> IntoIterator for &'a PositionTree {
    type Item = &'a VirtualNode;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
