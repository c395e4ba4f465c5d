//! Segment trees for O(log n) prioritized sampling and eviction
//!
//! Sum, min and max flavors share the same leaf layout, so the trees owned by
//! one cluster are all addressed by the same slot index and can be updated in
//! lockstep.

use std::fmt;
use std::marker::PhantomData;

/// Reduction used by a [`SegmentTree`] to combine two sibling nodes.
pub trait Reduce {
    /// Payload stored in every node
    type Node: Copy + fmt::Debug;

    /// Node value of an empty slot
    fn neutral() -> Self::Node;

    /// Leaf node holding `value` at data index `index`
    fn leaf(value: f64, index: usize) -> Self::Node;

    fn combine(left: Self::Node, right: Self::Node) -> Self::Node;

    fn is_neutral(node: &Self::Node) -> bool;

    /// Scalar carried by a node (sum, minimum or maximum)
    fn value(node: &Self::Node) -> f64;
}

/// Sum node: the sum of the occupied leaves below it and how many there are.
///
/// The count lets the tree answer prefix queries over shifted values
/// (`value - shift`) without touching the leaves.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SumNode {
    pub sum: f64,
    pub count: usize,
}

/// Min/max node: the extremum below it and the data index that holds it.
///
/// `index` is `None` only for the neutral element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extremum {
    pub value: f64,
    pub index: Option<usize>,
}

#[derive(Debug)]
pub enum Sum {}

#[derive(Debug)]
pub enum Min {}

#[derive(Debug)]
pub enum Max {}

impl Reduce for Sum {
    type Node = SumNode;

    fn neutral() -> SumNode {
        SumNode { sum: 0.0, count: 0 }
    }

    fn leaf(value: f64, _index: usize) -> SumNode {
        SumNode { sum: value, count: 1 }
    }

    fn combine(left: SumNode, right: SumNode) -> SumNode {
        SumNode {
            sum: left.sum + right.sum,
            count: left.count + right.count,
        }
    }

    fn is_neutral(node: &SumNode) -> bool {
        node.count == 0
    }

    fn value(node: &SumNode) -> f64 {
        node.sum
    }
}

impl Reduce for Min {
    type Node = Extremum;

    fn neutral() -> Extremum {
        Extremum {
            value: f64::INFINITY,
            index: None,
        }
    }

    fn leaf(value: f64, index: usize) -> Extremum {
        Extremum {
            value,
            index: Some(index),
        }
    }

    // Ties keep the left child, i.e. the lesser data index.
    fn combine(left: Extremum, right: Extremum) -> Extremum {
        match (left.index, right.index) {
            (_, None) => left,
            (None, _) => right,
            _ if right.value < left.value => right,
            _ => left,
        }
    }

    fn is_neutral(node: &Extremum) -> bool {
        node.index.is_none()
    }

    fn value(node: &Extremum) -> f64 {
        node.value
    }
}

impl Reduce for Max {
    type Node = Extremum;

    fn neutral() -> Extremum {
        Extremum {
            value: f64::NEG_INFINITY,
            index: None,
        }
    }

    fn leaf(value: f64, index: usize) -> Extremum {
        Extremum {
            value,
            index: Some(index),
        }
    }

    fn combine(left: Extremum, right: Extremum) -> Extremum {
        match (left.index, right.index) {
            (_, None) => left,
            (None, _) => right,
            _ if right.value > left.value => right,
            _ => left,
        }
    }

    fn is_neutral(node: &Extremum) -> bool {
        node.index.is_none()
    }

    fn value(node: &Extremum) -> f64 {
        node.value
    }
}

/// Fixed-capacity binary tree where each parent stores the reduction of its
/// children.
///
/// The tree is stored as an array: parent nodes followed by leaf nodes, total
/// size `2 * capacity - 1`, with the root at position 0. Capacity is rounded
/// up to a power of two so every leaf sits at the same depth.
pub struct SegmentTree<R: Reduce> {
    /// Number of leaf nodes (power of two)
    capacity: usize,
    tree: Vec<R::Node>,
    /// Number of non-neutral leaves
    inserted_elements: usize,
    _reduce: PhantomData<R>,
}

pub type SumTree = SegmentTree<Sum>;
pub type MinTree = SegmentTree<Min>;
pub type MaxTree = SegmentTree<Max>;

impl<R: Reduce> SegmentTree<R> {
    /// Create an empty tree holding at least `capacity` leaves
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            capacity,
            tree: vec![R::neutral(); 2 * capacity - 1],
            inserted_elements: 0,
            _reduce: PhantomData,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn inserted_elements(&self) -> usize {
        self.inserted_elements
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inserted_elements == 0
    }

    /// Store `value` at `data_idx`
    pub fn set(&mut self, data_idx: usize, value: f64) {
        self.update(data_idx, Some(value));
    }

    /// Reset `data_idx` to the neutral element
    pub fn remove(&mut self, data_idx: usize) {
        self.update(data_idx, None);
    }

    /// Set a leaf (or clear it with `None`) and propagate up to the root.
    ///
    /// Panics if `data_idx` is outside the tree.
    pub fn update(&mut self, data_idx: usize, value: Option<f64>) {
        assert!(
            data_idx < self.capacity,
            "index {} out of range for a segment tree of capacity {}",
            data_idx,
            self.capacity
        );
        let tree_idx = data_idx + self.capacity - 1;

        let was_occupied = !R::is_neutral(&self.tree[tree_idx]);
        match (was_occupied, value.is_some()) {
            (false, true) => self.inserted_elements += 1,
            (true, false) => self.inserted_elements -= 1,
            _ => {}
        }
        self.tree[tree_idx] = match value {
            Some(value) => R::leaf(value, data_idx),
            None => R::neutral(),
        };

        let mut idx = tree_idx;
        while idx > 0 {
            idx = (idx - 1) / 2;
            self.tree[idx] = R::combine(self.tree[2 * idx + 1], self.tree[2 * idx + 2]);
        }
    }

    /// Reduction over the whole tree
    #[inline]
    pub fn aggregate(&self) -> R::Node {
        self.tree[0]
    }

    /// Value stored at `data_idx`, `None` for an empty slot
    pub fn get(&self, data_idx: usize) -> Option<f64> {
        assert!(
            data_idx < self.capacity,
            "index {} out of range for a segment tree of capacity {}",
            data_idx,
            self.capacity
        );
        let node = &self.tree[data_idx + self.capacity - 1];
        if R::is_neutral(node) {
            None
        } else {
            Some(R::value(node))
        }
    }

    /// Reset every leaf to the neutral element
    pub fn clear(&mut self) {
        self.tree.fill(R::neutral());
        self.inserted_elements = 0;
    }
}

impl SumTree {
    /// Sum of all stored values
    #[inline]
    pub fn sum(&self) -> f64 {
        self.tree[0].sum
    }

    /// Locate the leaf whose cumulative range contains `mass`.
    ///
    /// Leaves are weighted by `value - shift`; pass `0.0` for plain
    /// proportional sampling. Leaf `i` is returned when the cumulative mass of
    /// leaves before it is `<= mass` and strictly exceeds `mass` once `i` is
    /// included. The descent never enters a subtree without occupied leaves,
    /// and never enters a subtree with no mass while its sibling has some, so
    /// out-of-range masses resolve to the nearest occupied leaf.
    ///
    /// Returns `None` if the tree is empty.
    pub fn find_prefixsum_idx(&self, mass: f64, shift: f64) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let mass_of = |node: &SumNode| node.sum - node.count as f64 * shift;

        let mut idx = 0;
        let mut remaining = mass;
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;

            // Reached a leaf node
            if left >= self.tree.len() {
                break;
            }

            let (left_node, right_node) = (&self.tree[left], &self.tree[right]);
            let go_left = if right_node.count == 0 {
                true
            } else if left_node.count == 0 {
                false
            } else {
                mass_of(left_node) > remaining || mass_of(right_node) <= 0.0
            };

            if go_left {
                idx = left;
            } else {
                remaining -= mass_of(left_node);
                idx = right;
            }
        }

        Some(idx - (self.capacity - 1))
    }
}

impl MinTree {
    /// Smallest stored value and its index
    #[inline]
    pub fn min(&self) -> Extremum {
        self.tree[0]
    }
}

impl MaxTree {
    /// Largest stored value and its index
    #[inline]
    pub fn max(&self) -> Extremum {
        self.tree[0]
    }
}

impl<R: Reduce> fmt::Debug for SegmentTree<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentTree")
            .field("capacity", &self.capacity)
            .field("inserted_elements", &self.inserted_elements)
            .field("root", &self.tree[0])
            .finish()
    }
}
