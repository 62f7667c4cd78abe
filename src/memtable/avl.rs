//! Height-balanced binary search tree (AVL) backing the memtable.
//!
//! Every node satisfies `|height(left) - height(right)| <= 1`. Inserts walk
//! down recursively and rebalance each ancestor on the way back up, so the
//! invariant holds again before [`AvlTree::insert`] returns. Overwrites never
//! change the shape of the tree.

use std::cmp::Ordering;

use super::OrderedMap;

type Link = Option<Box<Node>>;

#[derive(Debug)]
struct Node {
    key: String,
    value: String,
    height: i32,
    left: Link,
    right: Link,
}

impl Node {
    fn new(key: String, value: String) -> Self {
        Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        }
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    /// Left height minus right height.
    fn balance(&self) -> i32 {
        height(&self.left) - height(&self.right)
    }
}

fn height(link: &Link) -> i32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn rotate_right(mut node: Box<Node>) -> Box<Node> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };
    node.left = pivot.right.take();
    node.update_height();
    pivot.right = Some(node);
    pivot.update_height();
    pivot
}

fn rotate_left(mut node: Box<Node>) -> Box<Node> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };
    node.right = pivot.left.take();
    node.update_height();
    pivot.left = Some(node);
    pivot.update_height();
    pivot
}

/// Restores the AVL invariant at `node`, assuming both subtrees already hold it.
fn rebalance(mut node: Box<Node>) -> Box<Node> {
    node.update_height();
    let balance = node.balance();

    if balance > 1 {
        // Left-right case: straighten the left child first.
        if node.left.as_ref().map_or(0, |l| l.balance()) < 0 {
            node.left = node.left.take().map(rotate_left);
        }
        return rotate_right(node);
    }

    if balance < -1 {
        // Right-left case.
        if node.right.as_ref().map_or(0, |r| r.balance()) > 0 {
            node.right = node.right.take().map(rotate_right);
        }
        return rotate_left(node);
    }

    node
}

fn insert_node(link: Link, key: String, value: String, inserted: &mut bool) -> Box<Node> {
    let Some(mut node) = link else {
        *inserted = true;
        return Box::new(Node::new(key, value));
    };

    match key.as_str().cmp(node.key.as_str()) {
        Ordering::Less => node.left = Some(insert_node(node.left.take(), key, value, inserted)),
        Ordering::Greater => {
            node.right = Some(insert_node(node.right.take(), key, value, inserted))
        }
        Ordering::Equal => return node,
    }

    rebalance(node)
}

/// An AVL tree mapping `String` keys to `String` values in byte order.
#[derive(Debug, Default)]
pub struct AvlTree {
    root: Link,
    len: usize,
}

impl AvlTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Height of the whole tree; `0` when empty.
    pub fn height(&self) -> i32 {
        height(&self.root)
    }

    fn find(&self, key: &str) -> Option<&Node> {
        let mut cursor = self.root.as_deref();
        while let Some(node) = cursor {
            cursor = match key.cmp(node.key.as_str()) {
                Ordering::Less => node.left.as_deref(),
                Ordering::Greater => node.right.as_deref(),
                Ordering::Equal => return Some(node),
            };
        }
        None
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut Node> {
        let mut cursor = self.root.as_deref_mut();
        while let Some(node) = cursor {
            cursor = match key.cmp(node.key.as_str()) {
                Ordering::Less => node.left.as_deref_mut(),
                Ordering::Greater => node.right.as_deref_mut(),
                Ordering::Equal => return Some(node),
            };
        }
        None
    }

    /// Walks the whole tree and panics if ordering, cached heights, or the
    /// balance bound are violated anywhere.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        fn check(link: &Link, lower: Option<&str>, upper: Option<&str>) -> i32 {
            let Some(node) = link else {
                return 0;
            };
            if let Some(lower) = lower {
                assert!(node.key.as_str() > lower, "key {} out of order", node.key);
            }
            if let Some(upper) = upper {
                assert!(node.key.as_str() < upper, "key {} out of order", node.key);
            }
            let lh = check(&node.left, lower, Some(&node.key));
            let rh = check(&node.right, Some(&node.key), upper);
            assert!((lh - rh).abs() <= 1, "unbalanced at {}", node.key);
            assert_eq!(node.height, 1 + lh.max(rh), "stale height at {}", node.key);
            node.height
        }
        check(&self.root, None, None);
    }
}

impl OrderedMap for AvlTree {
    fn insert(&mut self, key: String, value: String) -> bool {
        let mut inserted = false;
        self.root = Some(insert_node(self.root.take(), key, value, &mut inserted));
        if inserted {
            self.len += 1;
        }
        inserted
    }

    fn update(&mut self, key: &str, value: String) -> bool {
        match self.find_mut(key) {
            Some(node) => {
                node.value = value;
                true
            }
            None => false,
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.find(key).map(|n| n.value.as_str())
    }

    fn iter_sorted(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        Box::new(iter)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }
}

/// In-order traversal with an explicit stack of pending ancestors.
struct Iter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iter<'a> {
    fn push_left(&mut self, mut link: Option<&'a Node>) {
        while let Some(node) = link {
            self.stack.push(node);
            link = node.left.as_deref();
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((node.key.as_str(), node.value.as_str()))
    }
}
