//! Value inheritance trees.
//!
//! Each node may carry a value; a node without one inherits the value of its
//! nearest ancestor that has one. Nodes are shared as [`NodeRef`]s across
//! threads. Every node guards its own value and children with its own
//! [`ReentrantLock`], and no operation ever holds the locks of two different
//! nodes at once.

use std::cell::RefCell;
use std::fmt;
use std::iter::FusedIterator;
use std::mem;
use std::sync::{Arc, Weak};

use tracing::{debug, instrument, trace};

use crate::errors::{TreeError, TreeResult};
use crate::reentrant::ReentrantLock;

pub type NodeRef<T> = Arc<Node<T>>;

struct NodeState<T> {
    value: Option<T>,
    children: Vec<NodeRef<T>>,
}

/// Tree node with an optional local value.
///
/// Children are owned by their parent; the link back to the parent is weak
/// and fixed at construction. Holding a leaf therefore does not keep its
/// ancestors alive: whoever holds the root owns the tree.
pub struct Node<T> {
    parent: Option<Weak<Node<T>>>,
    state: ReentrantLock<RefCell<NodeState<T>>>,
}

impl<T> Node<T> {
    /// Creates a node holding `value`, appended to `parent`'s children if given.
    ///
    /// Only the parent's lock is taken; the new node is not reachable by any
    /// other thread until it has been linked.
    #[instrument(level = "trace", skip_all, fields(has_parent = parent.is_some()))]
    pub fn new(parent: Option<&NodeRef<T>>, value: T) -> NodeRef<T> {
        let node = Arc::new(Node {
            parent: parent.map(Arc::downgrade),
            state: ReentrantLock::new(RefCell::new(NodeState {
                value: Some(value),
                children: Vec::new(),
            })),
        });

        if let Some(parent) = parent {
            let guard = parent.state.lock();
            let mut state = guard.borrow_mut();
            state.children.push(Arc::clone(&node));
            trace!(siblings = state.children.len(), "linked new node");
        }

        node
    }

    pub fn root(value: T) -> NodeRef<T> {
        Self::new(None, value)
    }

    pub fn child(parent: &NodeRef<T>, value: T) -> NodeRef<T> {
        Self::new(Some(parent), value)
    }

    /// Drops the local value. Children and ancestors are untouched; clearing
    /// an unset node does nothing.
    #[instrument(level = "trace", skip(self))]
    pub fn clear_value(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().value = None;
    }

    /// Replaces the local value, returning the previous one.
    #[instrument(level = "trace", skip_all)]
    pub fn set_value(&self, value: T) -> Option<T> {
        let guard = self.state.lock();
        let previous = guard.borrow_mut().value.replace(value);
        previous
    }

    pub fn has_value(&self) -> bool {
        self.read_value(|value| value.is_some())
    }

    pub fn local_value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.read_value(|value| value.cloned())
    }

    /// Resolves the value visible at this node: its own if set, otherwise the
    /// nearest ancestor's.
    ///
    /// Each node on the way up is locked, inspected and released before moving
    /// on, so the result reflects every node as it was when visited, not a
    /// snapshot of the whole chain.
    ///
    /// # Errors
    ///
    /// [`TreeError::EffectiveValueNotFound`] if no node up to and including
    /// the root carries a value.
    #[instrument(level = "trace", skip(self))]
    pub fn effective_value(&self) -> TreeResult<T>
    where
        T: Clone,
    {
        if let Some(value) = self.local_value() {
            return Ok(value);
        }

        let mut hops = 1usize;
        let mut next = self.parent();
        while let Some(node) = next {
            if let Some(value) = node.local_value() {
                trace!(hops, "inherited value");
                return Ok(value);
            }
            hops += 1;
            next = node.parent();
        }

        debug!(hops, "no value on ancestor chain");
        Err(TreeError::EffectiveValueNotFound)
    }

    /// Runs `f` while holding this node's lock.
    ///
    /// Other threads cannot read or change this node until `f` returns, so a
    /// check followed by an update inside `f` is atomic. Operations on this
    /// same node called from `f` re-enter the lock.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.lock();
        f()
    }

    /// The parent node, or `None` for a root or once the parent was dropped.
    pub fn parent(&self) -> Option<NodeRef<T>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Whether this node was created without a parent. Stays `false` after
    /// the parent is dropped, even though [`Node::parent`] then returns `None`.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Snapshot of the direct children in creation order.
    pub fn children(&self) -> Vec<NodeRef<T>> {
        let guard = self.state.lock();
        let children = guard.borrow().children.clone();
        children
    }

    /// Number of parent links between this node and its root.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut next = self.parent();
        while let Some(node) = next {
            depth += 1;
            next = node.parent();
        }
        depth
    }

    /// Lazily walks from this node up to the root, both inclusive.
    ///
    /// No lock is held between items; parent links never change, so the walk
    /// neither skips nor repeats a node.
    pub fn ancestors(self: &Arc<Self>) -> Ancestors<T> {
        Ancestors {
            next: Some(Arc::clone(self)),
        }
    }

    /// Pre-order walk of the subtree rooted here, this node first.
    ///
    /// Children lists are snapshotted one node at a time, so nodes linked
    /// concurrently may or may not show up.
    #[instrument(level = "trace", skip(self))]
    pub fn descendants(self: &Arc<Self>) -> Vec<NodeRef<T>> {
        let mut nodes = Vec::new();
        let mut stack = vec![Arc::clone(self)];
        while let Some(node) = stack.pop() {
            // reversed so children come out left to right
            stack.extend(node.children().into_iter().rev());
            nodes.push(node);
        }
        nodes
    }

    pub fn leaf_nodes(self: &Arc<Self>) -> Vec<NodeRef<T>> {
        self.descendants()
            .into_iter()
            .filter(|node| node.read_value_state(|state| state.children.is_empty()))
            .collect()
    }

    /// Runs `f` on the local value under this node's lock.
    ///
    /// `f` must not change this node; the value is borrowed for its duration.
    pub(crate) fn read_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        self.read_value_state(|state| f(state.value.as_ref()))
    }

    fn read_value_state<R>(&self, f: impl FnOnce(&NodeState<T>) -> R) -> R {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state)
    }
}

impl<T: fmt::Debug> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.read_value_state(|state| {
            f.debug_struct("Node")
                .field("value", &state.value)
                .field("children", &state.children.len())
                .field("is_root", &self.is_root())
                .finish()
        })
    }
}

// Dropping a long chain recursively would overflow the stack, so uniquely
// owned descendants are unlinked into a work list instead.
impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        let mut pending = mem::take(&mut self.state.get_mut().get_mut().children);
        while let Some(child) = pending.pop() {
            if let Ok(mut child) = Arc::try_unwrap(child) {
                pending.append(&mut child.state.get_mut().get_mut().children);
            }
        }
    }
}

/// Iterator returned by [`Node::ancestors`].
pub struct Ancestors<T> {
    next: Option<NodeRef<T>>,
}

impl<T> Iterator for Ancestors<T> {
    type Item = NodeRef<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}

impl<T> FusedIterator for Ancestors<T> {}
