use std::fmt::Display;

use termtree::Tree;
use tracing::instrument;

use crate::tree::NodeRef;

const UNSET_LABEL: &str = "<unset>";

pub trait TreeNodeConvert {
    fn to_tree_string(&self) -> Tree<String>;
}

impl<T: Display> TreeNodeConvert for NodeRef<T> {
    /// Renders the subtree with each node's local value; unset nodes show
    /// as `<unset>`.
    #[instrument(level = "trace", skip(self))]
    fn to_tree_string(&self) -> Tree<String> {
        let label = self.read_value(|value| match value {
            Some(value) => value.to_string(),
            None => UNSET_LABEL.to_string(),
        });

        // children are snapshotted first so this node's lock is not held while
        // recursing
        let leaves: Vec<_> = self
            .children()
            .iter()
            .map(|child| child.to_tree_string())
            .collect();

        Tree::new(label).with_leaves(leaves)
    }
}
