//! Thread-safe value inheritance trees.
//!
//! A value set on a node is visible to every descendant until one of them
//! overrides it; [`Node::effective_value`] resolves the nearest value on the
//! way up to the root. Each node is guarded by its own [`ReentrantLock`], a
//! recursive mutex that its owning thread may re-acquire without blocking.
//!
//! ```
//! use inheritree::{Node, TreeError};
//!
//! let root = Node::root("root_value");
//! let child = Node::child(&root, "child_value");
//!
//! assert_eq!(child.effective_value(), Ok("child_value"));
//! child.clear_value();
//! assert_eq!(child.effective_value(), Ok("root_value"));
//! root.clear_value();
//! assert_eq!(child.effective_value(), Err(TreeError::EffectiveValueNotFound));
//! ```

pub mod errors;
pub mod reentrant;
pub mod tree;
pub mod tree_traits;
pub mod util;

pub use errors::{LockOwnershipViolation, TreeError, TreeResult};
pub use reentrant::{Locker, ReentrantLock, ReentrantLockGuard};
pub use tree::{Ancestors, Node, NodeRef};
pub use tree_traits::TreeNodeConvert;
