pub(crate) mod cursor;
pub(crate) mod delete;
pub(crate) mod info;
pub(crate) mod insert;
pub(crate) mod leaf;
pub(crate) mod node;
pub(crate) mod page;
pub(crate) mod tree;
pub(crate) mod tree_header;
pub(crate) mod value_holder;
pub(crate) mod wal;

pub use cursor::{KeyCursor, TupleCursor};
pub use info::BTreeInfo;
pub use insert::InsertOutcome;
pub use tree::BTree;
pub use tree_header::TreeHeader;

/// What a tree is used for. The kind decides two things at commit time:
/// system trees are updated after user trees, and their superseded pages
/// are freed directly instead of being listed for the reclaimer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    User,
    /// The tree directory: `(name, revision)` to tree header offset.
    Directory,
    /// The copied-pages tree: `(revision, name)` to superseded offsets.
    CopiedPages,
    /// A nested per-key value tree; never registered in the directory.
    SubValues,
}
