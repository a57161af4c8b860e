use thiserror::Error;

/// All failures surfaced by the storage engine.
///
/// `KeyNotFound` is informational and normally swallowed by the public API
/// (a `get` miss is `None`, not an error); everything else is propagated.
#[derive(Error, Debug)]
pub enum SnapError {
    #[error("invalid offset {0:#x}: {1}")]
    InvalidOffset(i64, String),

    #[error("unexpected end of data: {0}")]
    EndOfFile(String),

    #[error("corrupted btree: {0}")]
    InvalidBTree(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("value already present and duplicate values are disabled")]
    DuplicateValueNotAllowed,

    #[error("btree {0:?} is already managed")]
    BTreeAlreadyManaged(String),

    #[error("btree configuration invalid: {0}")]
    BTreeCreation(String),

    #[error("read transaction expired or closed")]
    StaleRead,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapError {
    /// True when the error denotes file corruption rather than misuse.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SnapError::InvalidOffset(_, _) | SnapError::EndOfFile(_) | SnapError::InvalidBTree(_)
        )
    }
}
