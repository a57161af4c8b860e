use crate::error::SnapError;

pub type SnapResult<T = ()> = Result<T, SnapError>;

/// A committed state of the store. Revisions increase by one per commit.
pub type Revision = i64;

/// Sentinel for "no page here" in every on-disk offset slot.
pub const NO_PAGE: i64 = -1;
