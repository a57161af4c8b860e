pub(crate) mod lock;
pub(crate) mod read;
pub(crate) mod reaper;
pub(crate) mod write;

pub use read::ReadTransaction;
pub use write::WriteTransaction;
