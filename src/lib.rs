mod index;
mod mapping;
mod mode;
mod opening;
mod pool;
#[cfg(all(test, not(miri)))]
mod tests;

pub use self::index::{FileId, FileIndex, StorageId};
pub use self::mapping::{FileMapping, FileView, OpenFileError, OpenUnmapLock};
pub use self::mode::OpenMode;
pub use self::pool::{FileViewPool, OpenFileState, PoolConfig};
