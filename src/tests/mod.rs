use std::path::{Path, PathBuf};


use crate::{FileIndex, FileView, FileViewPool, OpenFileError, OpenMode, PoolConfig, StorageId};

/// The logical file size used by the pool tests.
pub const TEST_FILE_SIZE: u64 = 8 << 10;

#[rstest::fixture]
pub fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}

pub fn rw() -> OpenMode {
    OpenMode::READ | OpenMode::WRITE
}

pub fn pool_with_limit(size_limit: usize) -> FileViewPool {
    FileViewPool::new(PoolConfig {
        size_limit,
        ..PoolConfig::default()
    })
}

/// The backing path used for file `file` of storage `storage`.
pub fn backing_path(dir: &Path, storage: StorageId, file: FileIndex) -> PathBuf {
    dir.join(format!("s{}-f{}", storage.0, file.0))
}

/// Open through the pool with the standard test file size.
pub fn open(
    pool: &FileViewPool,
    dir: &Path,
    storage: u32,
    file: u32,
    mode: OpenMode,
) -> Result<FileView, OpenFileError> {
    pool.open_file(
        StorageId(storage),
        FileIndex(file),
        &backing_path(dir, StorageId(storage), FileIndex(file)),
        TEST_FILE_SIZE,
        mode,
    )
}
