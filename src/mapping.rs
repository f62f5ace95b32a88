use std::fmt::{Debug, Formatter};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{cmp, io, mem};

use parking_lot::{Mutex, MutexGuard};

use crate::mode::OpenMode;

/// Serializes mapping creation against mapping teardown.
///
/// Some platform file mapping APIs misbehave when a file is opened and mapped
/// while another mapping is concurrently being torn down. Callers on those
/// platforms share one [OpenUnmapLock::serializing] capability between the
/// pool and every mapping it creates, everywhere else [OpenUnmapLock::noop]
/// performs no locking at all.
#[derive(Clone, Default)]
pub struct OpenUnmapLock {
    inner: Option<Arc<Mutex<()>>>,
}

impl OpenUnmapLock {
    /// A capability that performs no locking.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// A capability holding a shared lock around every open and unmap.
    pub fn serializing() -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(()))),
        }
    }

    fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.inner.as_ref().map(|lock| lock.lock())
    }
}

impl Debug for OpenUnmapLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpenUnmapLock(serializing={})", self.inner.is_some())
    }
}

/// Error produced when a backing file could not be opened or mapped.
///
/// One failed open is shared with every thread waiting on it, hence the [Arc]
/// around the OS error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OpenFileError {
    /// The OS rejected opening the backing file.
    #[error("open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    /// The file opened but its mapping could not be created.
    #[error("map {path:?}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
}

impl OpenFileError {
    /// The path of the file the pool failed to open.
    pub fn path(&self) -> &Path {
        match self {
            Self::Open { path, .. } => path,
            Self::Map { path, .. } => path,
        }
    }
}

/// An open file handle and its memory mapping.
///
/// The mapping is shared between the pool's cache and every outstanding
/// [FileView], whichever holder drops last tears the mapping down.
pub struct FileMapping {
    backing: Backing,
    mode: OpenMode,
    len: usize,
    open_unmap_lock: OpenUnmapLock,
}

impl FileMapping {
    /// Open `path` and map `file_size` bytes of it in the given `mode`.
    ///
    /// Writable files are created if missing and grown to `file_size` when
    /// the on-disk file is shorter. Read-only files map at most their on-disk
    /// length.
    pub(crate) fn create(
        path: &Path,
        file_size: u64,
        mode: OpenMode,
        open_unmap_lock: &OpenUnmapLock,
    ) -> Result<Self, OpenFileError> {
        #[cfg(test)]
        fail::fail_point!("mapping::create::pause");
        #[cfg(test)]
        fail::fail_point!("mapping::create", |_| {
            Err(OpenFileError::Open {
                path: path.to_path_buf(),
                source: Arc::new(io::Error::other("injected open failure")),
            })
        });

        let open_err = |source: io::Error| OpenFileError::Open {
            path: path.to_path_buf(),
            source: Arc::new(source),
        };
        let map_err = |source: io::Error| OpenFileError::Map {
            path: path.to_path_buf(),
            source: Arc::new(source),
        };

        let _guard = open_unmap_lock.acquire();

        let mut options = OpenOptions::new();
        options.read(true);
        if mode.is_writable() {
            options.write(true).create(true);
        }
        let file = options.open(path).map_err(open_err)?;

        let on_disk = file.metadata().map_err(open_err)?.len();
        let len = if mode.is_writable() {
            if on_disk < file_size {
                file.set_len(file_size).map_err(open_err)?;
            }
            file_size as usize
        } else {
            cmp::min(file_size, on_disk) as usize
        };

        // The OS rejects zero length mappings, empty regions are represented
        // without one.
        let backing = if len == 0 {
            Backing::Empty
        } else if mode.is_writable() {
            // SAFETY: The region stays valid for the life of the mapping as
            // the `MmapMut` keeps the file handle open, external truncation
            // of the file is the caller's contract.
            let map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(&file) }
                .map_err(map_err)?;
            Backing::ReadWrite(map)
        } else {
            // SAFETY: As above.
            let map = unsafe { memmap2::MmapOptions::new().len(len).map(&file) }
                .map_err(map_err)?;
            Backing::ReadOnly(map)
        };

        backing.advise_hints(mode);

        Ok(Self {
            backing,
            mode,
            len,
            open_unmap_lock: open_unmap_lock.clone(),
        })
    }

    #[inline]
    /// The length of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    /// Returns whether the mapped region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    /// The mode the mapping was created with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Synchronize `len` bytes of the mapping starting at `offset` back to
    /// the file on disk.
    ///
    /// No-op for read-only and empty mappings.
    pub fn flush(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(test)]
        fail::fail_point!("mapping::flush", |_| {
            Err(io::Error::other("injected flush failure"))
        });

        match &self.backing {
            Backing::ReadWrite(map) => map.flush_range(offset, len),
            _ => Ok(()),
        }
    }

    fn region_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::Empty => unreachable!("empty mappings reject all accesses"),
            Backing::ReadOnly(map) => map.as_ptr(),
            Backing::ReadWrite(map) => map.as_ptr(),
        }
    }
}

impl Debug for FileMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileMapping(len={}, mode={:?})", self.len, self.mode)
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // The unmap must hold the same capability the open held.
        let _guard = self.open_unmap_lock.acquire();
        let backing = mem::replace(&mut self.backing, Backing::Empty);
        drop(backing);
    }
}

enum Backing {
    Empty,
    ReadOnly(memmap2::Mmap),
    ReadWrite(memmap2::MmapMut),
}

impl Backing {
    /// Forward the access pattern hint bits to the kernel, best effort.
    fn advise_hints(&self, mode: OpenMode) {
        #[cfg(unix)]
        {
            use memmap2::Advice;

            let advice = if mode.contains(OpenMode::RANDOM_ACCESS) {
                Advice::Random
            } else if mode.contains(OpenMode::SEQUENTIAL) {
                Advice::Sequential
            } else {
                return;
            };

            let result = match self {
                Backing::Empty => Ok(()),
                Backing::ReadOnly(map) => map.advise(advice),
                Backing::ReadWrite(map) => map.advise(advice),
            };
            if let Err(error) = result {
                tracing::debug!(error = %error, "kernel rejected madvise hint");
            }
        }
        #[cfg(not(unix))]
        let _ = mode;
    }
}

#[derive(Clone)]
/// A borrowed handle onto a [FileMapping]'s mapped region.
///
/// Holding a view keeps the mapping and its file handle alive, even after the
/// pool has evicted the cache entry it was served from.
pub struct FileView {
    mapping: Arc<FileMapping>,
}

impl FileView {
    pub(crate) fn new(mapping: Arc<FileMapping>) -> Self {
        Self { mapping }
    }

    #[inline]
    /// The length of the viewable region in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len
    }

    #[inline]
    /// Returns whether the viewable region is empty.
    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    #[inline]
    /// The mode the backing file was opened in.
    pub fn mode(&self) -> OpenMode {
        self.mapping.mode
    }

    /// Copy `dst.len()` bytes out of the view starting at `offset`.
    ///
    /// # Safety
    ///
    /// No thread may be writing to the `offset..offset + dst.len()` range of
    /// this file for the duration of the call. Disjoint ranges may be read
    /// and written concurrently.
    pub unsafe fn read(&self, offset: usize, dst: &mut [u8]) {
        if dst.is_empty() {
            return;
        }

        let end = offset.checked_add(dst.len()).expect("read range overflows");
        assert!(end <= self.mapping.len, "read past the end of the view");

        let ptr = self.mapping.region_ptr();
        // SAFETY: We have pre-checked the range is within the mapping, and
        // the caller guarantees no concurrent writer overlaps it.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Copy `src` into the view starting at `offset`.
    ///
    /// The view must have been opened with [OpenMode::WRITE].
    ///
    /// # Safety
    ///
    /// No other thread may be reading or writing the
    /// `offset..offset + src.len()` range of this file for the duration of
    /// the call. Disjoint ranges may be read and written concurrently.
    pub unsafe fn write(&self, offset: usize, src: &[u8]) {
        if src.is_empty() {
            return;
        }

        assert!(self.mapping.mode.is_writable(), "view is not writable");
        let end = offset.checked_add(src.len()).expect("write range overflows");
        assert!(end <= self.mapping.len, "write past the end of the view");

        let ptr = self.mapping.region_ptr() as *mut u8;
        // SAFETY: We have pre-checked the range is within a writable mapping,
        // and the caller guarantees no concurrent access overlaps it.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(offset), src.len());
        }
    }

    #[cfg(test)]
    pub(crate) fn mapping(&self) -> &Arc<FileMapping> {
        &self.mapping
    }
}

impl Debug for FileView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileView(len={}, mode={:?})", self.len(), self.mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_mode() -> OpenMode {
        OpenMode::READ | OpenMode::WRITE
    }

    #[test]
    fn test_create_writable_grows_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let mapping =
            FileMapping::create(&path, 8192, rw_mode(), &OpenUnmapLock::noop())
                .expect("create writable mapping");
        assert_eq!(mapping.len(), 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn test_read_only_maps_on_disk_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![7u8; 100]).unwrap();

        let mapping =
            FileMapping::create(&path, 8192, OpenMode::READ, &OpenUnmapLock::noop())
                .expect("create read-only mapping");
        assert_eq!(mapping.len(), 100);
    }

    #[test]
    fn test_read_only_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");

        let error =
            FileMapping::create(&path, 8192, OpenMode::READ, &OpenUnmapLock::noop())
                .expect_err("open of a missing read-only file should fail");
        assert!(matches!(error, OpenFileError::Open { .. }));
        assert_eq!(error.path(), path);
    }

    #[test]
    fn test_empty_region_has_no_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");

        let mapping =
            FileMapping::create(&path, 0, rw_mode(), &OpenUnmapLock::noop())
                .expect("create empty mapping");
        assert!(mapping.is_empty());
        assert!(matches!(mapping.backing, Backing::Empty));

        let view = FileView::new(Arc::new(mapping));
        unsafe {
            view.read(0, &mut []);
            view.write(0, &[]);
        }
    }

    #[test]
    fn test_view_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let mapping = Arc::new(
            FileMapping::create(&path, 4096, rw_mode(), &OpenUnmapLock::noop())
                .expect("create writable mapping"),
        );
        let view = FileView::new(mapping.clone());

        let payload = b"file view pool";
        unsafe { view.write(128, payload) };

        let mut readback = vec![0u8; payload.len()];
        unsafe { view.read(128, &mut readback) };
        assert_eq!(&readback, payload);

        // Shared mappings are coherent with the page cache, the write is
        // visible to plain reads once the mapping is gone.
        drop(view);
        drop(mapping);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[128..128 + payload.len()], payload);
    }

    #[test]
    #[should_panic(expected = "view is not writable")]
    fn test_read_only_view_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![0u8; 512]).unwrap();

        let mapping =
            FileMapping::create(&path, 512, OpenMode::READ, &OpenUnmapLock::noop())
                .expect("create read-only mapping");
        let view = FileView::new(Arc::new(mapping));
        unsafe { view.write(0, &[1]) };
    }

    #[test]
    #[should_panic(expected = "read past the end of the view")]
    fn test_view_rejects_out_of_bounds_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let mapping =
            FileMapping::create(&path, 256, rw_mode(), &OpenUnmapLock::noop())
                .expect("create writable mapping");
        let view = FileView::new(Arc::new(mapping));
        let mut buffer = [0u8; 16];
        unsafe { view.read(250, &mut buffer) };
    }

    #[test]
    fn test_serializing_unmap_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let lock = OpenUnmapLock::serializing();

        let mapping = FileMapping::create(&path, 1024, rw_mode(), &lock)
            .expect("create mapping under serializing lock");
        // Drop re-acquires the shared lock around the unmap.
        drop(mapping);

        let guard = lock.acquire();
        assert!(guard.is_some());
    }
}
