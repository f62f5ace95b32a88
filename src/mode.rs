bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    /// The mode a pooled file is opened and mapped in.
    pub struct OpenMode: u8 {
        /// The file can be read through its views.
        const READ = 1 << 0;
        /// The file can be written through its views.
        ///
        /// Writable files are created if missing and grown to their logical
        /// size when the on-disk file is shorter.
        const WRITE = 1 << 1;
        /// Hint that accesses will touch offsets in no particular order.
        const RANDOM_ACCESS = 1 << 2;
        /// Hint that accesses will sweep the file front to back.
        const SEQUENTIAL = 1 << 3;
        /// Hint that the OS should avoid retaining pages in its cache.
        const NO_CACHE = 1 << 4;
    }
}

impl OpenMode {
    /// Returns whether a handle held in `self` can serve a request for
    /// `requested`.
    ///
    /// Only the [OpenMode::WRITE] bit participates, the remaining bits are
    /// hints and never invalidate a cached handle.
    pub fn covers(self, requested: OpenMode) -> bool {
        !(requested.contains(OpenMode::WRITE) && !self.contains(OpenMode::WRITE))
    }

    #[inline]
    /// Returns whether the [OpenMode::WRITE] bit is set.
    pub fn is_writable(self) -> bool {
        self.contains(OpenMode::WRITE)
    }
}
