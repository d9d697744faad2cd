//! The file layer as seen from the process core.
//!
//! Open files and directories are opaque handles whose reference counts the
//! file layer keeps. The core only duplicates and releases them (fork, exit)
//! and reads program images through them.

/// An open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRef(pub u32);

/// A directory reference (the working directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirRef(pub u32);

pub trait Filesystem: Sync {
    /// Take another reference on `file`.
    fn dup_file(&self, file: FileRef) -> FileRef;
    /// Drop one reference on `file`.
    fn close_file(&self, file: FileRef);
    fn dup_dir(&self, dir: DirRef) -> DirRef;
    fn release_dir(&self, dir: DirRef);
    /// A new reference to the root directory.
    fn root_dir(&self) -> DirRef;
    /// Read up to `dst.len()` bytes at `offset`. `None` on I/O failure.
    fn read_at(&self, file: FileRef, dst: &mut [u8], offset: u64) -> Option<usize>;
}
