//! In-memory file layer.
//!
//! Files are byte vectors with reference counts; there is one directory,
//! the root. Counts are public so tests can check that fork duplicates and
//! exit releases exactly once per reference.

use std::vec::Vec;

use spin::Mutex;

use crate::fs::{DirRef, FileRef, Filesystem};

const ROOT: DirRef = DirRef(1);

struct File {
    data: Vec<u8>,
    refs: u32,
}

struct Inner {
    files: Vec<File>,
    root_refs: u32,
}

pub struct MemFs {
    inner: Mutex<Inner>,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                files: Vec::new(),
                root_refs: 0,
            }),
        }
    }

    /// A new file holding `data`, opened once.
    pub fn create(&self, data: &[u8]) -> FileRef {
        let mut inner = self.inner.lock();
        inner.files.push(File {
            data: data.to_vec(),
            refs: 1,
        });
        FileRef(inner.files.len() as u32 - 1)
    }

    pub fn file_refs(&self, file: FileRef) -> u32 {
        self.inner.lock().files.get(file.0 as usize).map_or(0, |f| f.refs)
    }

    /// Outstanding references to the root directory.
    pub fn dir_refs(&self) -> u32 {
        self.inner.lock().root_refs
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for MemFs {
    fn dup_file(&self, file: FileRef) -> FileRef {
        let mut inner = self.inner.lock();
        match inner.files.get_mut(file.0 as usize) {
            Some(f) if f.refs > 0 => f.refs += 1,
            _ => panic!("dup_file: {:?} not open", file),
        }
        file
    }

    fn close_file(&self, file: FileRef) {
        let mut inner = self.inner.lock();
        match inner.files.get_mut(file.0 as usize) {
            Some(f) if f.refs > 0 => f.refs -= 1,
            _ => panic!("close_file: {:?} not open", file),
        }
    }

    fn dup_dir(&self, dir: DirRef) -> DirRef {
        assert_eq!(dir, ROOT, "dup_dir: unknown directory");
        self.inner.lock().root_refs += 1;
        dir
    }

    fn release_dir(&self, dir: DirRef) {
        assert_eq!(dir, ROOT, "release_dir: unknown directory");
        let mut inner = self.inner.lock();
        if inner.root_refs == 0 {
            panic!("release_dir: no references left");
        }
        inner.root_refs -= 1;
    }

    fn root_dir(&self) -> DirRef {
        self.inner.lock().root_refs += 1;
        ROOT
    }

    fn read_at(&self, file: FileRef, dst: &mut [u8], offset: u64) -> Option<usize> {
        let inner = self.inner.lock();
        let data = &inner.files.get(file.0 as usize)?.data;
        let start = usize::try_from(offset).ok()?;
        if start > data.len() {
            return None;
        }
        let n = dst.len().min(data.len() - start);
        dst[..n].copy_from_slice(&data[start..start + n]);
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_counts_follow_dup_and_close() {
        let fs = MemFs::new();
        let f = fs.create(b"hello");
        assert_eq!(fs.dup_file(f), f);
        assert_eq!(fs.file_refs(f), 2);
        fs.close_file(f);
        fs.close_file(f);
        assert_eq!(fs.file_refs(f), 0);

        let root = fs.root_dir();
        fs.dup_dir(root);
        fs.release_dir(root);
        assert_eq!(fs.dir_refs(), 1);
    }

    #[test]
    fn reads_stop_at_the_end() {
        let fs = MemFs::new();
        let f = fs.create(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_at(f, &mut buf, 4), Some(2));
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(fs.read_at(f, &mut buf, 7), None);
    }

    #[test]
    #[should_panic(expected = "close_file")]
    fn closing_too_often_is_fatal() {
        let fs = MemFs::new();
        let f = fs.create(b"");
        fs.close_file(f);
        fs.close_file(f);
    }
}
