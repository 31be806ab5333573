//! The storage interface the kernel core consumes, and an in-memory
//! implementation of it.
//!
//! The real storage stack (buffer cache, inodes, logging) is an external
//! collaborator; program loading only ever calls through this trait. Tests
//! and boot use `MemFs`, a path → bytes map. Being outside the kernel core,
//! it may use host locking.

use std::sync::RwLock;

/// An opaque handle to a resolved file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FsHandle(usize);

pub trait Storage: Send + Sync {
    /// Look a path up; None if it does not exist.
    fn resolve_path(&self, path: &str) -> Option<FsHandle>;

    /// Read up to buf.len() bytes at the given offset; returns the number
    /// of bytes read (0 at end of file).
    fn read_bytes(&self, handle: FsHandle, buf: &mut [u8], off: usize) -> Result<usize, ()>;

    /// Write buf at the given offset, growing the file if needed; returns
    /// the number of bytes written.
    fn write_bytes(&self, handle: FsHandle, buf: &[u8], off: usize) -> Result<usize, ()>;
}

/// Read exactly buf.len() bytes or fail.
pub fn read_exact(
    storage: &dyn Storage,
    handle: FsHandle,
    buf: &mut [u8],
    off: usize,
) -> Result<(), ()> {
    if storage.read_bytes(handle, buf, off)? != buf.len() {
        return Err(());
    }
    Ok(())
}

/// An in-memory file store.
pub struct MemFs {
    files: Vec<(String, RwLock<Vec<u8>>)>,
}

impl MemFs {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Add (or replace) a file.
    pub fn add(&mut self, path: &str, bytes: Vec<u8>) {
        if let Some((_, data)) = self.files.iter().find(|(p, _)| p == path) {
            *data.write().unwrap() = bytes;
            return;
        }
        self.files.push((path.to_string(), RwLock::new(bytes)));
    }

    /// Builder-style `add`.
    pub fn with(mut self, path: &str, bytes: Vec<u8>) -> Self {
        self.add(path, bytes);
        self
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemFs {
    fn resolve_path(&self, path: &str) -> Option<FsHandle> {
        self.files
            .iter()
            .position(|(p, _)| p == path)
            .map(FsHandle)
    }

    fn read_bytes(&self, handle: FsHandle, buf: &mut [u8], off: usize) -> Result<usize, ()> {
        let (_, data) = self.files.get(handle.0).ok_or(())?;
        let data = data.read().unwrap();
        if off >= data.len() {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write_bytes(&self, handle: FsHandle, buf: &[u8], off: usize) -> Result<usize, ()> {
        let (_, data) = self.files.get(handle.0).ok_or(())?;
        let mut data = data.write().unwrap();
        if data.len() < off + buf.len() {
            data.resize(off + buf.len(), 0);
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}
