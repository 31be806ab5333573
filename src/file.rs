//! The open-file layer consumed by the kernel core.
//!
//! Files are reference-counted: `fork` clones the `Arc`, `exit` and `close`
//! drop it, and side effects of the final close (waking a pipe's peer)
//! happen in `fileclose`. The kernel core only depends on this thin
//! interface; real device drivers live elsewhere.

use std::sync::Arc;

use crate::addr::UVAddr;
use crate::kernel::Kernel;
use crate::pipe::Pipe;
use crate::proc::KernelCtx;

pub type RcFile = Arc<File>;

pub struct File {
    typ: FileType,
    readable: bool,
    writable: bool,
}

enum FileType {
    /// The console device: writes land in the kernel console buffer,
    /// reads report end-of-file (the emulated machine has no input device).
    Console,
    Pipe {
        pipe: Arc<Pipe>,
        write_end: bool,
    },
}

/// An open console endpoint.
pub fn console(readable: bool, writable: bool) -> RcFile {
    Arc::new(File {
        typ: FileType::Console,
        readable,
        writable,
    })
}

/// The two endpoints of a fresh pipe.
pub(crate) fn pipe_files(pipe: Arc<Pipe>) -> (RcFile, RcFile) {
    let read = Arc::new(File {
        typ: FileType::Pipe {
            pipe: Arc::clone(&pipe),
            write_end: false,
        },
        readable: true,
        writable: false,
    });
    let write = Arc::new(File {
        typ: FileType::Pipe {
            pipe,
            write_end: true,
        },
        readable: false,
        writable: true,
    });
    (read, write)
}

impl File {
    /// Read up to n bytes into the process's memory at addr.
    pub fn read(&self, ctx: &mut KernelCtx<'_>, addr: UVAddr, n: usize) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }
        match &self.typ {
            FileType::Console => Ok(0),
            FileType::Pipe { pipe, .. } => pipe.read(ctx, addr, n),
        }
    }

    /// Write n bytes from the process's memory at addr.
    pub fn write(&self, ctx: &mut KernelCtx<'_>, addr: UVAddr, n: usize) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }
        match &self.typ {
            FileType::Console => {
                let mut buf = [0u8; 128];
                let kmem = ctx.kernel().kmem();
                let mut done = 0;
                while done < n {
                    let chunk = core::cmp::min(buf.len(), n - done);
                    ctx.proc_mut()
                        .memory_mut()
                        .copy_in(&mut buf[..chunk], addr.plus(done), kmem)?;
                    ctx.kernel().console_put(&buf[..chunk]);
                    done += chunk;
                }
                Ok(n)
            }
            FileType::Pipe { pipe, .. } => pipe.write(ctx, addr, n),
        }
    }
}

/// Drop one reference to the file; the last reference closes it.
pub fn fileclose(file: RcFile, kernel: &Kernel) {
    if let Ok(file) = Arc::try_unwrap(file) {
        if let FileType::Pipe { pipe, write_end } = file.typ {
            pipe.close(write_end, kernel);
        }
    }
}
