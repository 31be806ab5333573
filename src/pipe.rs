//! Pipes: the in-kernel producer/consumer rendezvous.
//!
//! A ring buffer under a spinlock with one wait channel per direction.
//! Writers sleep while the buffer is full and a reader is still alive;
//! readers sleep while it is empty and a writer is still alive. Every sleep
//! re-checks its condition in a loop, as the channel may wake for other
//! reasons.

use std::sync::Arc;

use crate::addr::UVAddr;
use crate::file::{self, RcFile};
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::proc::{KernelCtx, WaitChannel};

const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// The read end is still open.
    readopen: bool,

    /// The write end is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// WaitChannel saying there are unread bytes in data.
    read_waitchannel: WaitChannel,

    /// WaitChannel saying there is room to write in data.
    write_waitchannel: WaitChannel,
}

impl Pipe {
    /// A new pipe, as a pair of (read end, write end) files.
    pub fn alloc() -> (RcFile, RcFile) {
        let pipe = Arc::new(Pipe {
            inner: Spinlock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        });
        file::pipe_files(pipe)
    }

    /// Close one side; the last close of a side wakes the other side so it
    /// can observe end-of-file or write failure.
    pub(crate) fn close(&self, write_end: bool, kernel: &Kernel) {
        let mut inner = self.inner.lock();
        if write_end {
            inner.writeopen = false;
            self.read_waitchannel.wakeup(kernel);
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup(kernel);
        }
        drop(inner);
    }

    pub fn write(&self, ctx: &mut KernelCtx<'_>, addr: UVAddr, n: usize) -> Result<usize, ()> {
        let kmem = ctx.kernel().kmem();
        let mut inner = self.inner.lock();
        let mut i = 0;
        while i < n {
            if !inner.readopen || ctx.proc().killed() {
                return Err(());
            }
            if inner.nwrite == inner.nread.wrapping_add(PIPESIZE as u32) {
                // Buffer is full: let readers drain it and wait for room.
                self.read_waitchannel.wakeup(ctx.kernel());
                self.write_waitchannel.sleep(&mut inner, ctx);
            } else {
                let mut byte = [0u8; 1];
                if ctx
                    .proc_mut()
                    .memory_mut()
                    .copy_in(&mut byte, addr.plus(i), kmem)
                    .is_err()
                {
                    break;
                }
                let idx = (inner.nwrite as usize) % PIPESIZE;
                inner.data[idx] = byte[0];
                inner.nwrite = inner.nwrite.wrapping_add(1);
                i += 1;
            }
        }
        self.read_waitchannel.wakeup(ctx.kernel());
        Ok(i)
    }

    pub fn read(&self, ctx: &mut KernelCtx<'_>, addr: UVAddr, n: usize) -> Result<usize, ()> {
        let kmem = ctx.kernel().kmem();
        let mut inner = self.inner.lock();

        // Wait for bytes unless every writer is gone.
        while inner.nread == inner.nwrite && inner.writeopen {
            if ctx.proc().killed() {
                return Err(());
            }
            self.read_waitchannel.sleep(&mut inner, ctx);
        }

        let mut i = 0;
        while i < n && inner.nread != inner.nwrite {
            let idx = (inner.nread as usize) % PIPESIZE;
            let byte = [inner.data[idx]];
            if ctx
                .proc_mut()
                .memory_mut()
                .copy_out(addr.plus(i), &byte, kmem)
                .is_err()
            {
                break;
            }
            inner.nread = inner.nread.wrapping_add(1);
            i += 1;
        }
        self.write_waitchannel.wakeup(ctx.kernel());
        Ok(i)
    }
}
