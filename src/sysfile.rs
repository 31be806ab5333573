//! File-descriptor system calls.

use crate::exec;
use crate::file::{self, RcFile};
use crate::param::MAXPATH;
use crate::pipe::Pipe;
use crate::proc::KernelCtx;

impl KernelCtx<'_> {
    /// Allocate a file descriptor for the given file; hands the file back
    /// on a full table so the caller can close it properly.
    fn fdalloc(&mut self, file: RcFile) -> Result<usize, RcFile> {
        let files = &mut self.proc_mut().deref_mut_data().open_files;
        for (fd, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd);
            }
        }
        Err(file)
    }

    /// Fetch the nth argument as a file descriptor and return the open file.
    fn arg_fd(&self, n: usize) -> Result<(usize, RcFile), ()> {
        let fd = self.argint(n)? as usize;
        let file = self
            .proc()
            .deref_data()
            .open_files
            .get(fd)
            .ok_or(())?
            .as_ref()
            .ok_or(())?
            .clone();
        Ok((fd, file))
    }

    pub fn sys_dup(&mut self) -> Result<usize, ()> {
        let (_, f) = self.arg_fd(0)?;
        match self.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                file::fileclose(f, self.kernel());
                Err(())
            }
        }
    }

    pub fn sys_read(&mut self) -> Result<usize, ()> {
        let (_, f) = self.arg_fd(0)?;
        let addr = self.argaddr(1)?;
        let n = self.argint(2)?;
        if n < 0 {
            return Err(());
        }
        f.read(self, addr, n as usize)
    }

    pub fn sys_write(&mut self) -> Result<usize, ()> {
        let (_, f) = self.arg_fd(0)?;
        let addr = self.argaddr(1)?;
        let n = self.argint(2)?;
        if n < 0 {
            return Err(());
        }
        f.write(self, addr, n as usize)
    }

    pub fn sys_close(&mut self) -> Result<usize, ()> {
        let fd = self.argint(0)? as usize;
        let file = self
            .proc_mut()
            .deref_mut_data()
            .open_files
            .get_mut(fd)
            .ok_or(())?
            .take()
            .ok_or(())?;
        file::fileclose(file, self.kernel());
        Ok(0)
    }

    /// Create a pipe; writes the two new descriptors (read end first) as two
    /// 32-bit integers at the user address in a0.
    pub fn sys_pipe(&mut self) -> Result<usize, ()> {
        let addr = self.argaddr(0)?;
        let (rf, wf) = Pipe::alloc();

        let fd0 = match self.fdalloc(rf) {
            Ok(fd) => fd,
            Err(rf) => {
                file::fileclose(rf, self.kernel());
                file::fileclose(wf, self.kernel());
                return Err(());
            }
        };
        let fd1 = match self.fdalloc(wf) {
            Ok(fd) => fd,
            Err(wf) => {
                let rf = self.proc_mut().deref_mut_data().open_files[fd0]
                    .take()
                    .unwrap();
                file::fileclose(rf, self.kernel());
                file::fileclose(wf, self.kernel());
                return Err(());
            }
        };

        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&(fd0 as i32).to_le_bytes());
        bytes[4..].copy_from_slice(&(fd1 as i32).to_le_bytes());
        let kmem = self.kernel().kmem();
        if self
            .proc_mut()
            .memory_mut()
            .copy_out(addr, &bytes, kmem)
            .is_err()
        {
            for &fd in &[fd0, fd1] {
                let f = self.proc_mut().deref_mut_data().open_files[fd].take().unwrap();
                file::fileclose(f, self.kernel());
            }
            return Err(());
        }
        Ok(0)
    }

    /// Replace the process image. On success a0 ends up holding argc.
    pub fn sys_exec(&mut self) -> Result<usize, ()> {
        let mut buf = [0u8; MAXPATH];
        let path = self.argstr(0, &mut buf)?;
        let argv = self.argaddr(1)?;
        exec::exec(self, path, argv)
    }
}
