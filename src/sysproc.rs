//! Process-related system calls.

use crate::proc::KernelCtx;

impl KernelCtx<'_> {
    /// Terminate the current process; status reported to wait(). No return.
    pub fn sys_exit(&mut self) -> Result<usize, ()> {
        let n = self.argint(0)?;
        self.kernel().procs().exit_current(n, self)
    }

    /// Create a process, copying the parent.
    /// Returns Ok(child's pid) on success, Err(()) on error.
    pub fn sys_fork(&mut self) -> Result<usize, ()> {
        Ok(self.kernel().procs().fork(self)? as usize)
    }

    /// Wait for a child to exit.
    /// Returns Ok(child's pid) on success, Err(()) on error.
    pub fn sys_wait(&mut self) -> Result<usize, ()> {
        let p = self.argaddr(0)?;
        Ok(self.kernel().procs().wait(p, self)? as usize)
    }

    /// Return the current process's pid.
    pub fn sys_getpid(&self) -> Result<usize, ()> {
        Ok(self.proc().pid() as usize)
    }

    /// Grow (lazily) or shrink the process's memory by n bytes.
    /// Returns Ok(start of the new memory) on success, Err(()) on error.
    pub fn sys_sbrk(&mut self) -> Result<usize, ()> {
        let n = self.argint(0)?;
        let sp = self.proc().trap_frame().sp as usize;
        let kmem = self.kernel().kmem();
        self.proc_mut().memory_mut().resize(n, sp, kmem)
    }

    /// Pause for n clock ticks.
    /// Returns Ok(0) on success, Err(()) if the process is killed.
    pub fn sys_sleep(&mut self) -> Result<usize, ()> {
        let n = self.argint(0)?;
        if n < 0 {
            return Err(());
        }
        let mut ticks = self.kernel().ticks().lock();
        let ticks0 = *ticks;
        while ticks.wrapping_sub(ticks0) < n as u32 {
            if self.proc().killed() {
                return Err(());
            }
            ticks.sleep(self);
        }
        Ok(0)
    }

    /// Terminate the process with the given pid.
    /// Returns Ok(0) on success, Err(()) on error.
    pub fn sys_kill(&self) -> Result<usize, ()> {
        let pid = self.argint(0)?;
        self.kernel().procs().kill(pid)?;
        Ok(0)
    }

    /// Return how many clock tick interrupts have occurred since start.
    pub fn sys_uptime(&self) -> Result<usize, ()> {
        Ok(*self.kernel().ticks().lock() as usize)
    }

    /// Shut down the machine with the given status. No return.
    pub fn sys_poweroff(&self) -> Result<usize, ()> {
        let status = self.argint(0)?;
        self.kernel().halt(status);
        // Give the hart back; the scheduler loops notice the halt and wind
        // down, and this thread is never dispatched again.
        loop {
            self.yield_cpu();
        }
    }
}
