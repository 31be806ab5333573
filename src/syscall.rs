//! System call numbers, argument marshaling, and the dispatch table.
//!
//! Arguments arrive in the fixed argument registers a0..a5, the call number
//! in a7; the result goes back in a0, with the all-ones pattern (-1) for any
//! failure. User pointers and strings are only ever touched through the
//! bounded copy routines of the page-table manager.

use core::str;

use crate::addr::UVAddr;
use crate::proc::KernelCtx;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_WRITE: usize = 16;
pub const SYS_CLOSE: usize = 21;
pub const SYS_POWEROFF: usize = 22;

/// Dispatch the system call the current process requested and write the
/// result into its a0.
pub fn syscall(ctx: &mut KernelCtx<'_>) {
    let num = ctx.proc().trap_frame().a7 as usize;
    let ret = dispatch(ctx, num);
    ctx.proc_mut().trap_frame_mut().a0 = match ret {
        Ok(value) => value as u64,
        Err(()) => u64::MAX,
    };
}

fn dispatch(ctx: &mut KernelCtx<'_>, num: usize) -> Result<usize, ()> {
    match num {
        SYS_FORK => ctx.sys_fork(),
        SYS_EXIT => ctx.sys_exit(),
        SYS_WAIT => ctx.sys_wait(),
        SYS_PIPE => ctx.sys_pipe(),
        SYS_READ => ctx.sys_read(),
        SYS_KILL => ctx.sys_kill(),
        SYS_EXEC => ctx.sys_exec(),
        SYS_DUP => ctx.sys_dup(),
        SYS_GETPID => ctx.sys_getpid(),
        SYS_SBRK => ctx.sys_sbrk(),
        SYS_SLEEP => ctx.sys_sleep(),
        SYS_UPTIME => ctx.sys_uptime(),
        SYS_WRITE => ctx.sys_write(),
        SYS_CLOSE => ctx.sys_close(),
        SYS_POWEROFF => ctx.sys_poweroff(),
        _ => {
            let name = ctx.proc().deref_data().name;
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            log::warn!(
                "{} {}: unknown sys call {}",
                ctx.proc().pid(),
                str::from_utf8(&name[..len]).unwrap_or("???"),
                num
            );
            Err(())
        }
    }
}

impl KernelCtx<'_> {
    fn argraw(&self, n: usize) -> usize {
        let tf = self.proc().trap_frame();
        (match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("argraw"),
        }) as usize
    }

    /// Fetch the nth 32-bit system call argument.
    pub fn argint(&self, n: usize) -> Result<i32, ()> {
        Ok(self.argraw(n) as i32)
    }

    /// Retrieve an argument as a user pointer. Doesn't check for legality:
    /// copyin/copyout do that.
    pub fn argaddr(&self, n: usize) -> Result<UVAddr, ()> {
        Ok(UVAddr::new(self.argraw(n)))
    }

    /// Fetch the nth argument as a null-terminated string, copied into
    /// `buf`. Returns the string.
    pub fn argstr<'a>(&mut self, n: usize, buf: &'a mut [u8]) -> Result<&'a str, ()> {
        let addr = self.argaddr(n)?;
        self.fetchstr(addr, buf)
    }

    /// Fetch the null-terminated string at addr from the current process.
    pub fn fetchstr<'a>(&mut self, addr: UVAddr, buf: &'a mut [u8]) -> Result<&'a str, ()> {
        let kmem = self.kernel().kmem();
        let len = self.proc_mut().memory_mut().copy_in_str(buf, addr, kmem)?;
        str::from_utf8(&buf[..len]).map_err(|_| ())
    }

    /// Fetch the usize at addr from the current process.
    pub fn fetchaddr(&mut self, addr: UVAddr) -> Result<usize, ()> {
        let sz = core::mem::size_of::<usize>();
        if addr.into_usize().checked_add(sz).ok_or(())? > self.proc().memory().size() {
            return Err(());
        }
        let mut bytes = [0u8; 8];
        let kmem = self.kernel().kmem();
        self.proc_mut().memory_mut().copy_in(&mut bytes, addr, kmem)?;
        Ok(usize::from_le_bytes(bytes))
    }
}
