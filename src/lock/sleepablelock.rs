//! Sleepable locks
use super::{Lock, RawLock, RawSpinlock};
use crate::kernel::Kernel;
use crate::proc::{KernelCtx, WaitChannel};

/// Mutual exclusion spin locks that can sleep.
pub struct RawSleepablelock {
    lock: RawSpinlock,
    /// WaitChannel for sleepers on this lock's condition.
    waitchannel: WaitChannel,
}

/// Similar to `Spinlock`, but guards of this lock can sleep.
pub type Sleepablelock<T> = Lock<RawSleepablelock, T>;
pub type SleepablelockGuard<'s, T> = super::Guard<'s, RawSleepablelock, T>;

impl RawSleepablelock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepablelock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Sleepablelock<T> {
    /// Returns a new `Sleepablelock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::from_raw(RawSleepablelock::new(name), data)
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep on its wait channel.
    /// The lock is held again when this returns; callers re-check their
    /// condition in a loop.
    pub fn sleep(&mut self, ctx: &KernelCtx<'_>) {
        let raw = self.raw_lock();
        raw.waitchannel.sleep(self, ctx);
    }

    /// Wake up all processes sleeping on this lock's wait channel.
    pub fn wakeup(&self, kernel: &Kernel) {
        self.raw_lock().waitchannel.wakeup(kernel);
    }
}
