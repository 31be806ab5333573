//! The kernel object and the emulated machine around it.
//!
//! A `Kernel` owns everything created at boot and never torn down while the
//! machine lives: the page allocator and its arena, the process table, the
//! per-hart state, the tick counter, the console buffer, and the storage
//! interface. It is reference-counted so the hart, timer and per-process
//! kernel threads can all hold on to it; tests run isolated machines in
//! parallel.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::cpu::{self, Cpus};
use crate::fs::Storage;
use crate::kalloc::Kmem;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::DEFAULT_MEMPAGES;
use crate::proc::Procs;

pub struct KernelConfig {
    /// Harts to run (1..=NCPU).
    pub ncpu: usize,

    /// Physical memory, in pages.
    pub mem_pages: usize,

    /// Timer interrupt period; None runs without a timer (no preemption,
    /// no ticks).
    pub tick_interval: Option<Duration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ncpu: 2,
            mem_pages: DEFAULT_MEMPAGES,
            tick_interval: Some(Duration::from_millis(1)),
        }
    }
}

pub struct Kernel {
    kmem: Spinlock<Kmem>,

    procs: Procs,

    cpus: Cpus,

    ticks: Sleepablelock<u32>,

    /// Everything user processes have written to the console.
    console: Spinlock<Vec<u8>>,

    storage: Box<dyn Storage>,

    halted: AtomicBool,
    halt_status: AtomicI32,
    halt_latch: Mutex<bool>,
    halt_cv: Condvar,

    weak_self: Weak<Kernel>,
}

impl Kernel {
    /// Create a kernel and bind the calling thread as hart 0 of it.
    pub fn new(config: &KernelConfig, storage: Box<dyn Storage>) -> Arc<Kernel> {
        let kernel = Arc::new_cyclic(|weak| Kernel {
            kmem: Spinlock::new("KMEM", Kmem::new(config.mem_pages)),
            procs: Procs::new(),
            cpus: Cpus::new(config.ncpu),
            ticks: Sleepablelock::new("time", 0),
            console: Spinlock::new("cons", Vec::new()),
            storage,
            halted: AtomicBool::new(false),
            halt_status: AtomicI32::new(0),
            halt_latch: Mutex::new(false),
            halt_cv: Condvar::new(),
            weak_self: weak.clone(),
        });
        kernel.cpus.bind(0);
        kernel
    }

    pub(crate) fn shared(&self) -> Arc<Kernel> {
        self.weak_self.upgrade().expect("kernel gone")
    }

    pub fn kmem(&self) -> &Spinlock<Kmem> {
        &self.kmem
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn cpus(&self) -> &Cpus {
        &self.cpus
    }

    pub fn ticks(&self) -> &Sleepablelock<u32> {
        &self.ticks
    }

    pub fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    /// The process table slot running on the current hart, if any.
    pub fn current_proc_slot(&self) -> Option<usize> {
        cpu::push_off();
        // SAFETY: interrupts are off; the hart's Cpu is ours.
        let slot = unsafe { (*self.cpus.current()).get_proc() };
        cpu::pop_off();
        slot
    }

    /// The timer interrupt: bump the tick counter and wake its sleepers.
    /// Called on hart 0 only.
    pub fn clockintr(&self) {
        let mut ticks = self.ticks.lock();
        *ticks = ticks.wrapping_add(1);
        ticks.wakeup(self);
    }

    /// Service a pending timer interrupt from the scheduler idle path.
    pub fn poll_tick(&self) {
        if self.cpus.take_tick(cpu::cpuid()) && cpu::cpuid() == 0 {
            self.clockintr();
        }
    }

    /// Append bytes to the console buffer.
    pub fn console_put(&self, bytes: &[u8]) {
        self.console.lock().extend_from_slice(bytes);
    }

    /// A copy of the console buffer. Call from a bound thread only (the
    /// boot thread after `run`, in practice).
    pub fn console_bytes(&self) -> Vec<u8> {
        self.console.lock().clone()
    }

    pub fn free_pages(&self) -> usize {
        self.kmem.lock().free_pages()
    }

    /// Power the machine off with the given status. The scheduler loops and
    /// the timer wind down; `Machine::run` observes the status.
    pub fn halt(&self, status: i32) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            self.halt_status.store(status, Ordering::Release);
            let mut halted = self.halt_latch.lock().unwrap();
            *halted = true;
            self.halt_cv.notify_all();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn wait_halt(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut halted = self.halt_latch.lock().unwrap();
        while !*halted {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .halt_cv
                .wait_timeout(halted, deadline - now)
                .unwrap();
            halted = guard;
        }
        Some(self.halt_status.load(Ordering::Acquire))
    }
}

/// A booted kernel plus its hart and timer threads.
pub struct Machine {
    kernel: Arc<Kernel>,
    cores: Vec<thread::JoinHandle<()>>,
    timer: Option<thread::JoinHandle<()>>,
}

impl Machine {
    /// Boot: build the kernel, install the first user process (which execs
    /// "/init" from the given storage), and start every hart plus the timer.
    pub fn boot(config: KernelConfig, storage: Box<dyn Storage>) -> Machine {
        let kernel = Kernel::new(&config, storage);
        log::info!("kestrel kernel is booting");

        kernel.procs().user_proc_init(&kernel);

        let mut cores = Vec::new();
        for hart in 0..config.ncpu {
            let kernel = Arc::clone(&kernel);
            cores.push(
                thread::Builder::new()
                    .name(format!("hart-{}", hart))
                    .spawn(move || {
                        kernel.cpus().bind(hart);
                        log::info!("hart {} starting", hart);
                        kernel.procs().scheduler(&kernel);
                    })
                    .expect("Machine::boot: spawn hart"),
            );
        }

        let timer = config.tick_interval.map(|interval| {
            let kernel = Arc::clone(&kernel);
            thread::Builder::new()
                .name("timer".to_string())
                .spawn(move || loop {
                    thread::sleep(interval);
                    if kernel.is_halted() {
                        break;
                    }
                    kernel.cpus().raise_tick();
                })
                .expect("Machine::boot: spawn timer")
        });

        Machine {
            kernel,
            cores,
            timer,
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Run until a process powers the machine off; returns the status.
    /// Panics (with a process dump) if the machine wedges.
    pub fn run(&mut self) -> i32 {
        let status = match self.kernel.wait_halt(Duration::from_secs(60)) {
            Some(status) => status,
            None => {
                self.kernel.procs().dump();
                panic!("machine hung");
            }
        };
        for core in self.cores.drain(..) {
            core.join().expect("hart panicked");
        }
        if let Some(timer) = self.timer.take() {
            timer.join().expect("timer panicked");
        }
        status
    }

    /// The console output so far. Meaningful once `run` has returned.
    pub fn console(&self) -> Vec<u8> {
        self.kernel.console_bytes()
    }
}
