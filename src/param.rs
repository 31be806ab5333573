/// maximum number of processes
pub const NPROC: usize = 64;

/// maximum number of harts
pub const NCPU: usize = 8;

/// open files per process
pub const NOFILE: usize = 16;

/// max exec arguments
pub const MAXARG: usize = 32;

/// maximum file path name
pub const MAXPATH: usize = 128;

/// size of the process name (debugging)
pub const MAXPROCNAME: usize = 16;

/// default physical memory, in 4096-byte pages
pub const DEFAULT_MEMPAGES: usize = 2048;
