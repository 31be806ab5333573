//! Shared plumbing for the machine tests: build a tiny file system with an
//! /init image and boot a machine around it.

use kestrel::fs::MemFs;
use kestrel::image::single_segment_image;
use kestrel::kernel::{KernelConfig, Machine};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Boot a machine whose /init is the given assembled program; `extra` holds
/// additional (path, image) pairs for exec.
pub fn boot_with_init(
    code: Vec<u8>,
    config: KernelConfig,
    extra: Vec<(&str, Vec<u8>)>,
) -> Machine {
    init_logging();
    let mut fs = MemFs::new();
    fs.add("/init", single_segment_image(&code));
    for (path, image) in extra {
        fs.add(path, image);
    }
    Machine::boot(config, Box::new(fs))
}
