//! Booting a kernel on simulated cores.
//!
//! ```ignore
//! let machine = Machine::boot(MachineConfig::default(), |user| {
//!     let child = user.fork(|user| user.exit(3));
//!     assert_eq!(user.wait().map(|(_, status)| status), Some(3));
//! })?;
//! ```
//!
//! Each core is an OS thread running `enter_scheduler_loop`; processes are
//! threads that run only while they hold a core. An optional ticker thread
//! plays the timer interrupt. Everything is leaked: a kernel lives until
//! the host process exits, and a halted machine simply parks its cores.

use std::boxed::Box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

use crate::arch::{self, CpuLocal};
use crate::config::BootConfig;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::memory::pmm::FreeList;
use crate::task::process::ProcessHandle;

use super::memfs::MemFs;
use super::phys;
use super::user::{self, UserMode};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub cores: usize,
    /// Frames of RAM handed to the kernel's allocator.
    pub frames: usize,
    /// Timer period; `None` means time only moves when someone calls
    /// `Kernel::tick`.
    pub tick: Option<Duration>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cores: 2,
            frames: 1024,
            tick: None,
        }
    }
}

pub struct Machine {
    kernel: &'static Kernel,
    frames: &'static FreeList,
    fs: &'static MemFs,
    cores: Vec<&'static CpuLocal>,
    config: MachineConfig,
    stop: Arc<AtomicBool>,
    started: bool,
}

impl Machine {
    /// Build a kernel with the configured cores and memory. Nothing runs
    /// until [`start`](Self::start).
    pub fn new(config: MachineConfig) -> Result<Self, KernelError> {
        let region = phys::reserve(config.frames);
        // SAFETY: the region was just reserved for us alone.
        let frames: &'static FreeList =
            Box::leak(Box::new(unsafe { FreeList::new(region.start, region.end) }));
        let fs: &'static MemFs = Box::leak(Box::new(MemFs::new()));
        let cores: Vec<&'static CpuLocal> = (0..config.cores).map(|_| arch::new_core()).collect();

        let boot = BootConfig {
            cpu_ids: cores.iter().map(|core| core.hw_id).collect(),
            layout: phys::layout(),
        };
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(&boot, frames, fs)?));

        Ok(Self {
            kernel,
            frames,
            fs,
            cores,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// Spawn `init` as the ancestor process and start every core.
    pub fn start<F>(&mut self, init: F) -> Result<ProcessHandle, KernelError>
    where
        F: Fn(&mut UserMode) + Send + Sync + 'static,
    {
        assert!(!self.started, "machine already started");
        let entry = user::register(Arc::new(init));
        let handle = self.kernel.spawn_init(&user::program_image(entry))?;
        self.started = true;

        for (i, &core) in self.cores.iter().enumerate() {
            let kernel = self.kernel;
            let spawned = thread::Builder::new()
                .name(format!("cpu{}", i))
                .spawn(move || run_core(kernel, core));
            if let Err(err) = spawned {
                panic!("machine: cannot start core {}: {}", i, err);
            }
        }

        if let Some(period) = self.config.tick {
            let kernel = self.kernel;
            let stop = Arc::clone(&self.stop);
            let spawned = thread::Builder::new().name("timer".into()).spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    kernel.tick();
                }
            });
            if let Err(err) = spawned {
                panic!("machine: cannot start the timer: {}", err);
            }
        }

        klog::debug!("machine: {} cores up, init is pid {}", self.cores.len(), handle.pid);
        Ok(handle)
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub fn boot<F>(config: MachineConfig, init: F) -> Result<Self, KernelError>
    where
        F: Fn(&mut UserMode) + Send + Sync + 'static,
    {
        let mut machine = Self::new(config)?;
        machine.start(init)?;
        Ok(machine)
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn frames(&self) -> &'static FreeList {
        self.frames
    }

    pub fn fs(&self) -> &'static MemFs {
        self.fs
    }

    /// Poll `done` until it holds or `timeout` passes. Whether it held.
    pub fn wait_for(&self, timeout: Duration, mut done: impl FnMut(&Kernel) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self.kernel) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the timer and park every core the next time it idles.
    pub fn halt(&self) {
        self.stop.store(true, Ordering::Relaxed);
        for core in &self.cores {
            arch::halt_core(core);
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_core(kernel: &'static Kernel, core: &'static CpuLocal) {
    arch::bind_core(core);
    kernel.enter_scheduler_loop()
}
