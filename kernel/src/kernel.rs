// =============================================================================
// mpkernel — The Kernel Value
// =============================================================================
//
// `Kernel` owns everything the process core shares between cores: the
// process table, one scheduler record per core, the kernel-half template,
// and the tick counter. Collaborators (frame allocator, file layer) are
// borrowed for the life of the system.
//
// BOOT SEQUENCE (done by the embedding kernel or the hosted machine):
//   1. build a frame allocator and a file layer
//   2. `Kernel::new(&config, frames, fs)`, then leak it to `&'static`
//   3. `kernel.spawn_init(image)`
//   4. on every core listed in the config: `kernel.enter_scheduler_loop()`
//
// =============================================================================

use alloc::vec::Vec;
use core::sync::atomic::AtomicUsize;

use crate::config::{BootConfig, NCPU};
use crate::error::KernelError;
use crate::fs::Filesystem;
use crate::memory::kmap::KernelMap;
use crate::memory::pmm::FrameAllocator;
use crate::memory::vmm::MapError;
use crate::sync::SpinLock;
use crate::task::cpu::Cpu;
use crate::task::table::ProcTable;

/// `init` holds no slot yet.
pub(crate) const NO_INIT: usize = usize::MAX;

pub struct Kernel {
    pub(crate) procs: ProcTable,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) kmap: KernelMap,
    pub(crate) frames: &'static dyn FrameAllocator,
    pub(crate) fs: &'static dyn Filesystem,
    pub(crate) ticks: SpinLock<u64>,
    /// Slot of the ancestor process.
    pub(crate) init: AtomicUsize,
}

impl Kernel {
    /// Build the kernel-half template and an empty process table.
    ///
    /// # Panics
    /// If the config names no cores or more than `NCPU`, or if two kernel
    /// regions overlap.
    pub fn new(
        config: &BootConfig,
        frames: &'static dyn FrameAllocator,
        fs: &'static dyn Filesystem,
    ) -> Result<Self, KernelError> {
        let ncpu = config.cpu_ids.len();
        if ncpu == 0 || ncpu > NCPU {
            panic!("boot: {} cores configured, 1..={} supported", ncpu, NCPU);
        }

        let kmap = match KernelMap::build(&config.layout.regions, frames) {
            Ok(kmap) => kmap,
            Err(MapError::OutOfMemory) => return Err(KernelError::OutOfMemory),
            Err(err) => panic!("boot: bad kernel layout ({:?})", err),
        };

        klog::info!(
            "boot: {} cores, {} kernel regions, template root {:?}",
            ncpu,
            config.layout.regions.len(),
            kmap.root()
        );

        Ok(Self {
            procs: ProcTable::new(),
            cpus: config.cpu_ids.iter().map(|&id| Cpu::new(id)).collect(),
            kmap,
            frames,
            fs,
            ticks: SpinLock::new(0),
            init: AtomicUsize::new(NO_INIT),
        })
    }

    /// The shared kernel-half template.
    pub fn kernel_map(&self) -> &KernelMap {
        &self.kmap
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }
}

/// A kernel whose only core is the calling test thread's, with nothing
/// running yet. Enough for code paths that fail before a context switch.
#[cfg(test)]
pub(crate) fn on_this_thread() -> &'static Kernel {
    use alloc::boxed::Box;

    use crate::hosted::{memfs::MemFs, phys};
    use crate::memory::pmm::FreeList;

    let region = phys::reserve(64);
    // SAFETY: the region was just reserved for this kernel alone.
    let frames: &'static FreeList =
        Box::leak(Box::new(unsafe { FreeList::new(region.start, region.end) }));
    let fs: &'static MemFs = Box::leak(Box::new(MemFs::new()));
    let boot = BootConfig {
        cpu_ids: alloc::vec![crate::arch::this_cpu().hw_id],
        layout: phys::layout(),
    };
    match Kernel::new(&boot, frames, fs) {
        Ok(kernel) => Box::leak(Box::new(kernel)),
        Err(err) => panic!("test kernel: {:?}", err),
    }
}
