// =============================================================================
// mpkernel — Kernel Panic Handler
// =============================================================================
//
// A panic means a kernel invariant broke: a lock taken twice, the scheduler
// entered with the wrong locks, the ancestor process exiting, a page mapped
// twice. Shared structures may be half updated, so nothing is retried.
//
// WHAT WE DO:
//   1. Log the message and location through klog at error level
//   2. Halt this core with interrupts off
//
// Other cores keep running until they trip over the same state or are
// stopped by the embedding kernel.
//
// =============================================================================

use core::panic::PanicInfo;

use crate::arch;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();
    let core = arch::this_cpu().hw_id;
    match info.location() {
        Some(location) => klog::error!(
            "KERNEL PANIC on core {} at {}:{}: {}",
            core,
            location.file(),
            location.line(),
            info.message()
        ),
        None => klog::error!("KERNEL PANIC on core {}: {}", core, info.message()),
    }
    arch::halt_forever()
}
