// =============================================================================
// mpkernel — Per-Core Scheduler
// =============================================================================
//
// Every core runs `enter_scheduler_loop` forever. The loop never occupies a
// process slot; it scans the table in slot order and runs each `Runnable`
// process it finds.
//
// LOCK HAND-OFF:
//   The table lock is held across every switch, in both directions.
//
//     scheduler                          process
//     ---------                          -------
//     lock table
//     mark Running, switch ───────────▶  (resumes inside sched, or starts
//                                         in fork_return)
//                                        ... releases the lock, runs,
//                                        locks the table again, records a
//                                        new state ...
//     (switch returns) ◀──────────────── sched: switch
//     clear current, keep scanning
//
//   So the lock is acquired in one stack frame and released in another. The
//   spin lock tolerates this because its bookkeeping is per core and every
//   hand-off stays on one core. `sched` checks the contract on the way in:
//   this core holds the table lock and nothing else, interrupts are off,
//   and the caller has already moved itself out of `Running`.
//
// FIRST RUN:
//   A new process has no saved context to resume. Its `EntryAction` is
//   `ForkReturn`, so the scheduler starts `fork_return` on the process's
//   kernel stack instead. `fork_return` drops the lock the scheduler handed
//   over and returns to user mode through the process's trapframe.
//
// =============================================================================

use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::Ordering;

use crate::arch;
use crate::kernel::Kernel;
use crate::memory::address::VirtAddr;

use super::cpu::Cpu;
use super::process::{EntryAction, Pid, ProcState};
use super::table::TableGuard;
use super::trapframe::TrapFrame;

impl Kernel {
    /// Run processes on this core forever.
    ///
    /// Called once per core after its bring-up, with interrupts off.
    pub fn enter_scheduler_loop(&'static self) -> ! {
        let cpu = self.mycpu();
        cpu.set_current(None);
        klog::debug!("cpu {}: scheduler running", cpu.hw_id);
        loop {
            // Let device completions and ticks in while we look for work.
            arch::enable_interrupts();

            let table = self.procs.lock.lock();
            let mut ran = false;
            for idx in 0..self.procs.slots.len() {
                if self.procs.slots[idx].state() != ProcState::Runnable {
                    continue;
                }
                self.run(cpu, &table, idx);
                ran = true;
            }
            drop(table);

            if !ran {
                arch::idle();
            }
        }
    }

    /// Switch to the runnable process in `idx` and return once it gives the
    /// core back.
    fn run(&'static self, cpu: &Cpu, table: &TableGuard<'_>, idx: usize) {
        let slot = &self.procs.slots[idx];
        let private = slot.private_ptr();

        // SAFETY: the process is Runnable and we hold the table lock, so it
        // is not executing anywhere and nobody else will pick it.
        let (tf, entry) = unsafe {
            let p = &mut *private;
            let Some(tf) = p.trapframe else {
                panic!("scheduler: pid {} has no trapframe", slot.pid());
            };
            let Some(space) = p.space.as_ref() else {
                panic!("scheduler: pid {} has no address space", slot.pid());
            };
            cpu.set_current(Some(idx));
            // Traps from user mode land just above the trapframe.
            space.activate(VirtAddr::new(tf.as_ptr() as u64) + mem::size_of::<TrapFrame>() as u64);
            (tf, mem::replace(&mut p.entry, EntryAction::Resume))
        };
        slot.set_state(table, ProcState::Running);

        let sched_ctx = cpu.scheduler.get();
        // SAFETY: both contexts stay valid across the switch; the process
        // context belongs to a slot that cannot be reclaimed while we hold
        // the table lock, and the process hands the lock back before we
        // resume here.
        unsafe {
            match entry {
                EntryAction::ForkReturn => arch::switch_to_fresh(
                    sched_ctx,
                    VirtAddr::new(tf.as_ptr() as u64),
                    fork_return,
                    self as *const Kernel as usize,
                ),
                EntryAction::Resume => arch::switch(sched_ctx, &raw const (*private).context),
            }
        }

        debug_assert!(
            self.procs.lock.holding(),
            "scheduler: process returned without the table lock"
        );
        arch::activate_address_space(self.kmap.root());
        cpu.set_current(None);
    }

    /// Give the core back to this core's scheduler loop.
    ///
    /// The caller holds the table lock (and only it) and has already moved
    /// the process out of `Running`. Returns, still holding the lock, when
    /// some scheduler picks the process again.
    pub(crate) fn sched(&self, table: &TableGuard<'_>, idx: usize) {
        let _ = table;
        if !self.procs.lock.holding() {
            panic!("sched: table lock not held");
        }
        let core = arch::this_cpu();
        if core.ncli.load(Ordering::Relaxed) != 1 {
            panic!("sched locks");
        }
        let slot = &self.procs.slots[idx];
        if slot.state() == ProcState::Running {
            panic!("sched running");
        }
        if arch::interrupts_enabled() {
            panic!("sched interruptible");
        }

        // Whether interrupts were on belongs to this kernel thread, not to
        // the core it happens to be on.
        let intena = core.intena.load(Ordering::Relaxed);
        let sched_ctx = self.mycpu().scheduler.get();
        // SAFETY: we are the running process, so our context is ours to
        // save into; the scheduler context was saved when it switched to us.
        unsafe { arch::switch(&raw mut (*slot.private_ptr()).context, sched_ctx) };
        // Possibly a different core from here on.
        arch::this_cpu().intena.store(intena, Ordering::Relaxed);
    }

    /// Give up the core for one scheduling round.
    pub fn yield_current(&self) {
        let idx = self.this_proc();
        let table = self.procs.lock.lock();
        let slot = &self.procs.slots[idx];
        if slot.state() != ProcState::Running {
            panic!("yield: pid {} is {}", slot.pid(), slot.state().as_str());
        }
        slot.set_state(&table, ProcState::Runnable);
        self.sched(&table, idx);
        drop(table);
    }

    /// Pids in `Running` state and pids installed as some core's current
    /// process, both read under the table lock. Equal as sets whenever the
    /// lock is free.
    pub fn assignments(&self) -> (Vec<Pid>, Vec<Pid>) {
        let table = self.procs.lock.lock();
        let mut running: Vec<Pid> = self
            .procs
            .slots
            .iter()
            .filter(|s| s.state() == ProcState::Running)
            .map(|s| s.pid())
            .collect();
        let mut current: Vec<Pid> = self
            .cpus
            .iter()
            .filter_map(Cpu::current_slot)
            .map(|idx| self.procs.slots[idx].pid())
            .collect();
        drop(table);
        running.sort();
        current.sort();
        (running, current)
    }
}

/// First code a new process runs, on its own kernel stack.
///
/// `kernel` is the address of the `&'static Kernel` that scheduled it.
extern "C-unwind" fn fork_return(kernel: usize) -> ! {
    // SAFETY: the scheduler passes the address of a kernel that lives for
    // the rest of the program.
    let kernel: &'static Kernel = unsafe { &*(kernel as *const Kernel) };
    // SAFETY: the scheduler on this core locked the table before switching
    // here, and its guard never releases on our behalf.
    unsafe { kernel.procs.lock.force_unlock() };

    let idx = kernel.this_proc();
    // SAFETY: we are the running process.
    let tf = match unsafe { kernel.procs.slots[idx].private() }.trapframe {
        Some(tf) => tf,
        None => panic!("fork_return: no trapframe"),
    };
    arch::enter_user(kernel, tf)
}
