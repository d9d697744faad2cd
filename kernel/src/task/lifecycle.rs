// =============================================================================
// mpkernel — Process Lifecycle
// =============================================================================
//
// Creation, duplication, exit, reaping and kill requests.
//
//   allocate            Unused -> Embryo, kernel stack and trapframe
//   spawn_init          the ancestor: one page holding the boot image
//   duplicate           fork: eager deep copy of the caller
//   terminate           exit: release files, hand children to init, Zombie
//   await_child         wait: reap one zombie child, Zombie -> Unused
//   mark_for_termination  kill: set the flag, wake the target if asleep
//
// Termination is cooperative. A kill only sets a flag; the target acts on it
// at its next checkpoint (trap return, or the re-check inside a killable
// wait), never with the table lock held or halfway through editing its
// address space.
//
// =============================================================================

use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::arch;
use crate::config::{KSTACK_SIZE, NOFILE};
use crate::error::KernelError;
use crate::fs::FileRef;
use crate::kernel::{Kernel, NO_INIT};
use crate::memory::address::PAGE_SIZE;
use crate::memory::pmm;
use crate::memory::space::AddressSpace;

use super::process::{Channel, EntryAction, Pid, ProcPrivate, ProcState, ProcessHandle};
use super::table::TableGuard;
use super::trapframe::TrapFrame;

impl Kernel {
    /// Claim an unused slot and give it a kernel stack.
    ///
    /// The new process is an `Embryo` whose first run will start in the
    /// fork-return trampoline. Its trapframe is zeroed.
    pub fn allocate(&self) -> Result<ProcessHandle, KernelError> {
        let (idx, pid) = {
            let mut table = self.procs.lock.lock();
            self.procs.claim(&mut table).ok_or(KernelError::NoFreeSlot)?
        };
        let slot = &self.procs.slots[idx];

        let Some(kstack) = pmm::allocate_zeroed(self.frames) else {
            let table = self.procs.lock.lock();
            slot.release(&table);
            return Err(KernelError::OutOfMemory);
        };

        // SAFETY: an Embryo belongs to the code that claimed it.
        let p = unsafe { slot.private() };
        let top = kstack.start().to_virt() + KSTACK_SIZE;
        let tf = (top - mem::size_of::<TrapFrame>() as u64).as_mut_ptr::<TrapFrame>();
        // SAFETY: the frame is ours and large enough for the trapframe.
        unsafe { tf.write(TrapFrame::default()) };
        p.kstack = Some(kstack);
        p.trapframe = NonNull::new(tf);
        p.context = arch::Context::new();
        p.entry = EntryAction::ForkReturn;

        klog::trace!("proc: allocated pid {} in slot {}", pid, idx);
        Ok(ProcessHandle { slot: idx, pid })
    }

    /// Create the ancestor of every other process from `image`, a program
    /// smaller than one page that starts executing at address zero.
    ///
    /// # Panics
    /// If called twice.
    pub fn spawn_init(&'static self, image: &[u8]) -> Result<ProcessHandle, KernelError> {
        if self.init.load(Ordering::Acquire) != NO_INIT {
            panic!("spawn_init: ancestor already exists");
        }
        let handle = self.allocate()?;
        let slot = &self.procs.slots[handle.slot];

        let space = AddressSpace::new(&self.kmap, self.frames).and_then(|mut space| {
            space.init_image(image)?;
            Ok(space)
        });
        let space = match space {
            Ok(space) => space,
            Err(err) => {
                self.discard(handle.slot);
                return Err(err.into());
            }
        };

        // SAFETY: still an Embryo, ours alone.
        let p = unsafe { slot.private() };
        p.space = Some(space);
        p.size = PAGE_SIZE;
        if let Some(tf) = p.trapframe {
            // SAFETY: the trapframe lives in the embryo's kernel stack.
            unsafe { tf.as_ptr().write(TrapFrame::user_entry(0, PAGE_SIZE)) };
        }
        p.cwd = Some(self.fs.root_dir());
        slot.set_name("initcode");

        self.init.store(handle.slot, Ordering::Release);
        let table = self.procs.lock.lock();
        slot.set_state(&table, ProcState::Runnable);
        drop(table);

        klog::info!("proc: init is pid {}", handle.pid);
        Ok(handle)
    }

    /// Fork the calling process.
    ///
    /// The child gets a deep copy of the caller's memory, the same open
    /// files and working directory, and the caller's registers with the
    /// return value forced to zero. On failure the caller is unaffected.
    pub fn duplicate(&'static self) -> Result<Pid, KernelError> {
        let parent_idx = self.this_proc();
        let parent = &self.procs.slots[parent_idx];
        let child = self.allocate()?;
        let child_slot = &self.procs.slots[child.slot];

        // SAFETY: the caller is the running parent; the child is an Embryo
        // this call created. Distinct slots, so the borrows do not alias.
        let (pp, cp) = unsafe { (parent.private(), child_slot.private()) };

        let copied = match pp.space.as_ref() {
            Some(space) => space.duplicate(pp.size),
            None => panic!("fork: pid {} has no address space", parent.pid()),
        };
        match copied {
            Ok(space) => cp.space = Some(space),
            Err(err) => {
                klog::debug!("fork: pid {} failed: {}", parent.pid(), err);
                self.discard(child.slot);
                return Err(err.into());
            }
        }
        cp.size = pp.size;

        if let (Some(ptf), Some(ctf)) = (pp.trapframe, cp.trapframe) {
            // SAFETY: both frames sit in kernel stacks owned by the two
            // processes; the parent's is not being written while we copy.
            unsafe {
                let mut regs = ptf.as_ptr().read();
                regs.rax = 0;
                ctf.as_ptr().write(regs);
            }
        }

        for (dst, src) in cp.ofile.iter_mut().zip(pp.ofile.iter()) {
            *dst = src.map(|file| self.fs.dup_file(file));
        }
        cp.cwd = pp.cwd.map(|dir| self.fs.dup_dir(dir));
        child_slot.copy_name_from(parent);

        let table = self.procs.lock.lock();
        child_slot.set_parent(&table, Some(parent_idx));
        child_slot.set_state(&table, ProcState::Runnable);
        drop(table);

        klog::debug!("fork: pid {} -> pid {}", parent.pid(), child.pid);
        Ok(child.pid)
    }

    /// Exit the calling process with `status`. Never returns; the parent
    /// collects the status through [`await_child`](Self::await_child).
    ///
    /// # Panics
    /// If the caller is the ancestor process.
    pub fn terminate(&self, status: i32) -> ! {
        let idx = self.this_proc();
        if idx == self.init.load(Ordering::Acquire) {
            panic!("init exiting");
        }
        let slot = &self.procs.slots[idx];

        // SAFETY: we are the running process.
        let p = unsafe { slot.private() };
        for file in p.ofile.iter_mut() {
            if let Some(file) = file.take() {
                self.fs.close_file(file);
            }
        }
        if let Some(dir) = p.cwd.take() {
            self.fs.release_dir(dir);
        }

        // The scheduler releases the lock once we have switched away, and
        // this frame never resumes to drop the guard.
        let table = mem::ManuallyDrop::new(self.procs.lock.lock());

        // The parent might be sleeping in await_child.
        if let Some(parent) = slot.parent() {
            self.wakeup_locked(&table, Channel::of(&self.procs.slots[parent]));
        }

        // Hand our children to init.
        let init = self.init.load(Ordering::Acquire);
        for child in self.procs.slots.iter() {
            if child.parent() == Some(idx) {
                child.set_parent(&table, Some(init));
                if child.state() == ProcState::Zombie {
                    self.wakeup_locked(&table, Channel::of(&self.procs.slots[init]));
                }
            }
        }

        slot.set_xstate(&table, status);
        slot.set_state(&table, ProcState::Zombie);
        klog::debug!("exit: pid {} status {}", slot.pid(), status);

        self.sched(&table, idx);
        panic!("zombie exit");
    }

    /// Wait for a child to exit and reap it.
    ///
    /// Returns the child's pid and exit status. Fails with `NoChildren` when
    /// the caller has none, and with `Killed` when the caller is marked for
    /// termination while no child has exited yet.
    pub fn await_child(&self) -> Result<(Pid, i32), KernelError> {
        let idx = self.this_proc();
        let me = &self.procs.slots[idx];
        let mut table = self.procs.lock.lock();
        loop {
            let mut have_kids = false;
            for (child_idx, child) in self.procs.slots.iter().enumerate() {
                if child.parent() != Some(idx) {
                    continue;
                }
                have_kids = true;
                if child.state() == ProcState::Zombie {
                    let found = (child.pid(), child.xstate());
                    self.reclaim(&table, child_idx);
                    klog::debug!("wait: pid {} reaped pid {}", me.pid(), found.0);
                    return Ok(found);
                }
            }

            if !have_kids {
                return Err(KernelError::NoChildren);
            }
            if me.killed() {
                return Err(KernelError::Killed);
            }
            table = self.sleep_locked(Channel::of(me), table);
        }
    }

    /// Ask process `pid` to terminate. A sleeping target is made runnable
    /// so it notices promptly.
    pub fn mark_for_termination(&self, pid: Pid) -> Result<(), KernelError> {
        let table = self.procs.lock.lock();
        let idx = self.procs.find(&table, pid).ok_or(KernelError::NoSuchProcess)?;
        let slot = &self.procs.slots[idx];
        slot.mark_killed();
        if slot.state() == ProcState::Sleeping {
            slot.set_state(&table, ProcState::Runnable);
        }
        Ok(())
    }

    /// Pid of the calling process.
    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|handle| handle.pid)
    }

    /// User memory size of the calling process.
    pub fn current_size(&self) -> u64 {
        let idx = self.this_proc();
        // SAFETY: we are the running process.
        unsafe { self.procs.slots[idx].private() }.size
    }

    /// Grow (positive `delta`) or shrink the calling process's memory.
    /// Returns the new size.
    pub fn grow_current(&self, delta: i64) -> Result<u64, KernelError> {
        let idx = self.this_proc();
        // SAFETY: we are the running process.
        let p = unsafe { self.procs.slots[idx].private() };
        let old = p.size;
        let new = if delta >= 0 {
            old.checked_add(delta.unsigned_abs())
        } else {
            old.checked_sub(delta.unsigned_abs())
        }
        .ok_or(KernelError::LimitExceeded)?;

        let Some(space) = p.space.as_mut() else {
            panic!("sbrk: no address space");
        };
        p.size = if new >= old {
            space.grow(old, new)?
        } else {
            let size = space.shrink(old, new);
            arch::flush_tlb();
            size
        };
        Ok(p.size)
    }

    /// Copy `src` into the calling process's memory at `va`.
    pub fn copy_out_current(&self, va: u64, src: &[u8]) -> Result<(), KernelError> {
        self.with_current_space(|space| space.copy_out(va, src))
    }

    /// Copy the calling process's memory at `va` into `dst`.
    pub fn copy_in_current(&self, va: u64, dst: &mut [u8]) -> Result<(), KernelError> {
        self.with_current_space(|space| space.copy_in(va, dst))
    }

    fn with_current_space<R>(
        &self,
        f: impl FnOnce(&AddressSpace) -> Result<R, crate::error::VmError>,
    ) -> Result<R, KernelError> {
        let idx = self.this_proc();
        // SAFETY: we are the running process.
        let p = unsafe { self.procs.slots[idx].private() };
        match p.space.as_ref() {
            Some(space) => f(space).map_err(KernelError::from),
            None => Err(KernelError::BadAddress),
        }
    }

    /// Install `file` in the lowest free descriptor of the calling process.
    /// The process takes over the caller's reference.
    pub fn attach_file(&self, file: FileRef) -> Result<usize, KernelError> {
        let idx = self.this_proc();
        // SAFETY: we are the running process.
        let p = unsafe { self.procs.slots[idx].private() };
        let fd = p
            .ofile
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoFreeSlot)?;
        debug_assert!(fd < NOFILE);
        p.ofile[fd] = Some(file);
        Ok(fd)
    }

    /// Free everything a zombie still owns and return its slot.
    fn reclaim(&self, table: &TableGuard<'_>, idx: usize) {
        let slot = &self.procs.slots[idx];
        // SAFETY: the slot is a Zombie found under the table lock; its
        // process will never run again.
        self.free_private(unsafe { slot.private() });
        slot.release(table);
    }

    /// Undo a partly built embryo.
    fn discard(&self, idx: usize) {
        let slot = &self.procs.slots[idx];
        // SAFETY: the embryo has not been published as Runnable.
        self.free_private(unsafe { slot.private() });
        let table = self.procs.lock.lock();
        slot.release(&table);
    }

    fn free_private(&self, p: &mut ProcPrivate) {
        if let Some(space) = p.space.take() {
            space.destroy(p.size);
        }
        if let Some(kstack) = p.kstack.take() {
            self.frames.free_frame(kstack);
        }
        debug_assert!(p.ofile.iter().all(Option::is_none), "reclaim: files still open");
        debug_assert!(p.cwd.is_none(), "reclaim: cwd still held");
        *p = ProcPrivate::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::on_this_thread;
    use crate::sync::{pop_off, push_off};

    fn run_here(kernel: &Kernel, slot: usize) {
        push_off();
        kernel.mycpu().set_current(Some(slot));
        pop_off();
    }

    #[test]
    #[should_panic(expected = "init exiting")]
    fn the_ancestor_may_not_exit() {
        let kernel = on_this_thread();
        let init = kernel.spawn_init(&[0x90]).unwrap();
        run_here(kernel, init.slot);
        kernel.terminate(0);
    }

    #[test]
    #[should_panic(expected = "no current process")]
    fn exiting_outside_a_process_is_fatal() {
        let kernel = on_this_thread();
        kernel.terminate(0);
    }

    #[test]
    fn a_second_slot_gets_the_next_pid() {
        let kernel = on_this_thread();
        let init = kernel.spawn_init(&[0x90]).unwrap();
        let next = kernel.allocate().unwrap();
        assert_eq!(init.pid, Pid(1));
        assert_eq!(next.pid, Pid(2));
        assert_eq!(kernel.procs.slots[next.slot].state(), ProcState::Embryo);
        kernel.discard(next.slot);
        assert_eq!(kernel.procs.slots[next.slot].state(), ProcState::Unused);
    }
}
