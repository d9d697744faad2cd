//! Shared helpers for the hosted-machine tests.
//!
//! User programs run on process threads, where a failed assertion would
//! take the whole test binary down. They only record what they see into a
//! [`Log`]; the test thread polls it with `Machine::wait_for` and asserts.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mpkernel::hosted::{Machine, MachineConfig, UserMode};

pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Observations shared between user programs and the test thread.
pub struct Log<T>(Arc<Mutex<T>>);

impl<T> Clone for Log<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Default> Log<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(T::default())))
    }
}

impl<T> Log<T> {
    pub fn get(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap()
    }
}

impl<T: Clone> Log<T> {
    pub fn snapshot(&self) -> T {
        self.get().clone()
    }
}

/// Send warnings and errors to stderr; cargo shows them for failing tests.
pub fn init_logging() {
    klog::set_max_level(klog::Level::Warn);
    klog::set_sink(|text| eprint!("{}", text));
}

pub fn boot<F>(config: MachineConfig, init: F) -> Machine
where
    F: Fn(&mut UserMode) + Send + Sync + 'static,
{
    init_logging();
    Machine::boot(config, init).unwrap()
}

pub fn machine(config: MachineConfig) -> Machine {
    init_logging();
    Machine::new(config).unwrap()
}

/// Slot of the process running `user`.
pub fn slot_of(user: &UserMode) -> Option<usize> {
    user.kernel().current().map(|handle| handle.slot)
}
