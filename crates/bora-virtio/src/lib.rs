//! Legacy virtio-pci device models.
//!
//! The crate is split the way the hardware is: [`memory`] is the guest
//! physical address space, [`queue`] the split virtqueues living in it,
//! [`pci`] the legacy register window and interrupt plumbing, and
//! [`devices`] the device-specific logic on top. The embedding VMM supplies
//! guest memory, an interrupt sink, and an event loop; everything else lives
//! here.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub mod devices;
pub mod mac;
pub mod memory;
pub mod pci;
pub mod queue;

/// Take a mutex, riding through poisoning: device state must stay reachable
/// even after a panicking thread died holding a lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
