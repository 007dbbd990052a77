//! # Synchronization primitives for the memory subsystem
//!
//! Two primitives that `spin` does not provide:
//!
//! - [`HardwareExclusive`], the scoped equivalent of an interrupt-disabled
//!   critical section, and
//! - [`RecursiveSpinlock`], a spinlock the owning CPU may re-enter.
//!
//! Longer-held structures use the ordinary `spin::Mutex`/`spin::RwLock`.

use core::{
    cell::UnsafeCell,
    ops::Deref,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::cpu_set::{LogicalCpuId, MAX_CPU_COUNT};

/// Per-CPU interrupt-disable nesting depth. Models the hardware interrupt
/// flag; on real hardware this would be `cli`/`sti` (or DAIF masking).
static INT_DEPTH: [AtomicUsize; MAX_CPU_COUNT as usize] =
    [const { AtomicUsize::new(0) }; MAX_CPU_COUNT as usize];

/// A scoped hardware-exclusive section: interrupts are masked on the given
/// CPU for the lifetime of the guard.
///
/// Contract: no blocking calls inside the section, and the section must be of
/// bounded duration. This is the primitive for short direct table edits
/// (quickmap) and address-space switches; it is *not* a mutual-exclusion lock
/// between CPUs.
///
/// Sections nest; interrupts are re-enabled when the outermost guard drops.
#[must_use = "interrupts are re-enabled when the guard is dropped"]
pub struct HardwareExclusive {
    cpu: LogicalCpuId,
}

impl HardwareExclusive {
    /// Masks interrupts on `cpu` until the guard is dropped.
    pub fn enter(cpu: LogicalCpuId) -> Self {
        INT_DEPTH[cpu.get() as usize].fetch_add(1, Ordering::Acquire);
        Self { cpu }
    }

    /// Returns the CPU this section runs on.
    pub fn cpu(&self) -> LogicalCpuId {
        self.cpu
    }

    /// Returns true if `cpu` is currently inside a hardware-exclusive
    /// section.
    pub fn active_on(cpu: LogicalCpuId) -> bool {
        INT_DEPTH[cpu.get() as usize].load(Ordering::Acquire) != 0
    }
}

impl Drop for HardwareExclusive {
    fn drop(&mut self) {
        let prev = INT_DEPTH[self.cpu.get() as usize].fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "unbalanced HardwareExclusive drop");
    }
}

const UNOWNED: u32 = u32::MAX;

/// A spinlock that the owning CPU may acquire again while already holding it.
///
/// Needed where a code path can re-enter itself from interrupt context on the
/// same CPU, e.g. the framebuffer fake-write switch invoked from
/// interrupt-time display code. The guard only hands out shared references;
/// interior state that must change under the lock is atomic.
pub struct RecursiveSpinlock<T> {
    owner: AtomicU32,
    depth: AtomicUsize,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized per CPU by owner/depth, and the
// guard exposes only shared references.
unsafe impl<T: Send + Sync> Sync for RecursiveSpinlock<T> {}
unsafe impl<T: Send> Send for RecursiveSpinlock<T> {}

impl<T> RecursiveSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU32::new(UNOWNED),
            depth: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for `cpu`, spinning if another CPU holds it.
    /// Re-acquisition by the owning CPU succeeds immediately.
    pub fn lock(&self, cpu: LogicalCpuId) -> RecursiveGuard<'_, T> {
        let id = cpu.get();
        if self.owner.load(Ordering::Acquire) != id {
            while self
                .owner
                .compare_exchange_weak(UNOWNED, id, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        RecursiveGuard { lock: self }
    }
}

/// RAII guard for [`RecursiveSpinlock`]; the lock is released when the
/// outermost guard on the owning CPU drops.
pub struct RecursiveGuard<'a, T> {
    lock: &'a RecursiveSpinlock<T>,
}

impl<T> Deref for RecursiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the owner check in lock() guarantees exclusive ownership by
        // this CPU, and only shared references are handed out.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RecursiveGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_exclusive_nests() {
        let cpu = LogicalCpuId::new(21);
        assert!(!HardwareExclusive::active_on(cpu));
        {
            let _outer = HardwareExclusive::enter(cpu);
            assert!(HardwareExclusive::active_on(cpu));
            {
                let _inner = HardwareExclusive::enter(cpu);
                assert!(HardwareExclusive::active_on(cpu));
            }
            assert!(HardwareExclusive::active_on(cpu));
        }
        assert!(!HardwareExclusive::active_on(cpu));
    }

    #[test]
    fn recursive_spinlock_reenters_on_same_cpu() {
        let lock = RecursiveSpinlock::new(7usize);
        let cpu = LogicalCpuId::new(22);
        let outer = lock.lock(cpu);
        let inner = lock.lock(cpu);
        assert_eq!(*outer, 7);
        assert_eq!(*inner, 7);
        drop(inner);
        drop(outer);
        // Fully released; another CPU can take it now.
        let other = lock.lock(LogicalCpuId::new(23));
        assert_eq!(*other, 7);
    }
}
