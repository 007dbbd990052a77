use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

/// The largest number of CPUs the subsystem models.
pub const MAX_CPU_COUNT: u32 = 32;

const SET_WORDS: usize = (MAX_CPU_COUNT as usize).div_ceil(usize::BITS as usize);

/// A unique number used internally by the kernel to identify CPUs.
///
/// This is usually but not necessarily the same as the APIC ID.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct LogicalCpuId(u32);

impl LogicalCpuId {
    /// The logical CPU ID of the bootstrap processor.
    pub const BSP: Self = Self::new(0);

    /// Creates a new logical CPU ID.
    ///
    /// # Panics
    ///
    /// Panics if `inner` is not below [`MAX_CPU_COUNT`].
    pub const fn new(inner: u32) -> Self {
        assert!(inner < MAX_CPU_COUNT);
        Self(inner)
    }
    /// Returns the inner value of the logical CPU ID.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for LogicalCpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[logical cpu #{}]", self.0)
    }
}
impl fmt::Display for LogicalCpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returns the word and bit for a given logical CPU ID.
fn parts(id: LogicalCpuId) -> (usize, u32) {
    ((id.get() / usize::BITS) as usize, id.get() % usize::BITS)
}

/// A bitmask of logical CPU IDs, mutated atomically.
///
/// Tracks which CPUs currently have an address space loaded (for TLB
/// shootdown targeting) and which CPUs still hold a page directory active
/// (teardown must wait for this set to drain).
#[derive(Debug)]
pub struct LogicalCpuSet([AtomicUsize; SET_WORDS]);

impl LogicalCpuSet {
    /// Creates an empty CPU set.
    pub const fn empty() -> Self {
        Self([const { AtomicUsize::new(0) }; SET_WORDS])
    }
    /// Returns true if the CPU set contains the given logical CPU ID.
    pub fn contains(&self, id: LogicalCpuId) -> bool {
        let (word, bit) = parts(id);
        self.0[word].load(Ordering::Acquire) & (1 << bit) != 0
    }
    /// Returns true if no CPU is in the set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }
    /// Atomically sets the bit for the given logical CPU ID.
    pub fn atomic_set(&self, id: LogicalCpuId) {
        let (word, bit) = parts(id);
        let _ = self.0[word].fetch_or(1 << bit, Ordering::Release);
    }
    /// Atomically clears the bit for the given logical CPU ID.
    pub fn atomic_clear(&self, id: LogicalCpuId) {
        let (word, bit) = parts(id);
        let _ = self.0[word].fetch_and(!(1 << bit), Ordering::Release);
    }

    /// Returns an iterator over the logical CPU IDs currently in the set.
    ///
    /// The snapshot is taken word by word; concurrent mutation may or may not
    /// be observed.
    pub fn iter(&self) -> impl Iterator<Item = LogicalCpuId> + '_ {
        self.0.iter().enumerate().flat_map(move |(i, w)| {
            let word = w.load(Ordering::Acquire);
            (0..usize::BITS).filter_map(move |b| {
                if word & (1 << b) != 0 {
                    Some(LogicalCpuId::new(i as u32 * usize::BITS + b))
                } else {
                    None
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_roundtrip() {
        let set = LogicalCpuSet::empty();
        assert!(set.is_empty());

        let a = LogicalCpuId::new(3);
        let b = LogicalCpuId::new(17);
        set.atomic_set(a);
        set.atomic_set(b);
        assert!(set.contains(a));
        assert!(set.contains(b));
        assert!(!set.contains(LogicalCpuId::BSP));
        assert_eq!(set.iter().count(), 2);

        set.atomic_clear(a);
        assert!(!set.contains(a));
        set.atomic_clear(b);
        assert!(set.is_empty());
    }
}
