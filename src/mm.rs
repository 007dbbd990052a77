//! # Memory-manager coordinator
//!
//! Owns everything with boot-init lifetime: the physical pool, the cr3
//! registry, the kernel directory, and the per-CPU notion of which address
//! space is loaded. Construction takes an explicit [`MachineMemory`]
//! description; there are no global singletons, several managers can coexist
//! in one test process.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, info};
use spin::Mutex;

use crate::{
    addr_space::AddrSpace,
    cpu_set::{LogicalCpuId, LogicalCpuSet, MAX_CPU_COUNT},
    error::{Error, Result},
    klog,
    memory::{PageHandle, PhysicalMemory},
    paging::{
        KERNEL_BASE, PAGE_SIZE, Page, PageFlags, PageSpan, PhysicalAddress, VirtualAddress,
        directory::{DirectoryRegistry, PageDirectory},
        entry::{ENTRY_GLOBAL, ENTRY_NO_CACHE, entry_flags},
    },
    sync::HardwareExclusive,
};

/// Boot-time machine description.
#[derive(Clone, Copy, Debug)]
pub struct MachineMemory {
    pub frame_count: usize,
    /// Leading frames owned by firmware or the boot image. Pinned at init,
    /// never allocatable.
    pub reserved_frames: usize,
}

/// Base of the kernel window device mappings are carved from.
const KERNEL_DEVICE_BASE: usize = KERNEL_BASE + 0x1000_0000;

pub struct MemoryManager {
    pool: Arc<PhysicalMemory>,
    registry: Arc<DirectoryRegistry>,
    kernel_directory: Arc<PageDirectory>,
    /// Per-CPU loaded table root, mirroring the hardware register.
    current_cr3: [AtomicUsize; MAX_CPU_COUNT as usize],
    active: [Mutex<Option<Arc<AddrSpace>>>; MAX_CPU_COUNT as usize],
    /// Bump cursor into the device window.
    device_window: AtomicUsize,
}

impl MemoryManager {
    /// Boot initialization: pool, zeroed frame, kernel directory, registry,
    /// and the log sink (once per process).
    pub fn new(machine: MachineMemory) -> Result<Arc<Self>> {
        klog::init();
        let pool = Arc::new(PhysicalMemory::new(
            machine.frame_count,
            machine.reserved_frames,
        )?);
        let registry = DirectoryRegistry::new();
        let kernel_directory = PageDirectory::create_kernel(&pool, &registry, LogicalCpuId::BSP)?;
        info!(
            "memory manager up, {} frames ({} reserved), kernel tables at {:?}",
            machine.frame_count,
            machine.reserved_frames,
            kernel_directory.cr3()
        );

        let kernel_cr3 = kernel_directory.cr3().data();
        Ok(Arc::new(Self {
            pool,
            registry,
            kernel_directory,
            current_cr3: core::array::from_fn(|_| AtomicUsize::new(kernel_cr3)),
            active: core::array::from_fn(|_| Mutex::new(None)),
            device_window: AtomicUsize::new(KERNEL_DEVICE_BASE),
        }))
    }

    pub fn pool(&self) -> &Arc<PhysicalMemory> {
        &self.pool
    }
    pub fn registry(&self) -> &Arc<DirectoryRegistry> {
        &self.registry
    }
    pub fn kernel_directory(&self) -> &Arc<PageDirectory> {
        &self.kernel_directory
    }

    pub fn new_addr_space(&self, cpu: LogicalCpuId) -> Result<Arc<AddrSpace>> {
        AddrSpace::new(&self.kernel_directory, cpu)
    }

    /// Switches `cpu` to `space`. The scheduler's context-switch path;
    /// performed with interrupts masked so the cr3 word, the directory's
    /// active set and the space's used set change together.
    pub fn activate(&self, cpu: LogicalCpuId, space: &Arc<AddrSpace>) {
        let _hw = HardwareExclusive::enter(cpu);
        let mut slot = self.active[cpu.get() as usize].lock();
        if let Some(old) = slot.take() {
            old.table().active_on.atomic_clear(cpu);
            old.used_by.atomic_clear(cpu);
        }
        space.table().active_on.atomic_set(cpu);
        space.used_by.atomic_set(cpu);
        self.current_cr3[cpu.get() as usize].store(space.table().cr3().data(), Ordering::Release);
        *slot = Some(Arc::clone(space));
        debug!("{cpu} activated {:?}", space.table().cr3());
    }

    /// Drops `cpu` back to the bare kernel tables.
    pub fn deactivate(&self, cpu: LogicalCpuId) {
        let _hw = HardwareExclusive::enter(cpu);
        let mut slot = self.active[cpu.get() as usize].lock();
        if let Some(old) = slot.take() {
            old.table().active_on.atomic_clear(cpu);
            old.used_by.atomic_clear(cpu);
        }
        self.current_cr3[cpu.get() as usize]
            .store(self.kernel_directory.cr3().data(), Ordering::Release);
    }

    /// What the CPU's table-root register holds right now.
    pub fn current_cr3(&self, cpu: LogicalCpuId) -> PhysicalAddress {
        PhysicalAddress::new(self.current_cr3[cpu.get() as usize].load(Ordering::Acquire))
    }

    /// The address space `cpu` is running in, resolved the way the fault
    /// handler does it: loaded cr3, registry, attached space.
    pub fn find_current(&self, cpu: LogicalCpuId) -> Option<Arc<AddrSpace>> {
        self.registry.find(self.current_cr3(cpu))?.space()
    }

    /// Allocates a physically contiguous, zeroed buffer for device DMA. The
    /// frames are owned by the returned handle; drivers must not free them
    /// individually.
    pub fn allocate_dma_buffer(&self, page_count: usize) -> Result<DmaBuffer> {
        if page_count == 0 {
            return Err(Error::InvalidArgument);
        }
        let frames = PageHandle::allocate_contiguous(&self.pool, page_count)?;
        debug!("dma buffer, {page_count} pages at {:?}", frames[0].get());
        Ok(DmaBuffer { frames })
    }

    /// Maps `page_count` frames starting at `base` into the kernel device
    /// window, visible through every directory via the aliased kernel half.
    /// MMIO mappings pass `cacheable = false`.
    pub fn map_into_kernel(
        &self,
        cpu: LogicalCpuId,
        base: PhysicalAddress,
        page_count: usize,
        flags: PageFlags,
        cacheable: bool,
    ) -> Result<Page> {
        if page_count == 0 || !base.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        assert!(
            !flags.contains(PageFlags::USER),
            "kernel window mappings must not be user accessible"
        );
        let window = self
            .device_window
            .fetch_add(page_count * PAGE_SIZE, Ordering::Relaxed);
        let first = Page::containing_address(VirtualAddress::new(window));
        for i in 0..page_count {
            let mut bits =
                entry_flags(flags, flags.contains(PageFlags::WRITE)) | ENTRY_GLOBAL;
            if !cacheable {
                bits |= ENTRY_NO_CACHE;
            }
            self.kernel_directory
                .map_page(cpu, first.next_by(i), base.add(i * PAGE_SIZE), bits)?;
        }
        Ok(first)
    }
}

/// A physically contiguous DMA buffer; the frames return to the pool when the
/// buffer drops.
pub struct DmaBuffer {
    frames: Vec<PageHandle>,
}

impl DmaBuffer {
    pub fn base(&self) -> PhysicalAddress {
        self.frames[0].get().base()
    }
    pub fn page_count(&self) -> usize {
        self.frames.len()
    }
}

/// Accumulates stale translation ranges from one table-mutating operation;
/// [`flush`](Self::flush) delivers one invalidation IPI to every CPU in the
/// target set. Flushing with nothing accumulated delivers nothing.
pub struct TlbShootdown<'a> {
    pool: &'a PhysicalMemory,
    spans: Vec<PageSpan>,
}

impl<'a> TlbShootdown<'a> {
    pub fn new(pool: &'a PhysicalMemory) -> Self {
        Self {
            pool,
            spans: Vec::new(),
        }
    }

    pub fn include(&mut self, span: PageSpan) {
        if !span.is_empty() {
            self.spans.push(span);
        }
    }

    pub fn flush(self, targets: &LogicalCpuSet) {
        if self.spans.is_empty() {
            return;
        }
        for cpu in targets.iter() {
            self.pool.deliver_tlb_invalidation(cpu);
        }
    }
}
