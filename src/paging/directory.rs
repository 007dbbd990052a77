//! # Page directories
//!
//! A [`PageDirectory`] owns one four-level translation tree: the top-level
//! frame whose base is the directory's `cr3`, plus every intermediate table
//! frame allocated during mapping. User directories alias the kernel half by
//! copying the kernel directory's upper top-level entries verbatim, so the
//! 256 kernel second-level tables are shared by every directory and a kernel
//! mapping made after a user directory exists is still visible through it.
//!
//! All table edits go through [`Quickmap`]: a per-CPU scratch window that may
//! only be held inside a hardware-exclusive section, because an interrupt
//! arriving mid-edit would find the slot occupied.

use alloc::sync::{Arc, Weak};
use arrayvec::ArrayVec;
use hashbrown::HashMap;
use log::debug;
use spin::{Mutex, Once, RwLock};

use super::{
    ENTRIES_PER_TABLE, KERNEL_TOP_LEVEL_START, Page, PhysicalAddress, TableKind,
    entry::{ENTRY_GLOBAL, ENTRY_PRESENT, ENTRY_USER, ENTRY_WRITABLE, PageTableEntry},
};
use crate::{
    addr_space::AddrSpace,
    cpu_set::{LogicalCpuId, LogicalCpuSet},
    error::{Error, Result},
    memory::{Frame, PageHandle, PhysicalMemory},
    sync::HardwareExclusive,
};

/// The machine-wide cr3-to-directory index, the lookup a page-fault handler
/// performs to find the faulting address space.
pub struct DirectoryRegistry {
    map: RwLock<HashMap<usize, Weak<PageDirectory>>>,
}

impl DirectoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(HashMap::new()),
        })
    }

    /// Resolves a top-level table base back to its directory, if it is still
    /// alive.
    pub fn find(&self, cr3: PhysicalAddress) -> Option<Arc<PageDirectory>> {
        self.map.read().get(&cr3.data())?.upgrade()
    }

    fn insert(&self, cr3: PhysicalAddress, directory: Weak<PageDirectory>) {
        let previous = self.map.write().insert(cr3.data(), directory);
        assert!(
            previous.is_none(),
            "two live directories at cr3 {:#x}",
            cr3.data()
        );
    }

    fn remove(&self, cr3: PhysicalAddress) {
        self.map.write().remove(&cr3.data());
    }
}

/// A scratch mapping of one table frame on the current CPU.
///
/// Claims the CPU's single quickmap slot inside a hardware-exclusive section;
/// both are released on drop. [`Quickmap::retarget`] moves the window to
/// another frame without re-claiming, which is how a multi-level walk stays
/// within one claim.
struct Quickmap<'a> {
    pool: &'a PhysicalMemory,
    frame: Frame,
    hw: HardwareExclusive,
}

impl<'a> Quickmap<'a> {
    fn map(pool: &'a PhysicalMemory, cpu: LogicalCpuId, frame: Frame) -> Self {
        let hw = HardwareExclusive::enter(cpu);
        pool.claim_quickmap_slot(cpu);
        Self { pool, frame, hw }
    }

    fn retarget(&mut self, frame: Frame) {
        self.frame = frame;
    }

    fn entry(&self, index: usize) -> PageTableEntry {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let mut raw = [0u8; 8];
        self.pool.read_frame(self.frame, index * 8, &mut raw);
        PageTableEntry::from_raw(u64::from_le_bytes(raw))
    }

    fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        self.pool
            .write_frame(self.frame, index * 8, &entry.raw().to_le_bytes());
    }
}

impl Drop for Quickmap<'_> {
    fn drop(&mut self) {
        self.pool.release_quickmap_slot(self.hw.cpu());
    }
}

/// One four-level translation tree and the frames backing it.
pub struct PageDirectory {
    pool: Arc<PhysicalMemory>,
    registry: Arc<DirectoryRegistry>,
    kind: TableKind,
    top: PageHandle,
    /// Intermediate table frames allocated by map_page. Never freed while the
    /// directory lives; empty intermediate tables are tolerated.
    table_pages: Mutex<alloc::vec::Vec<PageHandle>>,
    /// Kernel directory only: the shared second-level tables backing the
    /// kernel half, allocated eagerly so user directories can alias them.
    kernel_second_level: ArrayVec<PageHandle, KERNEL_TOP_LEVEL_START>,
    /// Serializes structural edits to the tree.
    edit_lock: Mutex<()>,
    /// CPUs currently running with this directory loaded. The directory must
    /// not be torn down while any bit is set.
    pub active_on: LogicalCpuSet,
    space: Once<Weak<AddrSpace>>,
}

impl PageDirectory {
    /// Builds the kernel directory: a top-level table whose upper half points
    /// at eagerly allocated second-level tables, marked global.
    pub fn create_kernel(
        pool: &Arc<PhysicalMemory>,
        registry: &Arc<DirectoryRegistry>,
        cpu: LogicalCpuId,
    ) -> Result<Arc<Self>> {
        let top = PageHandle::allocate_zeroed(pool)?;

        let mut kernel_second_level = ArrayVec::new();
        for _ in 0..KERNEL_TOP_LEVEL_START {
            // Failure drops the staged handles and the top, freeing them.
            kernel_second_level.push(PageHandle::allocate_zeroed(pool)?);
        }

        {
            let mut qm = Quickmap::map(pool, cpu, top.get());
            for (i, table) in kernel_second_level.iter().enumerate() {
                let entry = PageTableEntry::new(
                    table.get().base(),
                    ENTRY_PRESENT | ENTRY_WRITABLE | ENTRY_GLOBAL,
                );
                qm.set_entry(KERNEL_TOP_LEVEL_START + i, entry);
            }
        }

        let directory = Arc::new(Self {
            pool: Arc::clone(pool),
            registry: Arc::clone(registry),
            kind: TableKind::Kernel,
            top,
            table_pages: Mutex::new(alloc::vec::Vec::new()),
            kernel_second_level,
            edit_lock: Mutex::new(()),
            active_on: LogicalCpuSet::empty(),
            space: Once::new(),
        });
        registry.insert(directory.cr3(), Arc::downgrade(&directory));
        debug!("registered kernel directory at {:?}", directory.cr3());
        Ok(directory)
    }

    /// Builds a fresh user directory whose kernel half aliases `kernel`'s.
    pub fn create_for_userspace(
        kernel: &Arc<PageDirectory>,
        cpu: LogicalCpuId,
    ) -> Result<Arc<Self>> {
        assert_eq!(kernel.kind, TableKind::Kernel);
        let pool = &kernel.pool;
        let top = PageHandle::allocate_zeroed(pool)?;

        // Copy the kernel half verbatim. Two quickmaps cannot be open at once
        // on one CPU, so stage the entries in between.
        let mut upper = [PageTableEntry::UNUSED; KERNEL_TOP_LEVEL_START];
        {
            let qm = Quickmap::map(pool, cpu, kernel.top.get());
            for (i, slot) in upper.iter_mut().enumerate() {
                *slot = qm.entry(KERNEL_TOP_LEVEL_START + i);
            }
        }
        {
            let mut qm = Quickmap::map(pool, cpu, top.get());
            for (i, entry) in upper.iter().enumerate() {
                qm.set_entry(KERNEL_TOP_LEVEL_START + i, *entry);
            }
        }

        let directory = Arc::new(Self {
            pool: Arc::clone(pool),
            registry: Arc::clone(&kernel.registry),
            kind: TableKind::User,
            top,
            table_pages: Mutex::new(alloc::vec::Vec::new()),
            kernel_second_level: ArrayVec::new(),
            edit_lock: Mutex::new(()),
            active_on: LogicalCpuSet::empty(),
            space: Once::new(),
        });
        kernel
            .registry
            .insert(directory.cr3(), Arc::downgrade(&directory));
        debug!("registered user directory at {:?}", directory.cr3());
        Ok(directory)
    }

    /// The physical base of the top-level table, i.e. what the hardware would
    /// load into its translation base register.
    pub fn cr3(&self) -> PhysicalAddress {
        self.top.get().base()
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn pool(&self) -> &Arc<PhysicalMemory> {
        &self.pool
    }

    /// Ties this directory to the address space that owns it. Called once at
    /// address-space creation.
    pub fn attach_space(&self, space: &Arc<AddrSpace>) {
        self.space.call_once(|| Arc::downgrade(space));
    }

    /// The owning address space, if one is attached and still alive.
    pub fn space(&self) -> Option<Arc<AddrSpace>> {
        self.space.get()?.upgrade()
    }

    fn check_half(&self, page: Page) -> Result<()> {
        if page.start_address().kind() == self.kind {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Installs a leaf entry for `page`, allocating intermediate tables as
    /// needed. An existing leaf is overwritten, which is how permission
    /// updates are expressed.
    pub fn map_page(
        &self,
        cpu: LogicalCpuId,
        page: Page,
        frame: PhysicalAddress,
        flags: u64,
    ) -> Result<()> {
        self.check_half(page)?;
        let _edit = self.edit_lock.lock();

        let mut qm = Quickmap::map(&self.pool, cpu, self.top.get());
        for level in (1..4).rev() {
            let index = page.table_index(level);
            let entry = qm.entry(index);
            let next = if entry.present() {
                Frame::containing(entry.address())
            } else {
                let table = PageHandle::allocate_zeroed(&self.pool)?;
                let table_frame = table.get();
                let mut bits = ENTRY_PRESENT | ENTRY_WRITABLE;
                if self.kind == TableKind::User {
                    bits |= ENTRY_USER;
                }
                qm.set_entry(index, PageTableEntry::new(table_frame.base(), bits));
                self.table_pages.lock().push(table);
                table_frame
            };
            qm.retarget(next);
        }
        qm.set_entry(page.table_index(0), PageTableEntry::new(frame, flags));
        Ok(())
    }

    /// Clears the leaf entry for `page`, returning the previous entry if one
    /// was present. Intermediate tables stay allocated.
    pub fn unmap_page(&self, cpu: LogicalCpuId, page: Page) -> Option<PageTableEntry> {
        self.check_half(page).ok()?;
        let _edit = self.edit_lock.lock();

        let mut qm = Quickmap::map(&self.pool, cpu, self.top.get());
        for level in (1..4).rev() {
            let entry = qm.entry(page.table_index(level));
            if !entry.present() {
                return None;
            }
            qm.retarget(Frame::containing(entry.address()));
        }
        let index = page.table_index(0);
        let old = qm.entry(index);
        if !old.present() {
            return None;
        }
        qm.set_entry(index, PageTableEntry::UNUSED);
        Some(old)
    }

    /// Walks the tree for `page`, returning the present leaf entry if any.
    pub fn translate(&self, cpu: LogicalCpuId, page: Page) -> Option<PageTableEntry> {
        let _edit = self.edit_lock.lock();

        let mut qm = Quickmap::map(&self.pool, cpu, self.top.get());
        for level in (1..4).rev() {
            let entry = qm.entry(page.table_index(level));
            if !entry.present() {
                return None;
            }
            qm.retarget(Frame::containing(entry.address()));
        }
        let entry = qm.entry(page.table_index(0));
        entry.present().then_some(entry)
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        // Deregister first so no new lookup can resurrect us, then wait out
        // any CPU still running on this directory before the table frames are
        // released by the handle drops below.
        self.registry.remove(self.cr3());
        while !self.active_on.is_empty() {
            core::hint::spin_loop();
        }
        debug!("deregistered directory at {:?}", self.cr3());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::{
        PAGE_SIZE, PageFlags, VirtualAddress,
        entry::{ENTRY_NO_EXECUTE, entry_flags},
    };

    fn machine(frames: usize) -> (Arc<PhysicalMemory>, Arc<DirectoryRegistry>) {
        let pool = Arc::new(PhysicalMemory::new(frames, 0).expect("pool"));
        (pool, DirectoryRegistry::new())
    }

    #[test]
    fn registry_roundtrip_and_deregistration_on_drop() {
        let (pool, registry) = machine(512);
        let cpu = LogicalCpuId::BSP;
        let kernel = PageDirectory::create_kernel(&pool, &registry, cpu).unwrap();
        let cr3 = kernel.cr3();

        let found = registry.find(cr3).expect("live directory must resolve");
        assert!(Arc::ptr_eq(&found, &kernel));

        drop(found);
        drop(kernel);
        assert!(registry.find(cr3).is_none());
    }

    #[test]
    fn user_directories_alias_the_kernel_half_bit_identically() {
        let (pool, registry) = machine(600);
        let cpu = LogicalCpuId::BSP;
        let kernel = PageDirectory::create_kernel(&pool, &registry, cpu).unwrap();
        let a = PageDirectory::create_for_userspace(&kernel, cpu).unwrap();
        let b = PageDirectory::create_for_userspace(&kernel, cpu).unwrap();

        let mut kernel_half = [0u8; PAGE_SIZE / 2];
        let mut other_half = [0u8; PAGE_SIZE / 2];
        pool.read_frame(
            Frame::containing(kernel.cr3()),
            PAGE_SIZE / 2,
            &mut kernel_half,
        );
        for dir in [&a, &b] {
            pool.read_frame(Frame::containing(dir.cr3()), PAGE_SIZE / 2, &mut other_half);
            assert_eq!(kernel_half, other_half);
        }
        // The user halves start empty.
        let mut lower = [0u8; PAGE_SIZE / 2];
        pool.read_frame(Frame::containing(a.cr3()), 0, &mut lower);
        assert!(lower.iter().all(|&b| b == 0));
    }

    #[test]
    fn map_translate_unmap() {
        let (pool, registry) = machine(600);
        let cpu = LogicalCpuId::BSP;
        let kernel = PageDirectory::create_kernel(&pool, &registry, cpu).unwrap();
        let dir = PageDirectory::create_for_userspace(&kernel, cpu).unwrap();

        let page = Page::containing_address(VirtualAddress::new(0x40_0000));
        assert!(dir.translate(cpu, page).is_none());

        let frame = PageHandle::allocate_zeroed(&pool).unwrap();
        let flags = entry_flags(
            PageFlags::READ | PageFlags::WRITE | PageFlags::USER,
            true,
        );
        dir.map_page(cpu, page, frame.get().base(), flags).unwrap();

        let entry = dir.translate(cpu, page).expect("mapped page translates");
        assert_eq!(entry.address(), frame.get().base());
        assert!(entry.writable());
        assert!(entry.user());
        assert!(entry.raw() & ENTRY_NO_EXECUTE != 0);

        let old = dir.unmap_page(cpu, page).expect("unmap returns the entry");
        assert_eq!(old.address(), frame.get().base());
        assert!(dir.translate(cpu, page).is_none());
        // Unmapping again is a no-op.
        assert!(dir.unmap_page(cpu, page).is_none());
    }

    #[test]
    fn user_directory_rejects_kernel_half_mappings() {
        let (pool, registry) = machine(600);
        let cpu = LogicalCpuId::BSP;
        let kernel = PageDirectory::create_kernel(&pool, &registry, cpu).unwrap();
        let dir = PageDirectory::create_for_userspace(&kernel, cpu).unwrap();

        let page = Page::containing_address(VirtualAddress::new(crate::paging::KERNEL_BASE));
        let frame = PageHandle::allocate_zeroed(&pool).unwrap();
        assert_eq!(
            dir.map_page(cpu, page, frame.get().base(), ENTRY_PRESENT),
            Err(Error::InvalidArgument)
        );
    }
}
