//! # Address spaces and regions
//!
//! An [`AddrSpace`] is the per-process view of virtual memory: a sorted,
//! non-overlapping set of [`Region`]s over one user [`PageDirectory`]. Every
//! mapping operation maintains the non-overlap invariant; the fault path
//! resolves a page against the region map and repairs the hardware tables.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use log::debug;
use spin::RwLock;

use crate::{
    cpu_set::{LogicalCpuId, LogicalCpuSet},
    error::{Error, Result},
    fault::{AccessMode, PfError},
    memory::{PhysicalMemory, vmobject::VmObject},
    mm::TlbShootdown,
    paging::{
        PAGE_SIZE, Page, PageFlags, PageSpan, TableKind, USER_TOP, VirtualAddress,
        directory::PageDirectory,
        entry::entry_flags,
    },
};

/// Lowest base the anywhere-placement search will hand out. Keeps the null
/// page and its neighbourhood unmapped.
const MMAP_MIN: usize = 0x1_0000;

/// One mapping: a span of pages backed by a window into a VMObject.
struct Region {
    span: PageSpan,
    flags: PageFlags,
    /// Ceiling the region was granted at mmap time; mprotect may narrow
    /// within it but never escalate past it.
    max_flags: PageFlags,
    object: Arc<dyn VmObject>,
    /// First object page this region maps, in pages.
    object_offset: usize,
    /// Shared regions keep their object across fork; private ones get a
    /// copy-on-write clone.
    shared: bool,
}

impl Region {
    /// Splits off `span` (which must lie within the region), returning the
    /// pieces before and after it plus the extracted middle. Offsets into the
    /// backing object are preserved.
    fn extract(self, span: PageSpan) -> (Option<Region>, Region, Option<Region>) {
        debug_assert!(span.base >= self.span.base && span.end() <= self.span.end());

        let before = (span.base > self.span.base).then(|| Region {
            span: PageSpan::new(self.span.base, span.base.offset_from(self.span.base)),
            flags: self.flags,
            max_flags: self.max_flags,
            object: Arc::clone(&self.object),
            object_offset: self.object_offset,
            shared: self.shared,
        });
        let after = (span.end() < self.span.end()).then(|| Region {
            span: PageSpan::new(span.end(), self.span.end().offset_from(span.end())),
            flags: self.flags,
            max_flags: self.max_flags,
            object: Arc::clone(&self.object),
            object_offset: self.object_offset + span.end().offset_from(self.span.base),
            shared: self.shared,
        });
        let middle = Region {
            span,
            flags: self.flags,
            max_flags: self.max_flags,
            object_offset: self.object_offset + span.base.offset_from(self.span.base),
            object: self.object,
            shared: self.shared,
        };
        (before, middle, after)
    }

    fn allows(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.flags.contains(PageFlags::READ),
            AccessMode::Write => self.flags.contains(PageFlags::WRITE),
            AccessMode::InstrFetch => self.flags.contains(PageFlags::EXEC),
        }
    }
}

struct Inner {
    regions: BTreeMap<Page, Region>,
    mmap_min: Page,
}

/// Parameters of one mapping request.
#[derive(Clone, Copy, Debug)]
pub struct MapRequest {
    /// Fixed base, or `None` to let the placement search choose.
    pub base: Option<Page>,
    pub page_count: usize,
    pub flags: PageFlags,
    /// First object page to map.
    pub object_offset: usize,
    /// Keep the object itself across fork instead of COW-cloning it.
    pub shared: bool,
    /// Install leaf entries eagerly instead of waiting for faults.
    pub populate: bool,
}

impl MapRequest {
    pub fn new(page_count: usize, flags: PageFlags) -> Self {
        Self {
            base: None,
            page_count,
            flags,
            object_offset: 0,
            shared: false,
            populate: false,
        }
    }
}

/// A process address space.
pub struct AddrSpace {
    pool: Arc<PhysicalMemory>,
    table: Arc<PageDirectory>,
    inner: RwLock<Inner>,
    /// CPUs currently running with this space active; the TLB shootdown
    /// targets after any unmap or permission downgrade.
    pub used_by: LogicalCpuSet,
}

impl AddrSpace {
    /// Creates an empty address space over a fresh user directory aliasing
    /// `kernel`'s upper half.
    pub fn new(kernel: &Arc<PageDirectory>, cpu: LogicalCpuId) -> Result<Arc<Self>> {
        assert_eq!(kernel.kind(), TableKind::Kernel);
        let table = PageDirectory::create_for_userspace(kernel, cpu)?;
        let space = Arc::new(Self {
            pool: Arc::clone(table.pool()),
            table: Arc::clone(&table),
            inner: RwLock::new(Inner {
                regions: BTreeMap::new(),
                mmap_min: Page::containing_address(VirtualAddress::new(MMAP_MIN)),
            }),
            used_by: LogicalCpuSet::empty(),
        });
        table.attach_space(&space);
        Ok(space)
    }

    pub fn table(&self) -> &Arc<PageDirectory> {
        &self.table
    }

    /// Maps `object` into the space per `req`, returning the chosen base.
    pub fn mmap(
        &self,
        cpu: LogicalCpuId,
        object: Arc<dyn VmObject>,
        req: MapRequest,
    ) -> Result<Page> {
        if req.page_count == 0 {
            return Err(Error::InvalidArgument);
        }
        let object_end = req
            .object_offset
            .checked_add(req.page_count)
            .ok_or(Error::InvalidArgument)?;
        if object_end > object.page_count() {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.write();
        let base = match req.base {
            Some(base) => {
                Self::check_user_span(base, req.page_count)?;
                if let Some((_, last_below)) =
                    inner.regions.range(..base.next_by(req.page_count)).next_back()
                {
                    if last_below.span.end() > base {
                        return Err(Error::Overlap);
                    }
                }
                base
            }
            None => Self::find_free_span(&inner, req.page_count).ok_or(Error::OutOfMemory)?,
        };
        let span = PageSpan::new(base, req.page_count);

        if req.populate {
            if let Err(err) = self.populate_span(cpu, &object, req.object_offset, req.flags, span) {
                for page in span.pages() {
                    let _ = self.table.unmap_page(cpu, page);
                }
                return Err(err);
            }
        }

        inner.regions.insert(
            base,
            Region {
                span,
                flags: req.flags,
                max_flags: req.flags,
                object,
                object_offset: req.object_offset,
                shared: req.shared,
            },
        );
        Ok(base)
    }

    fn check_user_span(base: Page, page_count: usize) -> Result<()> {
        let size = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::InvalidArgument)?;
        let end = base
            .start_address()
            .data()
            .checked_add(size)
            .ok_or(Error::InvalidArgument)?;
        if end > USER_TOP {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// First-fit search for a gap of `page_count` pages at or above the
    /// minimum mapping address.
    fn find_free_span(inner: &Inner, page_count: usize) -> Option<Page> {
        let mut candidate = inner.mmap_min;
        for region in inner.regions.values() {
            if region.span.end() <= candidate {
                continue;
            }
            if region.span.base >= candidate
                && region.span.base.offset_from(candidate) >= page_count
            {
                break;
            }
            candidate = region.span.end();
        }
        Self::check_user_span(candidate, page_count).ok()?;
        Some(candidate)
    }

    fn populate_span(
        &self,
        cpu: LogicalCpuId,
        object: &Arc<dyn VmObject>,
        object_offset: usize,
        flags: PageFlags,
        span: PageSpan,
    ) -> Result<()> {
        for (i, page) in span.pages().enumerate() {
            let backed = object
                .ensure_backed(object_offset + i, AccessMode::Read)
                .map_err(|_| Error::OutOfMemory)?;
            let writable = backed.writable && flags.contains(PageFlags::WRITE);
            self.table
                .map_page(cpu, page, backed.frame.base(), entry_flags(flags, writable))?;
        }
        Ok(())
    }

    /// Unmaps every page of `span`, splitting regions it partially covers.
    /// Pages of the span with no mapping are skipped.
    pub fn munmap(&self, cpu: LogicalCpuId, span: PageSpan) -> Result<()> {
        if span.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.write();
        let mut shootdown = TlbShootdown::new(&self.pool);

        let affected: Vec<Page> = inner
            .regions
            .range(..span.end())
            .filter(|(_, region)| region.span.end() > span.base)
            .map(|(base, _)| *base)
            .collect();

        for base in affected {
            let region = inner.regions.remove(&base).expect("key collected above");
            let overlap = region
                .span
                .intersection(span)
                .expect("affected region intersects the span");
            let (before, middle, after) = region.extract(overlap);
            if let Some(part) = before {
                inner.regions.insert(part.span.base, part);
            }
            if let Some(part) = after {
                inner.regions.insert(part.span.base, part);
            }
            for page in middle.span.pages() {
                let _ = self.table.unmap_page(cpu, page);
            }
            shootdown.include(middle.span);
            // `middle` drops here, releasing its object reference.
        }

        shootdown.flush(&self.used_by);
        Ok(())
    }

    /// Changes the permissions of `span`, which must be fully covered by
    /// existing regions. Present leaf entries are rewritten in place.
    pub fn mprotect(&self, cpu: LogicalCpuId, span: PageSpan, flags: PageFlags) -> Result<()> {
        if span.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.write();
        let mut shootdown = TlbShootdown::new(&self.pool);

        // Reject holes and permission escalation before mutating anything.
        let mut cursor = span.base;
        let affected: Vec<Page> = inner
            .regions
            .range(..span.end())
            .filter(|(_, region)| region.span.end() > span.base)
            .map(|(base, _)| *base)
            .collect();
        for base in &affected {
            let region = &inner.regions[base];
            let overlap = region
                .span
                .intersection(span)
                .expect("affected region intersects the span");
            if overlap.base != cursor {
                return Err(Error::InvalidArgument);
            }
            if !region.max_flags.contains(flags) {
                return Err(Error::InvalidArgument);
            }
            cursor = overlap.end();
        }
        if cursor != span.end() {
            return Err(Error::InvalidArgument);
        }

        for base in affected {
            let region = inner.regions.remove(&base).expect("key collected above");
            let overlap = region
                .span
                .intersection(span)
                .expect("affected region intersects the span");
            let (before, mut middle, after) = region.extract(overlap);
            middle.flags = flags;

            for (i, page) in middle.span.pages().enumerate() {
                if let Some(entry) = self.table.translate(cpu, page) {
                    let writable = flags.contains(PageFlags::WRITE)
                        && middle.object.mapping_writable(middle.object_offset + i);
                    self.table
                        .map_page(cpu, page, entry.address(), entry_flags(flags, writable))?;
                }
            }

            shootdown.include(middle.span);
            for part in [before, Some(middle), after].into_iter().flatten() {
                inner.regions.insert(part.span.base, part);
            }
        }

        shootdown.flush(&self.used_by);
        Ok(())
    }

    /// The fault path: resolves `page` against the region map, backs the
    /// object slot, and installs the corrected leaf entry.
    pub fn try_correcting_page_tables(
        &self,
        cpu: LogicalCpuId,
        page: Page,
        mode: AccessMode,
    ) -> core::result::Result<(), PfError> {
        let inner = self.inner.read();
        let region = inner
            .regions
            .range(..=page)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.span.contains(page))
            .ok_or(PfError::Segv)?;
        if !region.allows(mode) {
            return Err(PfError::Segv);
        }

        let index = region.object_offset + page.offset_from(region.span.base);
        let backed = region.object.ensure_backed(index, mode)?;
        let writable = backed.writable && region.flags.contains(PageFlags::WRITE);
        self.table
            .map_page(cpu, page, backed.frame.base(), entry_flags(region.flags, writable))
            .map_err(|_| PfError::Oom)
    }

    /// Forks the space: shared regions keep their objects, private ones get
    /// copy-on-write clones, and the parent's writable leaves are downgraded
    /// so its next write faults and breaks the share.
    pub fn try_clone(
        &self,
        kernel: &Arc<PageDirectory>,
        cpu: LogicalCpuId,
    ) -> Result<Arc<AddrSpace>> {
        let child = AddrSpace::new(kernel, cpu)?;
        let inner = self.inner.read();
        let mut child_inner = child.inner.write();
        child_inner.mmap_min = inner.mmap_min;
        let mut shootdown = TlbShootdown::new(&self.pool);

        for (base, region) in inner.regions.iter() {
            let object = if region.shared {
                Arc::clone(&region.object)
            } else {
                Arc::clone(&region.object).try_clone_for_fork()?
            };

            if !region.shared {
                for page in region.span.pages() {
                    let Some(entry) = self.table.translate(cpu, page) else {
                        continue;
                    };
                    if entry.writable() {
                        self.table.map_page(
                            cpu,
                            page,
                            entry.address(),
                            entry_flags(region.flags, false),
                        )?;
                    }
                }
                shootdown.include(region.span);
            }

            child_inner.regions.insert(
                *base,
                Region {
                    span: region.span,
                    flags: region.flags,
                    max_flags: region.max_flags,
                    object,
                    object_offset: region.object_offset,
                    shared: region.shared,
                },
            );
        }
        drop(child_inner);
        drop(inner);

        debug!("forked address space into {:?}", child.table.cr3());
        shootdown.flush(&self.used_by);
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vmobject::{AllocationStrategy, AnonymousVmObject};
    use crate::paging::directory::DirectoryRegistry;

    fn machine() -> (Arc<PhysicalMemory>, Arc<PageDirectory>) {
        let pool = Arc::new(PhysicalMemory::new(2048, 0).expect("pool"));
        let registry = DirectoryRegistry::new();
        let kernel = PageDirectory::create_kernel(&pool, &registry, LogicalCpuId::BSP).unwrap();
        (pool, kernel)
    }

    fn rw() -> PageFlags {
        PageFlags::READ | PageFlags::WRITE | PageFlags::USER
    }

    fn anon(pool: &Arc<PhysicalMemory>, pages: usize) -> Arc<AnonymousVmObject> {
        AnonymousVmObject::try_create_with_size(
            pool,
            pages * PAGE_SIZE,
            AllocationStrategy::AllocateOnDemand,
        )
        .unwrap()
    }

    #[test]
    fn overlapping_fixed_mappings_are_rejected() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        let base = Page::containing_address(VirtualAddress::new(0x100_0000));

        let mut req = MapRequest::new(4, rw());
        req.base = Some(base);
        space.mmap(cpu, anon(&pool, 4), req).unwrap();

        // Any intersection is refused, including partial ones.
        for (offset, count) in [(0, 4), (2, 4), (3, 1)] {
            let mut clash = MapRequest::new(count, rw());
            clash.base = Some(base.next_by(offset));
            assert_eq!(
                space.mmap(cpu, anon(&pool, count), clash),
                Err(Error::Overlap)
            );
        }
        // Adjacent is fine.
        let mut next = MapRequest::new(1, rw());
        next.base = Some(base.next_by(4));
        space.mmap(cpu, anon(&pool, 1), next).unwrap();
    }

    #[test]
    fn zero_page_count_is_invalid() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        assert_eq!(
            space.mmap(cpu, anon(&pool, 1), MapRequest::new(0, rw())),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn anywhere_placement_skips_existing_regions() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();

        let a = space.mmap(cpu, anon(&pool, 2), MapRequest::new(2, rw())).unwrap();
        let b = space.mmap(cpu, anon(&pool, 3), MapRequest::new(3, rw())).unwrap();
        assert!(b >= a.next_by(2));

        // A gap left by munmap is reused first-fit.
        space.munmap(cpu, PageSpan::new(a, 2)).unwrap();
        let c = space.mmap(cpu, anon(&pool, 1), MapRequest::new(1, rw())).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn demand_paging_backs_only_the_faulted_page() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        let object = anon(&pool, 3);
        let base = space
            .mmap(cpu, object.clone(), MapRequest::new(3, rw()))
            .unwrap();

        // Nothing is mapped until a fault arrives.
        assert!(space.table().translate(cpu, base).is_none());

        space
            .try_correcting_page_tables(cpu, base.next(), AccessMode::Write)
            .unwrap();

        assert!(space.table().translate(cpu, base).is_none());
        assert!(space.table().translate(cpu, base.next()).is_some());
        assert!(space.table().translate(cpu, base.next_by(2)).is_none());
        assert!(object.physical_page(0).is_none());
        assert!(object.physical_page(1).is_some());
    }

    #[test]
    fn faults_outside_any_region_are_violations() {
        let (_pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        let page = Page::containing_address(VirtualAddress::new(0x5000_0000));
        assert_eq!(
            space.try_correcting_page_tables(cpu, page, AccessMode::Read),
            Err(PfError::Segv)
        );
    }

    #[test]
    fn write_fault_on_readonly_region_is_a_violation() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        let base = space
            .mmap(
                cpu,
                anon(&pool, 1),
                MapRequest::new(1, PageFlags::READ | PageFlags::USER),
            )
            .unwrap();
        assert_eq!(
            space.try_correcting_page_tables(cpu, base, AccessMode::Write),
            Err(PfError::Segv)
        );
        // Reads are still fine.
        space
            .try_correcting_page_tables(cpu, base, AccessMode::Read)
            .unwrap();
    }

    #[test]
    fn fork_isolates_private_memory_copy_on_write() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let parent = AddrSpace::new(&kernel, cpu).unwrap();
        let base = parent
            .mmap(cpu, anon(&pool, 1), MapRequest::new(1, rw()))
            .unwrap();

        parent
            .try_correcting_page_tables(cpu, base, AccessMode::Write)
            .unwrap();
        let entry = parent.table().translate(cpu, base).unwrap();
        assert!(entry.writable());
        pool.write_frame(
            crate::memory::Frame::containing(entry.address()),
            0,
            b"parent data",
        );

        let child = parent.try_clone(&kernel, cpu).unwrap();

        // The parent's leaf was downgraded so its next write faults.
        let downgraded = parent.table().translate(cpu, base).unwrap();
        assert!(!downgraded.writable());

        // Parent writes again: the fault breaks the share onto a new frame.
        parent
            .try_correcting_page_tables(cpu, base, AccessMode::Write)
            .unwrap();
        let parent_entry = parent.table().translate(cpu, base).unwrap();
        assert!(parent_entry.writable());
        pool.write_frame(
            crate::memory::Frame::containing(parent_entry.address()),
            0,
            b"parent more",
        );

        // The child still reads the pre-fork contents.
        child
            .try_correcting_page_tables(cpu, base, AccessMode::Read)
            .unwrap();
        let child_entry = child.table().translate(cpu, base).unwrap();
        let mut buf = [0u8; 11];
        pool.read_frame(
            crate::memory::Frame::containing(child_entry.address()),
            0,
            &mut buf,
        );
        assert_eq!(&buf, b"parent data");
    }

    #[test]
    fn munmap_splits_regions_and_delivers_shootdowns() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let other = LogicalCpuId::new(1);
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        space.used_by.atomic_set(cpu);
        space.used_by.atomic_set(other);

        let mut req = MapRequest::new(4, rw());
        req.populate = true;
        let base = space.mmap(cpu, anon(&pool, 4), req).unwrap();
        assert!(space.table().translate(cpu, base.next()).is_some());

        let before = pool.tlb_invalidation_count(other);
        space.munmap(cpu, PageSpan::new(base.next(), 2)).unwrap();
        assert_eq!(pool.tlb_invalidation_count(other), before + 1);

        // The middle is gone, the flanks survive.
        assert!(space.table().translate(cpu, base).is_some());
        assert!(space.table().translate(cpu, base.next()).is_none());
        assert!(space.table().translate(cpu, base.next_by(2)).is_none());
        assert!(space.table().translate(cpu, base.next_by(3)).is_some());

        // And both flanks are still independently unmappable regions.
        let inner = space.inner.read();
        assert_eq!(inner.regions.len(), 2);
    }

    #[test]
    fn mprotect_rewrites_present_leaves() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        let base = space
            .mmap(cpu, anon(&pool, 2), MapRequest::new(2, rw()))
            .unwrap();
        space
            .try_correcting_page_tables(cpu, base, AccessMode::Write)
            .unwrap();
        assert!(space.table().translate(cpu, base).unwrap().writable());

        space
            .mprotect(
                cpu,
                PageSpan::new(base, 2),
                PageFlags::READ | PageFlags::USER,
            )
            .unwrap();
        assert!(!space.table().translate(cpu, base).unwrap().writable());

        // Writes now fault as violations.
        assert_eq!(
            space.try_correcting_page_tables(cpu, base, AccessMode::Write),
            Err(PfError::Segv)
        );

        // Restoring permissions within the original grant is allowed.
        space.mprotect(cpu, PageSpan::new(base, 2), rw()).unwrap();
        space
            .try_correcting_page_tables(cpu, base, AccessMode::Write)
            .unwrap();

        // A span reaching past the mapped area is refused untouched.
        assert_eq!(
            space.mprotect(cpu, PageSpan::new(base, 3), rw()),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn mprotect_cannot_escalate_past_the_grant() {
        let (pool, kernel) = machine();
        let cpu = LogicalCpuId::BSP;
        let space = AddrSpace::new(&kernel, cpu).unwrap();
        let base = space
            .mmap(
                cpu,
                anon(&pool, 1),
                MapRequest::new(1, PageFlags::READ | PageFlags::USER),
            )
            .unwrap();
        assert_eq!(
            space.mprotect(cpu, PageSpan::new(base, 1), rw()),
            Err(Error::InvalidArgument)
        );
    }
}
