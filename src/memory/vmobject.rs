//! # VMObject family
//!
//! A VMObject owns the backing store of one or more mappings: an ordered
//! array of physical-page ownership slots, one per page. The slot count is
//! fixed at creation; a slot transitions Unbacked to Backed exactly once.
//!
//! Ownership per slot is an explicit tagged state, so the copy-on-write
//! trigger is a visible branch instead of implicit pointer aliasing.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use spin::Mutex;

use super::{AddRefError, Frame, PageHandle, PhysicalMemory, RefCount, RefKind};
use crate::{
    cpu_set::LogicalCpuId,
    error::{Error, Result},
    fault::{AccessMode, PfError},
    paging::{PAGE_SIZE, round_up_pages},
    sync::RecursiveSpinlock,
};
use core::sync::atomic::{AtomicBool, Ordering};

/// How an anonymous VMObject obtains its frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Every slot is backed before creation returns; fails atomically.
    AllocateNow,
    /// Slots start unbacked and are populated by page faults.
    AllocateOnDemand,
}

/// Ownership state of one backing slot.
#[derive(Debug)]
pub enum PageSlot {
    /// No frame yet; first access will populate it.
    Unbacked,
    /// A private frame, writable through this object alone.
    Exclusive(PageHandle),
    /// A frame shared copy-on-write with other objects; a write must break
    /// the share first.
    SharedCow(PageHandle),
    /// The global zeroed frame, mapped read-only; a write allocates a
    /// private zero page.
    SharedZero(PageHandle),
}

impl PageSlot {
    pub fn frame(&self) -> Option<Frame> {
        match self {
            PageSlot::Unbacked => None,
            PageSlot::Exclusive(h) | PageSlot::SharedCow(h) | PageSlot::SharedZero(h) => {
                Some(h.get())
            }
        }
    }
    pub fn is_backed(&self) -> bool {
        !matches!(self, PageSlot::Unbacked)
    }
}

/// The result of backing a slot for a fault: which frame to install, and
/// whether the hardware mapping may be writable right away.
#[derive(Clone, Copy, Debug)]
pub struct BackedPage {
    pub frame: Frame,
    pub writable: bool,
}

/// The backing store of a mapping. Implementations own the frame slots;
/// regions reference an object through `Arc` and several regions (or address
/// spaces) may share one object.
pub trait VmObject: Send + Sync {
    fn page_count(&self) -> usize;

    /// Whether this is private anonymous memory, i.e. whether fork gives the
    /// child a copy-on-write clone instead of the object itself.
    fn is_anonymous(&self) -> bool {
        false
    }

    /// The frame currently backing `index`, if any.
    fn physical_page(&self, index: usize) -> Option<Frame>;

    /// Whether a writable hardware mapping of `index` is currently
    /// permissible (false while the slot is shared copy-on-write).
    fn mapping_writable(&self, index: usize) -> bool;

    /// Backs `index` if needed and resolves copy-on-write for writes.
    fn ensure_backed(&self, index: usize, mode: AccessMode)
    -> core::result::Result<BackedPage, PfError>;

    /// The object to hand to a forked address space: a COW clone for private
    /// anonymous memory, the same object for shared mappings.
    fn try_clone_for_fork(self: Arc<Self>) -> Result<Arc<dyn VmObject>>;
}

/// Anonymous demand-zero memory, the mmap/fork workhorse.
pub struct AnonymousVmObject {
    pool: Arc<PhysicalMemory>,
    slots: Mutex<Vec<PageSlot>>,
}

impl AnonymousVmObject {
    /// Creates an object covering `size` bytes (rounded up to whole pages;
    /// zero is valid and yields an empty object).
    ///
    /// With [`AllocationStrategy::AllocateNow`] the commit is atomic: frames
    /// are staged first and either all slots become backed or the call fails
    /// with `OutOfMemory` and every staged frame is back on the free list.
    pub fn try_create_with_size(
        pool: &Arc<PhysicalMemory>,
        size: usize,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Self>> {
        let count = round_up_pages(size) / PAGE_SIZE;
        let slots = match strategy {
            AllocationStrategy::AllocateOnDemand => {
                (0..count).map(|_| PageSlot::Unbacked).collect()
            }
            AllocationStrategy::AllocateNow => {
                let mut staged = Vec::with_capacity(count);
                for _ in 0..count {
                    // Failure drops `staged`, returning every frame.
                    staged.push(PageHandle::allocate_zeroed(pool)?);
                }
                staged.into_iter().map(PageSlot::Exclusive).collect()
            }
        };
        Ok(Arc::new(Self {
            pool: Arc::clone(pool),
            slots: Mutex::new(slots),
        }))
    }

    /// COW fork primitive: the clone references the same frames, re-tagged
    /// `SharedCow` on both sides. The actual copy happens at write-fault
    /// time.
    pub fn try_clone(&self) -> Result<Arc<Self>> {
        let mut slots = self.slots.lock();
        let mut child: Vec<PageSlot> = Vec::with_capacity(slots.len());

        for slot in slots.iter() {
            let cloned = match slot {
                PageSlot::Unbacked => PageSlot::Unbacked,
                PageSlot::Exclusive(h) | PageSlot::SharedCow(h) => {
                    self.share_frame(h.get(), RefKind::Cow)
                        .map(PageSlot::SharedCow)?
                }
                PageSlot::SharedZero(h) => self
                    .share_frame(h.get(), RefKind::Shared)
                    .map(PageSlot::SharedZero)?,
            };
            child.push(cloned);
        }

        // Only now that every child slot is staged, re-tag the parent side.
        for slot in slots.iter_mut() {
            if matches!(slot, PageSlot::Exclusive(_)) {
                let PageSlot::Exclusive(h) = core::mem::replace(slot, PageSlot::Unbacked) else {
                    unreachable!();
                };
                *slot = PageSlot::SharedCow(h);
            }
        }

        Ok(Arc::new(Self {
            pool: Arc::clone(&self.pool),
            slots: Mutex::new(child),
        }))
    }

    fn share_frame(&self, frame: Frame, kind: RefKind) -> Result<PageHandle> {
        let info = self
            .pool
            .get_page_info(frame)
            .expect("anonymous slot frame lacking PageInfo");
        info.add_ref(kind).map_err(|err| match err {
            AddRefError::RcOverflow => Error::OutOfMemory,
            // A slot is either COW-shared or zero-shared, never both.
            AddRefError::CowToShared | AddRefError::SharedToCow => {
                panic!("anonymous slot sharing kind changed under us")
            }
        })?;
        Ok(unsafe { PageHandle::new_unchecked(Arc::clone(&self.pool), frame) })
    }

    /// Resolves a write to `slot`: allocates on demand, breaks COW shares.
    fn make_exclusive(&self, slot: &mut PageSlot) -> core::result::Result<Frame, PfError> {
        let taken = core::mem::replace(slot, PageSlot::Unbacked);
        let exclusive = match taken {
            PageSlot::Unbacked => {
                PageHandle::allocate_zeroed(&self.pool).map_err(|_| PfError::Oom)?
            }
            PageSlot::Exclusive(h) => h,
            PageSlot::SharedCow(h) => {
                let info = self
                    .pool
                    .get_page_info(h.get())
                    .expect("COW frame lacking PageInfo");
                match info.refcount() {
                    // Every other sharer already broke away; steal the frame.
                    Some(RefCount::One) => h,
                    _ => {
                        let fresh = match PageHandle::allocate(&self.pool) {
                            Ok(fresh) => fresh,
                            Err(_) => {
                                *slot = PageSlot::SharedCow(h);
                                return Err(PfError::Oom);
                            }
                        };
                        self.pool.copy_frame(fresh.get(), h.get());
                        fresh
                    }
                }
            }
            PageSlot::SharedZero(h) => {
                let fresh = match PageHandle::allocate_zeroed(&self.pool) {
                    Ok(fresh) => fresh,
                    Err(_) => {
                        *slot = PageSlot::SharedZero(h);
                        return Err(PfError::Oom);
                    }
                };
                fresh
            }
        };
        let frame = exclusive.get();
        *slot = PageSlot::Exclusive(exclusive);
        Ok(frame)
    }
}

impl VmObject for AnonymousVmObject {
    fn page_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn is_anonymous(&self) -> bool {
        true
    }

    fn physical_page(&self, index: usize) -> Option<Frame> {
        self.slots.lock().get(index)?.frame()
    }

    fn mapping_writable(&self, index: usize) -> bool {
        matches!(self.slots.lock().get(index), Some(PageSlot::Exclusive(_)))
    }

    fn ensure_backed(
        &self,
        index: usize,
        mode: AccessMode,
    ) -> core::result::Result<BackedPage, PfError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(PfError::Segv)?;

        match mode {
            AccessMode::Write => {
                let frame = self.make_exclusive(slot)?;
                Ok(BackedPage {
                    frame,
                    writable: true,
                })
            }
            AccessMode::Read | AccessMode::InstrFetch => {
                if let PageSlot::Unbacked = slot {
                    // Demand-zero read: share the global zeroed frame until
                    // the first write.
                    let handle = self
                        .share_frame(self.pool.the_zeroed_frame(), RefKind::Shared)
                        .map_err(|_| PfError::Oom)?;
                    *slot = PageSlot::SharedZero(handle);
                }
                Ok(BackedPage {
                    frame: slot.frame().expect("slot backed above"),
                    writable: matches!(slot, PageSlot::Exclusive(_)),
                })
            }
        }
    }

    fn try_clone_for_fork(self: Arc<Self>) -> Result<Arc<dyn VmObject>> {
        Ok(AnonymousVmObject::try_clone(&self)? as Arc<dyn VmObject>)
    }
}

/// Page-in/page-out callbacks supplied by the filesystem layer.
pub trait BlockBacking: Send + Sync {
    fn read_page(&self, index: usize, buf: &mut [u8]) -> Result<()>;
    fn write_page(&self, index: usize, buf: &[u8]) -> Result<()>;
}

/// File-backed memory shared by every mapper of the same inode.
pub struct InodeVmObject {
    pool: Arc<PhysicalMemory>,
    backing: Box<dyn BlockBacking>,
    slots: Mutex<Vec<PageSlot>>,
}

impl InodeVmObject {
    pub fn try_create(
        pool: &Arc<PhysicalMemory>,
        backing: Box<dyn BlockBacking>,
        size: usize,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Self>> {
        let count = round_up_pages(size) / PAGE_SIZE;
        let slots = match strategy {
            AllocationStrategy::AllocateOnDemand => {
                (0..count).map(|_| PageSlot::Unbacked).collect()
            }
            AllocationStrategy::AllocateNow => {
                let mut staged = Vec::with_capacity(count);
                for index in 0..count {
                    let handle = PageHandle::allocate(pool)?;
                    let mut buf = [0u8; PAGE_SIZE];
                    backing.read_page(index, &mut buf)?;
                    pool.write_frame(handle.get(), 0, &buf);
                    staged.push(handle);
                }
                staged.into_iter().map(PageSlot::Exclusive).collect()
            }
        };
        Ok(Arc::new(Self {
            pool: Arc::clone(pool),
            backing,
            slots: Mutex::new(slots),
        }))
    }

    /// Writes every backed page back through the filesystem callbacks, the
    /// page-out half of the backing interface.
    pub fn flush(&self) -> Result<()> {
        let slots = self.slots.lock();
        for (index, slot) in slots.iter().enumerate() {
            if let Some(frame) = slot.frame() {
                let mut buf = [0u8; PAGE_SIZE];
                self.pool.read_frame(frame, 0, &mut buf);
                self.backing.write_page(index, &buf)?;
            }
        }
        Ok(())
    }
}

impl VmObject for InodeVmObject {
    fn page_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn physical_page(&self, index: usize) -> Option<Frame> {
        self.slots.lock().get(index)?.frame()
    }

    fn mapping_writable(&self, index: usize) -> bool {
        // Shared file pages are written in place; write-back goes through
        // flush().
        self.slots
            .lock()
            .get(index)
            .is_some_and(|slot| slot.is_backed())
    }

    fn ensure_backed(
        &self,
        index: usize,
        _mode: AccessMode,
    ) -> core::result::Result<BackedPage, PfError> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(PfError::Segv)?;

        if let PageSlot::Unbacked = slot {
            let handle = PageHandle::allocate(&self.pool).map_err(|_| PfError::Oom)?;
            let mut buf = [0u8; PAGE_SIZE];
            self.backing
                .read_page(index, &mut buf)
                .map_err(|_| PfError::NonfatalInternalError)?;
            self.pool.write_frame(handle.get(), 0, &buf);
            *slot = PageSlot::Exclusive(handle);
        }
        Ok(BackedPage {
            frame: slot.frame().expect("slot backed above"),
            writable: true,
        })
    }

    fn try_clone_for_fork(self: Arc<Self>) -> Result<Arc<dyn VmObject>> {
        // Inode mappings are shared; a fork maps the same object.
        Ok(self)
    }
}

/// A framebuffer with two facades over one committed frame array.
///
/// While "fake writes" mode is on, the switching view exposes a throwaway
/// shadow page instead of the committed frames, so whatever writes land
/// there never reach the display. The switch is taken under a recursive
/// spinlock because interrupt-time display code can re-enter it.
pub struct FramebufferVmObject {
    pool: Arc<PhysicalMemory>,
    committed: Vec<PageHandle>,
    shadow: PageHandle,
    fake_writes: AtomicBool,
    switch_lock: RecursiveSpinlock<()>,
}

impl FramebufferVmObject {
    pub fn try_create(pool: &Arc<PhysicalMemory>, size: usize) -> Result<Arc<Self>> {
        let count = round_up_pages(size) / PAGE_SIZE;
        let mut committed = Vec::with_capacity(count);
        for _ in 0..count {
            committed.push(PageHandle::allocate_zeroed(pool)?);
        }
        Ok(Arc::new(Self {
            pool: Arc::clone(pool),
            committed,
            shadow: PageHandle::allocate_zeroed(pool)?,
            fake_writes: AtomicBool::new(false),
            switch_lock: RecursiveSpinlock::new(()),
        }))
    }

    /// Switches the fake-writes mode. Safe to call re-entrantly on the same
    /// CPU. Existing hardware mappings of the switching view must be shot
    /// down by the caller so subsequent faults pick up the new target.
    pub fn set_fake_writes(&self, cpu: LogicalCpuId, fake: bool) {
        let _guard = self.switch_lock.lock(cpu);
        if fake && !self.fake_writes.swap(fake, Ordering::Release) {
            // Entering fake mode: start from a clean throwaway page.
            self.pool.zero_frame(self.shadow.get());
        } else {
            self.fake_writes.store(fake, Ordering::Release);
        }
    }

    pub fn fake_writes(&self) -> bool {
        self.fake_writes.load(Ordering::Acquire)
    }

    /// The facade the display controller scans out from: always the
    /// committed frames, regardless of mode.
    pub fn real_view(self: &Arc<Self>) -> Arc<FramebufferView> {
        Arc::new(FramebufferView {
            object: Arc::clone(self),
            follow_mode: false,
        })
    }

    /// The facade handed to clients: honors the fake-writes switch.
    pub fn switching_view(self: &Arc<Self>) -> Arc<FramebufferView> {
        Arc::new(FramebufferView {
            object: Arc::clone(self),
            follow_mode: true,
        })
    }
}

/// One of the two facades over a [`FramebufferVmObject`].
pub struct FramebufferView {
    object: Arc<FramebufferVmObject>,
    follow_mode: bool,
}

impl FramebufferView {
    fn frame_for(&self, index: usize) -> Option<Frame> {
        if self.follow_mode && self.object.fake_writes() {
            Some(self.object.shadow.get())
        } else {
            Some(self.object.committed.get(index)?.get())
        }
    }
}

impl VmObject for FramebufferView {
    fn page_count(&self) -> usize {
        self.object.committed.len()
    }

    fn physical_page(&self, index: usize) -> Option<Frame> {
        if index >= self.object.committed.len() {
            return None;
        }
        self.frame_for(index)
    }

    fn mapping_writable(&self, _index: usize) -> bool {
        true
    }

    fn ensure_backed(
        &self,
        index: usize,
        _mode: AccessMode,
    ) -> core::result::Result<BackedPage, PfError> {
        if index >= self.object.committed.len() {
            return Err(PfError::Segv);
        }
        Ok(BackedPage {
            frame: self.frame_for(index).expect("bounds checked above"),
            writable: true,
        })
    }

    fn try_clone_for_fork(self: Arc<Self>) -> Result<Arc<dyn VmObject>> {
        // Device memory is shared with the child as-is.
        Ok(self)
    }
}
