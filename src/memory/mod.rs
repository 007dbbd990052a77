//! # Physical memory management
//!
//! The frame pool: per-frame refcounting ([`PageInfo`]), the spinlock-guarded
//! free list, and RAII frame ownership ([`PageHandle`]).
//!
//! Frame contents live in an arena owned by [`PhysicalMemory`]; a physical
//! address is an offset into it. The pool also carries the small amount of
//! per-machine hardware state the paging code needs (quickmap scratch slots,
//! TLB invalidation delivery), so several machines can coexist in one test
//! process.

pub mod vmobject;

use core::{
    cell::UnsafeCell,
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use spin::Mutex;

use crate::{
    cpu_set::{LogicalCpuId, MAX_CPU_COUNT},
    error::{Error, Result},
    fault::PfError,
    paging::{PAGE_MASK, PAGE_SIZE, PhysicalAddress},
};

bitflags! {
    pub struct AllocationFlags: u32 {
        const ZEROED = 1 << 0;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame {
    physaddr: NonZeroUsize,
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[frame at {:#x}]", self.base().data())
    }
}

impl Frame {
    pub fn containing(address: PhysicalAddress) -> Frame {
        Frame {
            physaddr: NonZeroUsize::new(address.data() & !PAGE_MASK)
                .expect("frame 0x0 is reserved"),
        }
    }
    pub fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.physaddr.get())
    }
    pub fn next_by(self, n: usize) -> Self {
        Self {
            physaddr: self
                .physaddr
                .checked_add(n * PAGE_SIZE)
                .expect("frame address overflow"),
        }
    }
    pub fn offset_from(self, from: Self) -> usize {
        (self.physaddr.get() - from.physaddr.get()) / PAGE_SIZE
    }
}

const RC_USED_NOT_FREE: usize = 1 << (usize::BITS - 1);
const RC_SHARED_NOT_COW: usize = 1 << (usize::BITS - 2);
const RC_PINNED: usize = 1 << (usize::BITS - 3);
const RC_MAX: usize = 1 << (usize::BITS - 4);
const RC_FLAG_MASK: usize = RC_USED_NOT_FREE | RC_SHARED_NOT_COW | RC_PINNED;

#[derive(Debug, PartialEq)]
pub enum PageInfoState {
    Free,
    Used,
}

/// Per-frame metadata: one atomic word encoding Free/Used, the reference
/// count, the COW-vs-shared kind, and the pinned ("may not return to the
/// free list") bit used for firmware- and boot-owned frames.
#[derive(Debug)]
pub struct PageInfo {
    refcount: AtomicUsize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RefKind {
    Cow,
    Shared,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RefCount {
    One,
    Shared(NonZeroUsize),
    Cow(NonZeroUsize),
}

impl RefCount {
    pub fn from_raw(raw: usize) -> Option<Self> {
        if raw & RC_USED_NOT_FREE != RC_USED_NOT_FREE {
            return None;
        }
        let nz_refcount = NonZeroUsize::new(raw & !RC_FLAG_MASK)?;

        Some(if nz_refcount.get() == 1 {
            RefCount::One
        } else if raw & RC_SHARED_NOT_COW == RC_SHARED_NOT_COW {
            RefCount::Shared(nz_refcount)
        } else {
            RefCount::Cow(nz_refcount)
        })
    }
    pub fn to_raw(self) -> usize {
        match self {
            Self::One => 1 | RC_USED_NOT_FREE,
            Self::Shared(inner) => inner.get() | RC_SHARED_NOT_COW | RC_USED_NOT_FREE,
            Self::Cow(inner) => inner.get() | RC_USED_NOT_FREE,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum AddRefError {
    CowToShared,
    SharedToCow,
    RcOverflow,
}

impl PageInfo {
    const fn free() -> Self {
        Self {
            refcount: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> PageInfoState {
        if self.refcount.load(Ordering::Relaxed) & RC_USED_NOT_FREE == RC_USED_NOT_FREE {
            PageInfoState::Used
        } else {
            PageInfoState::Free
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.refcount.load(Ordering::Relaxed) & RC_PINNED != 0
    }

    /// Marks the frame as never returnable to the free list. Releasing the
    /// last reference to a pinned frame leaks it; such frames are finite and
    /// bounded at boot.
    pub fn pin(&self) {
        self.refcount.fetch_or(RC_PINNED, Ordering::Relaxed);
    }

    pub fn add_ref(&self, kind: RefKind) -> core::result::Result<(), AddRefError> {
        if self.state() != PageInfoState::Used {
            panic!("cannot add_ref to a Free frame");
        }
        let pinned = self.refcount.load(Ordering::Relaxed) & RC_PINNED;

        match (self.refcount().expect("state checked above"), kind) {
            (RefCount::One, RefKind::Cow) => self
                .refcount
                .store(RC_USED_NOT_FREE | 2 | pinned, Ordering::Relaxed),
            (RefCount::One, RefKind::Shared) => self.refcount.store(
                RC_USED_NOT_FREE | 2 | RC_SHARED_NOT_COW | pinned,
                Ordering::Relaxed,
            ),
            (RefCount::Cow(_), RefKind::Cow) | (RefCount::Shared(_), RefKind::Shared) => {
                let old = self.refcount.fetch_add(1, Ordering::Relaxed);
                if (old & !RC_FLAG_MASK) >= RC_MAX {
                    self.refcount.fetch_sub(1, Ordering::Relaxed);
                    return Err(AddRefError::RcOverflow);
                }
            }
            (RefCount::Cow(_), RefKind::Shared) => return Err(AddRefError::CowToShared),
            (RefCount::Shared(_), RefKind::Cow) => return Err(AddRefError::SharedToCow),
        }
        Ok(())
    }

    #[must_use = "must deallocate if refcount reaches None"]
    pub fn remove_ref(&self) -> Option<RefCount> {
        if self.state() != PageInfoState::Used {
            panic!("cannot remove_ref from a Free frame");
        }

        match self.refcount() {
            None => panic!("refcount was already zero when calling remove_ref"),
            Some(RefCount::One) => {
                let pinned = self.refcount.load(Ordering::Relaxed) & RC_PINNED;
                self.refcount
                    .store(RC_USED_NOT_FREE | pinned, Ordering::Relaxed);
                None
            }
            Some(RefCount::Cow(_) | RefCount::Shared(_)) => {
                RefCount::from_raw(self.refcount.fetch_sub(1, Ordering::Relaxed) - 1)
            }
        }
    }

    pub fn refcount(&self) -> Option<RefCount> {
        RefCount::from_raw(self.refcount.load(Ordering::Relaxed))
    }
}

/// One frame of backing storage, page aligned like the real thing.
#[repr(align(4096))]
#[derive(Debug)]
struct FrameStorage(UnsafeCell<[u8; PAGE_SIZE]>);

#[derive(Debug)]
struct FreeList {
    free: Vec<usize>,
    used_frames: usize,
}

/// The physical frame pool for one machine.
///
/// Free-list mutation is guarded by a spinlock so it is safe from
/// interrupt-disabled sections; frame contents are reached through raw
/// pointers, with exclusivity guaranteed by the refcount discipline (a frame
/// is written through at most one owner, copy-on-write enforces that before
/// any content write).
#[derive(Debug)]
pub struct PhysicalMemory {
    storage: Box<[FrameStorage]>,
    infos: Box<[PageInfo]>,
    freelist: Mutex<FreeList>,
    zeroed: spin::Once<Frame>,
    /// Per-CPU quickmap scratch-slot occupancy; see `paging::directory`.
    quickmap_busy: [AtomicBool; MAX_CPU_COUNT as usize],
    /// Per-CPU count of delivered TLB invalidation IPIs.
    tlb_delivered: [AtomicUsize; MAX_CPU_COUNT as usize],
}

// Safety: the UnsafeCell arena is only reached through the accessors below,
// whose callers hold frame ownership via PageInfo refcounts or the free-list
// lock.
unsafe impl Sync for PhysicalMemory {}
unsafe impl Send for PhysicalMemory {}

impl PhysicalMemory {
    /// Builds the pool from a boot-time machine description: `frame_count`
    /// total frames, of which the first `reserved` are firmware/boot owned
    /// and pinned from the start.
    ///
    /// One further frame is taken for the shared zeroed frame.
    pub fn new(frame_count: usize, reserved: usize) -> Result<Self> {
        if frame_count == 0 || reserved + 1 >= frame_count {
            return Err(Error::InvalidArgument);
        }

        let storage: Box<[FrameStorage]> = (0..frame_count)
            .map(|_| FrameStorage(UnsafeCell::new([0; PAGE_SIZE])))
            .collect();
        let infos: Box<[PageInfo]> = (0..frame_count).map(|_| PageInfo::free()).collect();

        for info in &infos[..reserved] {
            info.refcount
                .store(RefCount::One.to_raw() | RC_PINNED, Ordering::Relaxed);
        }

        let pool = Self {
            storage,
            infos,
            freelist: Mutex::new(FreeList {
                free: (reserved..frame_count).rev().collect(),
                used_frames: reserved,
            }),
            zeroed: spin::Once::new(),
            quickmap_busy: [const { AtomicBool::new(false) }; MAX_CPU_COUNT as usize],
            tlb_delivered: [const { AtomicUsize::new(0) }; MAX_CPU_COUNT as usize],
        };

        let the_frame = pool
            .init_frame(RefCount::One)
            .map_err(|_| Error::OutOfMemory)?;
        pool.zero_frame(the_frame);
        let the_info = pool
            .get_page_info(the_frame)
            .expect("zeroed frame must have a PageInfo");
        the_info.pin();
        pool.zeroed.call_once(|| the_frame);

        Ok(pool)
    }

    fn frame_index(&self, frame: Frame) -> Option<usize> {
        let idx = (frame.base().data() / PAGE_SIZE).checked_sub(1)?;
        (idx < self.storage.len()).then_some(idx)
    }
    fn frame_at(&self, index: usize) -> Frame {
        Frame::containing(PhysicalAddress::new((index + 1) * PAGE_SIZE))
    }

    pub fn get_page_info(&self, frame: Frame) -> Option<&PageInfo> {
        self.infos.get(self.frame_index(frame)?)
    }

    pub fn total_frames(&self) -> usize {
        self.storage.len()
    }
    pub fn used_frames(&self) -> usize {
        self.freelist.lock().used_frames
    }
    pub fn free_frames(&self) -> usize {
        self.total_frames() - self.used_frames()
    }

    /// The all-zero frame shared by untouched demand-paged slots.
    pub fn the_zeroed_frame(&self) -> Frame {
        *self
            .zeroed
            .get()
            .expect("zeroed frame must be initialized")
    }

    pub fn allocate_frame(&self, flags: AllocationFlags) -> Option<Frame> {
        let frame;
        {
            let mut freelist = self.freelist.lock();
            let index = freelist.free.pop()?;
            debug_assert_eq!(self.infos[index].state(), PageInfoState::Free);
            self.infos[index]
                .refcount
                .store(RC_USED_NOT_FREE, Ordering::Relaxed);
            freelist.used_frames += 1;
            frame = self.frame_at(index);
        }
        if flags.contains(AllocationFlags::ZEROED) {
            self.zero_frame(frame);
        }
        Some(frame)
    }

    /// Allocates `count` physically contiguous frames, returning the base.
    /// Each frame is individually refcounted (state Used, count zero).
    pub fn allocate_contiguous(&self, count: usize, flags: AllocationFlags) -> Option<Frame> {
        if count == 0 {
            return None;
        }
        let base;
        {
            let mut freelist = self.freelist.lock();
            let start = (0..self.infos.len().checked_sub(count - 1)?).find(|&start| {
                self.infos[start..start + count]
                    .iter()
                    .all(|info| info.state() == PageInfoState::Free)
            })?;
            for info in &self.infos[start..start + count] {
                info.refcount.store(RC_USED_NOT_FREE, Ordering::Relaxed);
            }
            freelist
                .free
                .retain(|&i| !(start..start + count).contains(&i));
            freelist.used_frames += count;
            base = self.frame_at(start);
        }
        if flags.contains(AllocationFlags::ZEROED) {
            for i in 0..count {
                self.zero_frame(base.next_by(i));
            }
        }
        Some(base)
    }

    /// Returns a frame to the free list.
    ///
    /// # Safety
    ///
    /// The frame must be in the Used state with no remaining references, and
    /// the caller must be its last owner.
    pub unsafe fn deallocate_frame(&self, frame: Frame) {
        let info = self
            .get_page_info(frame)
            .unwrap_or_else(|| panic!("missing PageInfo for {frame:?} being freed"));
        assert_eq!(
            info.state(),
            PageInfoState::Used,
            "attempted to free frame {frame:?} which is not in Used state"
        );
        assert!(!info.is_pinned(), "attempted to free pinned frame {frame:?}");

        let mut freelist = self.freelist.lock();
        info.refcount.store(0, Ordering::Relaxed);
        let index = self.frame_index(frame).expect("index checked above");
        freelist.free.push(index);
        freelist.used_frames -= 1;
    }

    /// Allocates a frame and initializes its refcount.
    pub fn init_frame(&self, init_rc: RefCount) -> core::result::Result<Frame, PfError> {
        let new_frame = self
            .allocate_frame(AllocationFlags::empty())
            .ok_or(PfError::Oom)?;
        let page_info = self
            .get_page_info(new_frame)
            .unwrap_or_else(|| panic!("all allocated frames need a PageInfo, {new_frame:?} didn't"));
        debug_assert_eq!(page_info.state(), PageInfoState::Used);
        page_info.refcount.store(init_rc.to_raw(), Ordering::Relaxed);
        Ok(new_frame)
    }

    fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        let index = self
            .frame_index(frame)
            .unwrap_or_else(|| panic!("{frame:?} is outside the pool"));
        self.storage[index].0.get().cast()
    }

    /// Reads frame contents. `offset + buf.len()` must stay within the page.
    pub fn read_frame(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(frame).add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    /// Writes frame contents. `offset + data.len()` must stay within the
    /// page. The caller must hold exclusive write ownership of the frame.
    pub fn write_frame(&self, frame: Frame, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.frame_ptr(frame).add(offset),
                data.len(),
            );
        }
    }

    pub fn zero_frame(&self, frame: Frame) {
        unsafe {
            self.frame_ptr(frame).write_bytes(0, PAGE_SIZE);
        }
    }

    /// Copies a whole page, the copy half of a copy-on-write break.
    pub fn copy_frame(&self, dst: Frame, src: Frame) {
        unsafe {
            core::ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_SIZE);
        }
    }

    pub(crate) fn claim_quickmap_slot(&self, cpu: LogicalCpuId) {
        let claimed = self.quickmap_busy[cpu.get() as usize]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        assert!(claimed, "quickmap slot of {cpu:?} already occupied");
    }
    pub(crate) fn release_quickmap_slot(&self, cpu: LogicalCpuId) {
        self.quickmap_busy[cpu.get() as usize].store(false, Ordering::Release);
    }

    /// Records delivery of a TLB invalidation IPI to `cpu`.
    pub(crate) fn deliver_tlb_invalidation(&self, cpu: LogicalCpuId) {
        self.tlb_delivered[cpu.get() as usize].fetch_add(1, Ordering::Relaxed);
    }
    /// How many TLB invalidations `cpu` has received so far.
    pub fn tlb_invalidation_count(&self, cpu: LogicalCpuId) -> usize {
        self.tlb_delivered[cpu.get() as usize].load(Ordering::Relaxed)
    }
}

/// RAII strong reference to one frame.
///
/// Dropping the handle removes one reference; at refcount zero the frame
/// returns to the free list, unless its [`PageInfo`] is pinned, in which case
/// the release is a deliberate bounded leak.
#[derive(Debug)]
pub struct PageHandle {
    pool: Arc<PhysicalMemory>,
    frame: Frame,
}

impl PageHandle {
    pub fn allocate(pool: &Arc<PhysicalMemory>) -> Result<Self> {
        let frame = pool
            .init_frame(RefCount::One)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            pool: Arc::clone(pool),
            frame,
        })
    }

    pub fn allocate_zeroed(pool: &Arc<PhysicalMemory>) -> Result<Self> {
        let handle = Self::allocate(pool)?;
        pool.zero_frame(handle.frame);
        Ok(handle)
    }

    /// Allocates `count` physically contiguous zeroed frames as individually
    /// owned handles, in ascending physical order.
    pub fn allocate_contiguous(pool: &Arc<PhysicalMemory>, count: usize) -> Result<Vec<Self>> {
        let base = pool
            .allocate_contiguous(count, AllocationFlags::ZEROED)
            .ok_or(Error::OutOfMemory)?;
        Ok((0..count)
            .map(|i| {
                let frame = base.next_by(i);
                let info = pool
                    .get_page_info(frame)
                    .expect("contiguous frames must have PageInfos");
                info.refcount
                    .store(RefCount::One.to_raw(), Ordering::Relaxed);
                Self {
                    pool: Arc::clone(pool),
                    frame,
                }
            })
            .collect())
    }

    /// Adopts a frame whose reference the caller already owns.
    ///
    /// # Safety
    ///
    /// The frame must be Used, with one reference belonging to the caller.
    pub unsafe fn new_unchecked(pool: Arc<PhysicalMemory>, frame: Frame) -> Self {
        Self { pool, frame }
    }

    pub fn get(&self) -> Frame {
        self.frame
    }

    /// Releases ownership without dropping the reference.
    pub fn take(self) -> Frame {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let info = self
            .pool
            .get_page_info(self.frame)
            .expect("PageHandle frame lacking PageInfo");
        if info.remove_ref().is_none() && !info.is_pinned() {
            unsafe {
                self.pool.deallocate_frame(self.frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: usize) -> Arc<PhysicalMemory> {
        Arc::new(PhysicalMemory::new(frames, 0).expect("pool"))
    }

    #[test]
    fn released_frames_return_to_the_free_pool() {
        let pool = pool(8);
        let before = pool.free_frames();
        let handle = PageHandle::allocate(&pool).unwrap();
        assert_eq!(pool.free_frames(), before - 1);
        drop(handle);
        assert_eq!(pool.free_frames(), before);
    }

    #[test]
    fn pinned_frames_never_return() {
        let pool = pool(8);
        let before = pool.free_frames();
        let handle = PageHandle::allocate(&pool).unwrap();
        let frame = handle.get();
        pool.get_page_info(frame).unwrap().pin();
        drop(handle);
        // Leaked by design; the frame stays out of the pool.
        assert_eq!(pool.free_frames(), before - 1);
        assert_eq!(
            pool.get_page_info(frame).unwrap().state(),
            PageInfoState::Used
        );
    }

    #[test]
    fn boot_reserved_frames_are_pinned_and_unallocatable() {
        let pool = Arc::new(PhysicalMemory::new(8, 2).unwrap());
        // 8 total, 2 reserved, 1 zeroed frame.
        assert_eq!(pool.free_frames(), 5);
        let first = Frame::containing(PhysicalAddress::new(PAGE_SIZE));
        assert!(pool.get_page_info(first).unwrap().is_pinned());
    }

    #[test]
    fn contiguous_allocation_is_contiguous() {
        let pool = pool(16);
        let base = pool
            .allocate_contiguous(4, AllocationFlags::ZEROED)
            .unwrap();
        for i in 0..4 {
            let frame = base.next_by(i);
            assert_eq!(frame.offset_from(base), i);
            assert_eq!(
                pool.get_page_info(frame).unwrap().state(),
                PageInfoState::Used
            );
        }
        // And it is exhausted properly.
        assert!(pool.allocate_contiguous(64, AllocationFlags::empty()).is_none());
    }

    #[test]
    fn cow_refcount_transitions() {
        let pool = pool(8);
        let handle = PageHandle::allocate(&pool).unwrap();
        let info = pool.get_page_info(handle.get()).unwrap();
        assert_eq!(info.refcount(), Some(RefCount::One));

        info.add_ref(RefKind::Cow).unwrap();
        assert!(matches!(info.refcount(), Some(RefCount::Cow(n)) if n.get() == 2));
        assert_eq!(info.add_ref(RefKind::Shared), Err(AddRefError::CowToShared));

        assert_eq!(info.remove_ref(), Some(RefCount::One));
        drop(handle);
    }

    #[test]
    fn frame_contents_are_addressable() {
        let pool = pool(8);
        let a = PageHandle::allocate_zeroed(&pool).unwrap();
        let b = PageHandle::allocate_zeroed(&pool).unwrap();
        pool.write_frame(a.get(), 100, b"pattern");
        pool.copy_frame(b.get(), a.get());

        let mut buf = [0u8; 7];
        pool.read_frame(b.get(), 100, &mut buf);
        assert_eq!(&buf, b"pattern");

        pool.zero_frame(b.get());
        pool.read_frame(b.get(), 100, &mut buf);
        assert_eq!(buf, [0; 7]);
    }
}
