//! # Paging primitives
//!
//! Address newtypes, page arithmetic and mapping flags. The page-table entry
//! encoding lives in [`entry`], the page-directory lifecycle in
//! [`directory`].

pub mod directory;
pub mod entry;

use core::fmt;

/// One page, in bytes.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Page-table entries per table level. One table occupies exactly one frame.
pub const ENTRIES_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// First kernel-half slot in the top-level table. Slots at or above this
/// index are aliased into every user directory.
pub const KERNEL_TOP_LEVEL_START: usize = ENTRIES_PER_TABLE / 2;

/// Base of the kernel half of the canonical 48-bit address space.
pub const KERNEL_BASE: usize = 0xFFFF_8000_0000_0000;

/// First address past the user half.
pub const USER_TOP: usize = 1 << 47;

pub const fn round_down_pages(value: usize) -> usize {
    value & !PAGE_MASK
}
pub const fn round_up_pages(value: usize) -> usize {
    round_down_pages(value + PAGE_MASK)
}

/// Whether an address belongs to the user or the kernel half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    User,
    Kernel,
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    pub const fn new(data: usize) -> Self {
        Self(data)
    }
    pub const fn data(self) -> usize {
        self.0
    }
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[phys {:#x}]", self.0)
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const fn new(data: usize) -> Self {
        Self(data)
    }
    pub const fn data(self) -> usize {
        self.0
    }
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
    /// The half of the address space this address belongs to.
    pub fn kind(self) -> TableKind {
        if self.0 >= KERNEL_BASE {
            TableKind::Kernel
        } else {
            TableKind::User
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[virt {:#x}]", self.0)
    }
}

/// A page-aligned virtual page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    start: VirtualAddress,
}

impl Page {
    /// The page containing `address`.
    pub fn containing_address(address: VirtualAddress) -> Self {
        Self {
            start: VirtualAddress::new(round_down_pages(address.data())),
        }
    }
    pub fn start_address(self) -> VirtualAddress {
        self.start
    }
    pub fn next(self) -> Self {
        self.next_by(1)
    }
    pub fn next_by(self, n: usize) -> Self {
        Self {
            start: self.start.add(n * PAGE_SIZE),
        }
    }
    /// Page distance from `from` to `self`; `from` must not be above `self`.
    pub fn offset_from(self, from: Self) -> usize {
        (self.start.data() - from.start.data()) / PAGE_SIZE
    }
    /// The table index of this page at the given level (0 = page table,
    /// 3 = top level).
    pub fn table_index(self, level: usize) -> usize {
        debug_assert!(level < 4);
        (self.start.data() >> (12 + 9 * level)) & (ENTRIES_PER_TABLE - 1)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[page {:#x}]", self.start.data())
    }
}

/// A contiguous span of virtual pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSpan {
    pub base: Page,
    pub count: usize,
}

impl PageSpan {
    pub fn new(base: Page, count: usize) -> Self {
        Self { base, count }
    }
    /// The span covering `[base, base + size)`, or None for a zero size.
    pub fn validate_nonempty(base: VirtualAddress, size: usize) -> Option<Self> {
        if size == 0 || base.data() & PAGE_MASK != 0 {
            return None;
        }
        Some(Self {
            base: Page::containing_address(base),
            count: round_up_pages(size) / PAGE_SIZE,
        })
    }
    pub fn is_empty(self) -> bool {
        self.count == 0
    }
    /// First page past the span.
    pub fn end(self) -> Page {
        self.base.next_by(self.count)
    }
    pub fn contains(self, page: Page) -> bool {
        page >= self.base && page < self.end()
    }
    pub fn pages(self) -> impl Iterator<Item = Page> {
        (0..self.count).map(move |i| self.base.next_by(i))
    }
    /// The pages both spans cover, if any.
    pub fn intersection(self, other: PageSpan) -> Option<PageSpan> {
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        if base < end {
            Some(PageSpan::new(base, end.offset_from(base)))
        } else {
            None
        }
    }
}

bitflags! {
    /// Access permissions of a region, as requested by the mapping caller.
    /// Converted to hardware entry bits by [`entry::entry_flags`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let va = VirtualAddress::new(0x7fff_1234);
        let page = Page::containing_address(va);
        assert_eq!(page.start_address().data(), 0x7fff_1000);
        assert_eq!(page.next().start_address().data(), 0x7fff_2000);
        assert_eq!(page.next_by(3).offset_from(page), 3);
        assert_eq!(va.kind(), TableKind::User);
        assert_eq!(VirtualAddress::new(KERNEL_BASE).kind(), TableKind::Kernel);
    }

    #[test]
    fn table_indices_decompose_the_address() {
        let page = Page::containing_address(VirtualAddress::new(KERNEL_BASE));
        assert_eq!(page.table_index(3), KERNEL_TOP_LEVEL_START);
        assert_eq!(page.table_index(2), 0);
        assert_eq!(page.table_index(1), 0);
        assert_eq!(page.table_index(0), 0);

        let page = Page::containing_address(VirtualAddress::new(
            (1 << 39) | (2 << 30) | (3 << 21) | (4 << 12),
        ));
        assert_eq!(page.table_index(3), 1);
        assert_eq!(page.table_index(2), 2);
        assert_eq!(page.table_index(1), 3);
        assert_eq!(page.table_index(0), 4);
    }

    #[test]
    fn span_validation() {
        let base = VirtualAddress::new(0x10_0000);
        assert!(PageSpan::validate_nonempty(base, 0).is_none());
        assert!(PageSpan::validate_nonempty(base.add(1), PAGE_SIZE).is_none());
        let span = PageSpan::validate_nonempty(base, PAGE_SIZE + 1).unwrap();
        assert_eq!(span.count, 2);
    }

    #[test]
    fn span_intersection() {
        let base = Page::containing_address(VirtualAddress::new(0x10_0000));
        let a = PageSpan::new(base, 4);
        let b = PageSpan::new(base.next_by(2), 4);
        let i = a.intersection(b).unwrap();
        assert_eq!(i.base, base.next_by(2));
        assert_eq!(i.count, 2);
        assert!(a.intersection(PageSpan::new(base.next_by(4), 1)).is_none());
    }
}
