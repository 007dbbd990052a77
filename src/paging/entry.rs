//! # Page-table entry encoding
//!
//! Entries are raw little-endian `u64` words with named bit masks and
//! accessor functions; no compiler-specific bitfield packing. Layout is
//! pinned by the assertions at the bottom.

use super::{PAGE_MASK, PageFlags, PhysicalAddress};

pub const ENTRY_PRESENT: u64 = 1 << 0;
pub const ENTRY_WRITABLE: u64 = 1 << 1;
pub const ENTRY_USER: u64 = 1 << 2;
pub const ENTRY_NO_CACHE: u64 = 1 << 4;
pub const ENTRY_GLOBAL: u64 = 1 << 8;
pub const ENTRY_NO_EXECUTE: u64 = 1 << 63;

/// Bits 12..52 carry the frame address; the processor treats anything above
/// its physical-address width as reserved.
pub const ENTRY_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The modeled processor's physical-address width.
pub const MAX_PHYS_ADDR_WIDTH: u32 = 52;

/// One page-table entry at any level.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const UNUSED: Self = Self(0);

    /// Builds an entry pointing at `address` with the given raw flag bits.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not page aligned or does not fit the
    /// processor's physical-address width. Both indicate a kernel bug, not a
    /// runtime condition; an entry with reserved bits set would be accepted
    /// silently by no hardware.
    pub fn new(address: PhysicalAddress, flags: u64) -> Self {
        let addr = address.data() as u64;
        assert!(addr & PAGE_MASK as u64 == 0, "unaligned table address {addr:#x}");
        assert!(
            addr >> MAX_PHYS_ADDR_WIDTH == 0 && addr & ENTRY_ADDRESS_MASK == addr,
            "physical address {addr:#x} exceeds the supported width"
        );
        Self(addr | (flags & !ENTRY_ADDRESS_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn present(self) -> bool {
        self.0 & ENTRY_PRESENT != 0
    }
    pub const fn writable(self) -> bool {
        self.0 & ENTRY_WRITABLE != 0
    }
    pub const fn user(self) -> bool {
        self.0 & ENTRY_USER != 0
    }
    pub const fn no_execute(self) -> bool {
        self.0 & ENTRY_NO_EXECUTE != 0
    }
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & ENTRY_ADDRESS_MASK) as usize)
    }

    /// The same entry with the permission bits replaced, address kept.
    pub fn with_flags(self, flags: u64) -> Self {
        Self::new(self.address(), flags)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[entry {:#018x}]", self.0)
    }
}

/// Converts region permissions to leaf entry bits. `writable` additionally
/// gates the write bit, so copy-on-write slots can be installed read-only
/// under a writable region.
pub fn entry_flags(flags: PageFlags, writable: bool) -> u64 {
    let mut bits = ENTRY_PRESENT;
    if flags.contains(PageFlags::WRITE) && writable {
        bits |= ENTRY_WRITABLE;
    }
    if flags.contains(PageFlags::USER) {
        bits |= ENTRY_USER;
    }
    if !flags.contains(PageFlags::EXEC) {
        bits |= ENTRY_NO_EXECUTE;
    }
    bits
}

// An entry is one u64; a full table is exactly one frame.
const _: () = assert!(core::mem::size_of::<PageTableEntry>() == 8);
const _: () = assert!(core::mem::align_of::<PageTableEntry>() == 8);
const _: () = assert!(super::ENTRIES_PER_TABLE * 8 == super::PAGE_SIZE);
