//! # vmem
//!
//! The kernel's virtual-memory subsystem: physical-frame refcounting and the
//! free pool, the VMObject backing-store family, per-process address spaces
//! with demand paging and copy-on-write fork, four-level page directories
//! with a shared kernel half, and the page-fault entry point.
//!
//! Hardware interactions (the table-root register, TLB invalidation, the
//! quickmap scratch window) are modeled as explicit in-memory state carried
//! by the [`memory::PhysicalMemory`] pool, which also owns the simulated RAM
//! the unit tests run against on the host.
//!
//! Everything with boot lifetime hangs off [`mm::MemoryManager`]; there are
//! no global singletons besides the log sink.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;

pub mod addr_space;
pub mod cpu_set;
pub mod error;
pub mod fault;
pub mod klog;
pub mod memory;
pub mod mm;
pub mod paging;
pub mod sync;

pub use error::{Error, Result};
