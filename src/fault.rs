//! # Page-fault entry point
//!
//! Architecture-neutral fault handling: the raw error code is decoded into
//! [`GenericPfFlags`], classified into an [`AccessMode`], and dispatched to
//! the faulting CPU's current address space. The outcome tells the trap
//! layer whether to retry the instruction, signal the process, or panic.

use log::warn;

use crate::{
    cpu_set::LogicalCpuId,
    mm::MemoryManager,
    paging::{Page, VirtualAddress},
};

bitflags! {
    /// Architecture-independent page-fault error bits, decoded from the
    /// hardware-specific code by the trap entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GenericPfFlags: u32 {
        /// The leaf entry was present; the fault is about permissions (a
        /// copy-on-write write, or a genuine violation).
        const PRESENT = 1 << 0;
        const INVOLVED_WRITE = 1 << 1;
        const USER_NOT_SUPERVISOR = 1 << 2;
        const INSTR_NOT_DATA = 1 << 3;
        /// The hardware reported reserved bits set in a table entry. Always a
        /// kernel bug.
        const INVL = 1 << 31;
    }
}

/// What the faulting instruction was trying to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    InstrFetch,
}

/// Why a fault could not be corrected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PfError {
    Oom,
    Segv,
    NonfatalInternalError,
}

/// What the trap layer should do after the handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The tables were corrected; retry the faulting instruction.
    Continue,
    /// The access was invalid or unsatisfiable; signal the process.
    SignalProcess,
    /// Kernel state is inconsistent; the caller must panic.
    Fatal,
}

/// Coarse fault category, produced by one exhaustive decision table over the
/// error-code bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// Not-present fault under a valid region: back the slot.
    DemandPage,
    /// Write to a present read-only leaf: break the copy-on-write share.
    CowBreak,
    /// The access can never be satisfied. Includes instruction fetches from
    /// non-executable mappings and malformed codes (write and fetch at once).
    AccessViolation,
    /// The kernel itself faulted. Corrected if a region covers the address,
    /// fatal otherwise.
    KernelFault,
}

/// Classifies the fault code. `None` means the combination cannot be
/// produced by a correctly functioning processor.
fn classify(code: GenericPfFlags) -> Option<AccessMode> {
    let write = code.contains(GenericPfFlags::INVOLVED_WRITE);
    let fetch = code.contains(GenericPfFlags::INSTR_NOT_DATA);
    match (write, fetch) {
        // No instruction both writes and fetches.
        (true, true) => None,
        (true, false) => Some(AccessMode::Write),
        (false, true) => Some(AccessMode::InstrFetch),
        (false, false) => Some(AccessMode::Read),
    }
}

/// The decision table over the decoded bits.
fn fault_class(code: GenericPfFlags) -> FaultClass {
    let present = code.contains(GenericPfFlags::PRESENT);
    let write = code.contains(GenericPfFlags::INVOLVED_WRITE);
    let fetch = code.contains(GenericPfFlags::INSTR_NOT_DATA);
    let user = code.contains(GenericPfFlags::USER_NOT_SUPERVISOR);

    match (user, present, write, fetch) {
        (_, _, true, true) => FaultClass::AccessViolation,
        (false, _, _, _) => FaultClass::KernelFault,
        (true, false, _, _) => FaultClass::DemandPage,
        (true, true, true, false) => FaultClass::CowBreak,
        // A present read or fetch fault is a permission violation; an
        // instruction fetch from a non-executable page is never corrected.
        (true, true, false, _) => FaultClass::AccessViolation,
    }
}

/// Handles a page fault taken on `cpu` at `address`.
pub fn page_fault_handler(
    mm: &MemoryManager,
    cpu: LogicalCpuId,
    code: GenericPfFlags,
    address: VirtualAddress,
) -> FaultOutcome {
    if code.contains(GenericPfFlags::INVL) {
        warn!("reserved bits set in a table entry, fault at {address:?} on {cpu}");
        return FaultOutcome::Fatal;
    }
    let class = fault_class(code);
    let Some(mode) = classify(code) else {
        warn!("malformed fault code {code:?} at {address:?} on {cpu}");
        return FaultOutcome::SignalProcess;
    };
    if class == FaultClass::AccessViolation {
        return FaultOutcome::SignalProcess;
    }
    let Some(space) = mm.find_current(cpu) else {
        // A fault with no current address space means the trap entry lost
        // track of what it was running.
        warn!("page fault on {cpu} with no current address space");
        return FaultOutcome::Fatal;
    };

    let page = Page::containing_address(address);
    match space.try_correcting_page_tables(cpu, page, mode) {
        Ok(()) => FaultOutcome::Continue,
        // An uncorrectable fault taken by the kernel itself is a kernel bug.
        Err(_) if class == FaultClass::KernelFault => {
            warn!("kernel fault at {address:?} on {cpu} could not be corrected");
            FaultOutcome::Fatal
        }
        Err(PfError::Segv) => FaultOutcome::SignalProcess,
        Err(PfError::Oom) => {
            warn!("out of memory correcting fault at {address:?}");
            FaultOutcome::SignalProcess
        }
        Err(PfError::NonfatalInternalError) => {
            warn!("internal error correcting fault at {address:?}");
            FaultOutcome::SignalProcess
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_fetch_together_is_malformed() {
        assert_eq!(
            classify(GenericPfFlags::INVOLVED_WRITE | GenericPfFlags::INSTR_NOT_DATA),
            None
        );
    }

    #[test]
    fn classification_decision_table() {
        assert_eq!(classify(GenericPfFlags::empty()), Some(AccessMode::Read));
        assert_eq!(
            classify(GenericPfFlags::PRESENT | GenericPfFlags::INVOLVED_WRITE),
            Some(AccessMode::Write)
        );
        assert_eq!(
            classify(GenericPfFlags::INSTR_NOT_DATA | GenericPfFlags::USER_NOT_SUPERVISOR),
            Some(AccessMode::InstrFetch)
        );
    }

    #[test]
    fn fault_classes() {
        let user = GenericPfFlags::USER_NOT_SUPERVISOR;
        assert_eq!(fault_class(user), FaultClass::DemandPage);
        assert_eq!(
            fault_class(user | GenericPfFlags::PRESENT | GenericPfFlags::INVOLVED_WRITE),
            FaultClass::CowBreak
        );
        // Fetch from a present non-executable mapping.
        assert_eq!(
            fault_class(user | GenericPfFlags::PRESENT | GenericPfFlags::INSTR_NOT_DATA),
            FaultClass::AccessViolation
        );
        assert_eq!(
            fault_class(GenericPfFlags::INVOLVED_WRITE),
            FaultClass::KernelFault
        );
        assert_eq!(
            fault_class(user | GenericPfFlags::INVOLVED_WRITE | GenericPfFlags::INSTR_NOT_DATA),
            FaultClass::AccessViolation
        );
    }
}
