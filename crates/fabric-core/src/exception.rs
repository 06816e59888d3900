//! The closed CPU exception taxonomy.
//!
//! Grounded on `original_source/cm2350/intc_exc.py`: each exception class
//! there is an `INTCException` subclass carrying a base priority, an IVOR
//! index, an MSR clear mask, and a save/restore register pair. This module
//! reduces that class hierarchy to a tagged union per the design notes (§9,
//! "From exceptions-for-control-flow to tagged errors").

use crate::event::InterruptSource;

/// Which save/restore register pair an exception class uses to stash the
/// pre-exception PC and MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveRestorePair {
    /// SRR0/SRR1 — standard-priority exceptions.
    Srr,
    /// CSRR0/CSRR1 — critical-priority exceptions.
    Csrr,
    /// MCSRR0/MCSRR1 — machine-check-priority exceptions.
    Mcsrr,
    /// DSRR0/DSRR1 — debug exceptions.
    Dsrr,
}

/// Base priority class. Ordering (`Ord`) follows dispatch precedence:
/// machine-check preempts critical, critical preempts standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    Standard,
    Guest,
    Debug,
    Critical,
    MachineCheck,
}

/// The closed set of CPU exception variants named in `spec.md` §1/§5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionClass {
    Reset,
    CriticalInput,
    MachineCheck,
    DataStorage,
    InstructionStorage,
    External,
    Alignment,
    Program,
    FloatUnavailable,
    SystemCall,
    ApUnavailable,
    Decrementer,
    FixedIntervalTimer,
    WatchdogTimer,
    DataTlb,
    InstructionTlb,
    Debug,
    SpeEfpuUnavailable,
    EfpuData,
    EfpuRound,
    Performance,
    /// Declared but unimplemented per `spec.md` §9 open questions: raising
    /// these is an [`crate::error::UnimplementedError`] until a target ABI
    /// is defined.
    Doorbell,
    DoorbellCrit,
    GuestDoorbell,
    GuestDoorbellCrit,
    Hypercall,
    HyperPriv,
    Lrat,
}

impl ExceptionClass {
    pub fn priority_class(self) -> PriorityClass {
        use ExceptionClass::*;
        match self {
            Reset | MachineCheck | DataStorage | InstructionStorage => PriorityClass::MachineCheck,
            CriticalInput | WatchdogTimer | Doorbell | DoorbellCrit | HyperPriv => {
                PriorityClass::Critical
            }
            Debug => PriorityClass::Debug,
            GuestDoorbell | GuestDoorbellCrit => PriorityClass::Guest,
            _ => PriorityClass::Standard,
        }
    }

    pub fn save_restore_pair(self) -> SaveRestorePair {
        match self.priority_class() {
            PriorityClass::MachineCheck => SaveRestorePair::Mcsrr,
            PriorityClass::Critical | PriorityClass::Guest => SaveRestorePair::Csrr,
            PriorityClass::Debug => SaveRestorePair::Dsrr,
            PriorityClass::Standard => SaveRestorePair::Srr,
        }
    }

    /// Exception classes declared but intentionally unimplemented (see
    /// `DESIGN.md`'s resolution of the "Doorbell / Hypercall / LRAT" open
    /// question).
    pub fn is_unimplemented(self) -> bool {
        matches!(
            self,
            ExceptionClass::Doorbell
                | ExceptionClass::DoorbellCrit
                | ExceptionClass::GuestDoorbell
                | ExceptionClass::GuestDoorbellCrit
                | ExceptionClass::Hypercall
                | ExceptionClass::HyperPriv
                | ExceptionClass::Lrat
        )
    }
}

/// Exception-class-specific payload. Only `External`, fault-address-bearing
/// classes, and machine-check carry one; everything else is unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionPayload {
    None,
    /// External interrupt: carries the INTC source that triggered it.
    External { source: InterruptSource },
    /// DSI/ISI/TLB-miss: carries the faulting effective address and access
    /// flags (store vs. load, cache-lock, VLE).
    Fault { va: u32, ea_flags: u32 },
    /// Machine check: carries the MCSR bits to OR in.
    MachineCheck { mcsr_bits: u32 },
}

/// A CPU exception instance. Two instances are equal iff their class and
/// payload are equal, which is what the INTC deferred queue and
/// pending-exception dedup rely on (`spec.md` §3, "Exception").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Exception {
    pub class: ExceptionClass,
    pub payload: ExceptionPayload,
    /// MSR bits OR'd in on setup (architecture detail, opaque mask here).
    pub msr_set_bits: u32,
    /// MSR bits cleared on setup.
    pub msr_clear_mask: u32,
    /// ESR bits to OR in, if this class has side effects on ESR.
    pub esr_bits: Option<u32>,
    /// DEAR value to set, if this class carries a data effective address.
    pub dear: Option<u32>,
    /// MCAR value to set, if this class carries a machine-check address.
    pub mcar: Option<u32>,
}

impl Exception {
    pub fn new(class: ExceptionClass) -> Self {
        Exception {
            class,
            payload: ExceptionPayload::None,
            msr_set_bits: 0,
            msr_clear_mask: 0,
            esr_bits: None,
            dear: None,
            mcar: None,
        }
    }

    pub fn external(source: InterruptSource) -> Self {
        Exception {
            payload: ExceptionPayload::External { source },
            ..Exception::new(ExceptionClass::External)
        }
    }

    pub fn reset() -> Self {
        Exception::new(ExceptionClass::Reset)
    }

    pub fn with_esr(mut self, esr_bits: u32) -> Self {
        self.esr_bits = Some(esr_bits);
        self
    }

    pub fn with_dear(mut self, va: u32) -> Self {
        self.dear = Some(va);
        self
    }

    pub fn with_mcar(mut self, addr: u32) -> Self {
        self.mcar = Some(addr);
        self
    }

    pub fn source(&self) -> Option<InterruptSource> {
        match self.payload {
            ExceptionPayload::External { source } => Some(source),
            _ => None,
        }
    }

    pub fn priority_class(&self) -> PriorityClass {
        self.class.priority_class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_equal_by_class_and_payload() {
        let a = Exception::external(InterruptSource::new(5));
        let b = Exception::external(InterruptSource::new(5));
        let c = Exception::external(InterruptSource::new(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn priority_ordering_machine_check_beats_critical() {
        assert!(PriorityClass::MachineCheck > PriorityClass::Critical);
        assert!(PriorityClass::Critical > PriorityClass::Standard);
    }

    #[test]
    fn doorbell_variants_flagged_unimplemented() {
        assert!(ExceptionClass::Doorbell.is_unimplemented());
        assert!(ExceptionClass::Lrat.is_unimplemented());
        assert!(!ExceptionClass::External.is_unimplemented());
    }
}
