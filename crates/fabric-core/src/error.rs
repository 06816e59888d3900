//! Bus-fault and protocol error taxonomy.
//!
//! These are the "tagged errors" called for in the design notes: alignment,
//! read/write bus-error and unimplemented-register are distinct variants
//! carrying structured payload rather than an inheritance chain of
//! exceptions. The MMIO base translates a [`BusError`] into the matching
//! CPU-visible exception; peripheral code matches on the variant.

use thiserror::Error;

/// A bus fault raised synchronously by peripheral code during an MMIO
/// access. Carries enough context (`pc`, `va`, `size`) for the CPU fault
/// handler to populate ESR/DEAR without the peripheral needing to know
/// anything about PowerPC exception encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// Access width is not a natural multiple of the addressed field, or the
    /// access spans two declared fields of differing width.
    #[error("alignment fault: pc={pc:#010x} va={va:#010x} size={size} data_consumed={data_consumed}")]
    Alignment {
        pc: u32,
        va: u32,
        size: u8,
        data_consumed: bool,
    },

    /// A read targeted a reserved region or a write-only field.
    #[error("read bus error: pc={pc:#010x} va={va:#010x} size={size}")]
    ReadBusError { pc: u32, va: u32, size: u8 },

    /// A write targeted a reserved region, a read-only field, or a constant
    /// field.
    #[error("write bus error: pc={pc:#010x} va={va:#010x} size={size}")]
    WriteBusError { pc: u32, va: u32, size: u8 },
}

impl BusError {
    pub fn pc(&self) -> u32 {
        match *self {
            BusError::Alignment { pc, .. } => pc,
            BusError::ReadBusError { pc, .. } => pc,
            BusError::WriteBusError { pc, .. } => pc,
        }
    }

    pub fn va(&self) -> u32 {
        match *self {
            BusError::Alignment { va, .. } => va,
            BusError::ReadBusError { va, .. } => va,
            BusError::WriteBusError { va, .. } => va,
        }
    }
}

/// Raised when MMIO code hits a placeholder field or another feature that is
/// deliberately unimplemented (per `spec.md` §7, "never silently masked").
#[derive(Debug, Clone, PartialEq, Error)]
#[error("unimplemented: {feature} (pc={pc:#010x} va={va:#010x} size={size})")]
pub struct UnimplementedError {
    pub pc: u32,
    pub va: u32,
    pub size: u8,
    pub feature: String,
}

/// Union of the two synchronous error kinds an MMIO access can raise.
#[derive(Debug, Clone, Error)]
pub enum AccessError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Unimplemented(#[from] UnimplementedError),
}
