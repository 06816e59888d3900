//! Shared test harness for the SoC emulation fabric: a [`MockCpu`] and the
//! recording `InterruptQueue`/`DmaRequestQueue` stand-ins every peripheral
//! crate's own `#[cfg(test)]` module otherwise has to hand-roll.
//!
//! Grounded on the teacher's `crates/testing` workspace member (a dedicated
//! crate for cross-cutting test infrastructure, consumed by every other
//! crate as a `dev-dependency`). What it provides is narrower than the
//! teacher's: this fabric's peripheral crates already carry their own local
//! `StubCpu`/`RamCpu`/`NullIntc` fixtures (`fabric-intc`, `fabric-edma`,
//! `fabric-swt`, `fabric-flexcan`, `fabric-eqadc`), so this crate exists for
//! `fabric-sim`'s cross-peripheral scenario tests, which need a single CPU
//! and interrupt/DMA double shared across several wired-up peripherals
//! rather than a private one per crate.

mod mock_cpu;
mod queues;

pub use mock_cpu::MockCpu;
pub use queues::{NullDma, RecordingDma, RecordingIntc};
