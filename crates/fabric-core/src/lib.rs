//! Core primitives shared by every peripheral crate in the SoC emulation
//! fabric: register/bitfield modeling, the generic MMIO peripheral base, the
//! static event map, the CPU exception taxonomy, the narrow `Cpu` interface,
//! and the handful of small cross-cutting utilities (`TimerRegister`,
//! `EcsmResetCause`) more than one peripheral needs.

pub mod cpu;
pub mod ecsm;
pub mod error;
pub mod event;
pub mod exception;
pub mod mmio;
pub mod register;
pub mod timer;

pub use cpu::{Cpu, CpuReg, CurInstr, TlbEntry};
pub use ecsm::{EcsmResetCause, ResetCause};
pub use error::{AccessError, BusError, UnimplementedError};
pub use event::{
    dispatch_event, DmaRequest, DmaRequestQueue, EventKey, EventMap, EventMapBuilder,
    EventMapGapError, EventOutcome, EventTarget, InterruptQueue, InterruptSource,
};
pub use exception::{Exception, ExceptionClass, ExceptionPayload, PriorityClass, SaveRestorePair};
pub use mmio::{Endian, MmioPeripheral, SEGMENTED_ACCESS_THRESHOLD};
pub use register::{AccessClass, Field, Register, RegisterDescriptor, RegisterSet, Width};
pub use timer::TimerRegister;
