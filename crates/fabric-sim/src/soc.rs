//! The SoC: owns every peripheral, wires them to the shared event map and
//! to each other's narrow trait interfaces, and dispatches MMIO accesses
//! and tick-driven work across the lot of them (`spec.md` §6, "SoC module
//! map").

use std::sync::Arc;

use fabric_core::{AccessError, Cpu, DmaRequestQueue, EventMap, InterruptQueue};
use fabric_edma::{Edma, Variant as EdmaVariant};
use fabric_eqadc::{Device as EqadcDevice, Eqadc, EqadcFault};
use fabric_flexcan::{ClockConfig as FlexcanClocks, Flexcan};
use fabric_ioadapter::IoAdapter;
use fabric_intc::Intc;
use fabric_swt::{ClockConfig as SwtClocks, Swt, SwtFault};

use crate::config::SocConfig;
use crate::event_map;

// Physical base addresses, matching the MPC5674-class memory map this
// fabric's `original_source` peripherals were themselves addressed at.
// Public so a harness wiring this `Soc` into a CPU's bus/TLB setup (or
// placing it on a memory map alongside RAM/flash) has something to build
// that mapping from.
pub const INTC_BASE: u32 = 0xFFF4_8000;
pub const SWT_BASE: u32 = 0xFFF3_8000;
pub const EDMA_A_BASE: u32 = 0xFFF4_4000;
pub const EDMA_B_BASE: u32 = 0xFFF5_4000;
pub const FLEXCAN_A_BASE: u32 = 0xFFFC_0000;
pub const FLEXCAN_B_BASE: u32 = 0xFFFC_4000;
pub const FLEXCAN_C_BASE: u32 = 0xFFFC_8000;
pub const FLEXCAN_D_BASE: u32 = 0xFFFC_C000;
pub const EQADC_A_BASE: u32 = 0xFFF8_0000;
pub const EQADC_B_BASE: u32 = 0xFFF8_4000;

const FLEXCAN_MMIO_SIZE: u32 = fabric_flexcan::MMIO_SIZE;
const EQADC_MMIO_SIZE: u32 = 0x4000;
const EDMA_MMIO_SIZE: u32 = 0x2800;
const INTC_MMIO_SIZE: u32 = 0x4000;
const SWT_MMIO_SIZE: u32 = 0x4000;

/// Failure reading/writing some address the SoC's peripheral table does not
/// cover at all — distinct from a peripheral's own bus fault, which is a
/// normal, expected outcome of a *mapped* access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no peripheral mapped at {0:#010x}")]
pub struct UnmappedAddress(pub u32);

/// What an MMIO access dispatched through [`Soc::read`]/[`Soc::write`] can
/// fail with: either a genuine peripheral-level error, or the address
/// simply isn't backed by anything.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SocBusError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Swt(#[from] SwtFaultWrapper),
    #[error(transparent)]
    Eqadc(#[from] EqadcFaultWrapper),
    #[error(transparent)]
    Unmapped(#[from] UnmappedAddress),
}

// `SwtFault`/`EqadcFault` don't implement `std::error::Error` themselves
// (they're plain tagged enums, matched directly by their own crate's
// callers); these newtypes give them an `Error` impl scoped to this crate
// boundary, where they do need to join a single `SocBusError` union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwtFaultWrapper(pub SwtFault);
impl std::fmt::Display for SwtFaultWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SWT fault: {:?}", self.0)
    }
}
impl std::error::Error for SwtFaultWrapper {}

#[derive(Debug, Clone, PartialEq)]
pub struct EqadcFaultWrapper(pub EqadcFault);
impl std::fmt::Display for EqadcFaultWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "eQADC fault: {:?}", self.0)
    }
}
impl std::error::Error for EqadcFaultWrapper {}

/// The whole SoC: every peripheral this fabric implements, wired to a
/// shared [`EventMap`] and to each other through the narrow
/// `InterruptQueue`/`DmaRequestQueue` handles (`spec.md` §3).
pub struct Soc {
    pub event_map: Arc<EventMap>,
    pub intc: Arc<Intc>,
    pub swt: Swt,
    pub ecsm: fabric_core::EcsmResetCause,
    pub edma_a: Arc<Edma>,
    pub edma_b: Arc<Edma>,
    pub flexcan_a: Flexcan,
    pub flexcan_b: Flexcan,
    pub flexcan_c: Flexcan,
    pub flexcan_d: Flexcan,
    pub eqadc_a: Eqadc,
    pub eqadc_b: Eqadc,
}

impl Soc {
    /// Builds every peripheral against a freshly-constructed event map,
    /// validating it's exhaustive before anything is wired to it — a gap
    /// here is a configuration error, not a runtime panic waiting to
    /// happen (`spec.md` §3).
    pub fn new(config: &SocConfig) -> anyhow::Result<Self> {
        let map = event_map::build();
        map.validate_exhaustive(&event_map::expected_keys())?;
        let event_map = Arc::new(map);

        let intc = Arc::new(Intc::new(INTC_BASE));
        let ecsm = fabric_core::EcsmResetCause::new();

        let swt_clocks = SwtClocks {
            external_hz: config.clocks.fmpll_extal_hz,
            peripheral_hz: config.clocks.peripheral_clock_hz,
        };
        let swt = Swt::new(
            SWT_BASE,
            swt_clocks,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
            ecsm.clone(),
        );

        let edma_a = Arc::new(Edma::new(
            "EDMA_A",
            EdmaVariant::A,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
        ));
        let edma_b = Arc::new(Edma::new(
            "EDMA_B",
            EdmaVariant::B,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
        ));

        let flexcan_clocks = FlexcanClocks {
            external_hz: config.clocks.fmpll_extal_hz,
            peripheral_hz: config.clocks.peripheral_clock_hz,
        };
        let mut flexcan_a = Flexcan::new(
            "FlexCAN_A",
            FLEXCAN_A_BASE,
            flexcan_clocks,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
        );
        if let Some(port) = config.flexcan_a.port {
            let addr = format!("{}:{}", config.flexcan_a.host, port);
            let io = Arc::new(IoAdapter::spawn(&addr)?);
            flexcan_a = flexcan_a.with_io(io);
        }

        let mut flexcan_b = Flexcan::new(
            "FlexCAN_B",
            FLEXCAN_B_BASE,
            flexcan_clocks,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
        );
        if let Some(port) = config.flexcan_b.port {
            let addr = format!("{}:{}", config.flexcan_b.host, port);
            let io = Arc::new(IoAdapter::spawn(&addr)?);
            flexcan_b = flexcan_b.with_io(io);
        }

        let mut flexcan_c = Flexcan::new(
            "FlexCAN_C",
            FLEXCAN_C_BASE,
            flexcan_clocks,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
        );
        if let Some(port) = config.flexcan_c.port {
            let addr = format!("{}:{}", config.flexcan_c.host, port);
            let io = Arc::new(IoAdapter::spawn(&addr)?);
            flexcan_c = flexcan_c.with_io(io);
        }

        let mut flexcan_d = Flexcan::new(
            "FlexCAN_D",
            FLEXCAN_D_BASE,
            flexcan_clocks,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
        );
        if let Some(port) = config.flexcan_d.port {
            let addr = format!("{}:{}", config.flexcan_d.host, port);
            let io = Arc::new(IoAdapter::spawn(&addr)?);
            flexcan_d = flexcan_d.with_io(io);
        }

        let mut eqadc_a = Eqadc::new(
            "eQADC_A",
            EQADC_A_BASE,
            EqadcDevice::A,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
            Some(edma_a.clone() as Arc<dyn DmaRequestQueue>),
        );
        if let Some(port) = config.eqadc_a.port {
            let addr = format!("{}:{}", config.eqadc_a.host, port);
            let io = Arc::new(IoAdapter::spawn(&addr)?);
            eqadc_a = eqadc_a.with_io(io);
        }

        let mut eqadc_b = Eqadc::new(
            "eQADC_B",
            EQADC_B_BASE,
            EqadcDevice::B,
            event_map.clone(),
            intc.clone() as Arc<dyn InterruptQueue>,
            Some(edma_b.clone() as Arc<dyn DmaRequestQueue>),
        );
        if let Some(port) = config.eqadc_b.port {
            let addr = format!("{}:{}", config.eqadc_b.host, port);
            let io = Arc::new(IoAdapter::spawn(&addr)?);
            eqadc_b = eqadc_b.with_io(io);
        }

        Ok(Soc {
            event_map,
            intc,
            swt,
            ecsm,
            edma_a,
            edma_b,
            flexcan_a,
            flexcan_b,
            flexcan_c,
            flexcan_d,
            eqadc_a,
            eqadc_b,
        })
    }

    /// Resets every peripheral, matching a PowerPC reset vector's effect on
    /// the whole peripheral bus.
    pub fn reset_all(&self, now: f64) {
        self.intc.reset();
        self.swt.reset(now);
        self.edma_a.reset();
        self.edma_b.reset();
        self.flexcan_a.reset(now);
        self.flexcan_b.reset(now);
        self.flexcan_c.reset(now);
        self.flexcan_d.reset(now);
        self.eqadc_a.reset();
        self.eqadc_b.reset();
    }

    /// Routes one MMIO read to whichever peripheral's address range
    /// contains `addr`, translating it to that peripheral's offset.
    pub fn read(&self, addr: u32, size: u8, pc: u32, now: f64, cpu: &mut dyn Cpu) -> Result<Vec<u8>, SocBusError> {
        if let Some(off) = in_range(addr, INTC_BASE, INTC_MMIO_SIZE) {
            return Ok(self.intc.read(off, size, pc)?);
        }
        if let Some(off) = in_range(addr, SWT_BASE, SWT_MMIO_SIZE) {
            return self
                .swt
                .read(off, size, pc, now, cpu)
                .map_err(|e| SocBusError::Swt(SwtFaultWrapper(e)));
        }
        if let Some(off) = in_range(addr, EDMA_A_BASE, EDMA_MMIO_SIZE) {
            return Ok(self.edma_a.read(off, size, pc)?);
        }
        if let Some(off) = in_range(addr, EDMA_B_BASE, EDMA_MMIO_SIZE) {
            return Ok(self.edma_b.read(off, size, pc)?);
        }
        if let Some(off) = in_range(addr, FLEXCAN_A_BASE, FLEXCAN_MMIO_SIZE) {
            return Ok(self.flexcan_a.read(off, size, pc, now)?);
        }
        if let Some(off) = in_range(addr, FLEXCAN_B_BASE, FLEXCAN_MMIO_SIZE) {
            return Ok(self.flexcan_b.read(off, size, pc, now)?);
        }
        if let Some(off) = in_range(addr, FLEXCAN_C_BASE, FLEXCAN_MMIO_SIZE) {
            return Ok(self.flexcan_c.read(off, size, pc, now)?);
        }
        if let Some(off) = in_range(addr, FLEXCAN_D_BASE, FLEXCAN_MMIO_SIZE) {
            return Ok(self.flexcan_d.read(off, size, pc, now)?);
        }
        if let Some(off) = in_range(addr, EQADC_A_BASE, EQADC_MMIO_SIZE) {
            return self
                .eqadc_a
                .read(off, size, pc)
                .map_err(|e| SocBusError::Eqadc(EqadcFaultWrapper(e)));
        }
        if let Some(off) = in_range(addr, EQADC_B_BASE, EQADC_MMIO_SIZE) {
            return self
                .eqadc_b
                .read(off, size, pc)
                .map_err(|e| SocBusError::Eqadc(EqadcFaultWrapper(e)));
        }
        Err(SocBusError::Unmapped(UnmappedAddress(addr)))
    }

    /// Routes one MMIO write, same address-range dispatch as [`Self::read`].
    pub fn write(
        &self,
        addr: u32,
        size: u8,
        data: &[u8],
        pc: u32,
        now: f64,
        cpu: &mut dyn Cpu,
    ) -> Result<(), SocBusError> {
        if let Some(off) = in_range(addr, INTC_BASE, INTC_MMIO_SIZE) {
            self.intc.write(off, size, data, pc)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, SWT_BASE, SWT_MMIO_SIZE) {
            return self
                .swt
                .write(off, size, data, pc, now, cpu)
                .map_err(|e| SocBusError::Swt(SwtFaultWrapper(e)));
        }
        if let Some(off) = in_range(addr, EDMA_A_BASE, EDMA_MMIO_SIZE) {
            self.edma_a.write(off, size, data, cpu, pc)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, EDMA_B_BASE, EDMA_MMIO_SIZE) {
            self.edma_b.write(off, size, data, cpu, pc)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, FLEXCAN_A_BASE, FLEXCAN_MMIO_SIZE) {
            self.flexcan_a.write(off, size, data, pc, now)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, FLEXCAN_B_BASE, FLEXCAN_MMIO_SIZE) {
            self.flexcan_b.write(off, size, data, pc, now)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, FLEXCAN_C_BASE, FLEXCAN_MMIO_SIZE) {
            self.flexcan_c.write(off, size, data, pc, now)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, FLEXCAN_D_BASE, FLEXCAN_MMIO_SIZE) {
            self.flexcan_d.write(off, size, data, pc, now)?;
            return Ok(());
        }
        if let Some(off) = in_range(addr, EQADC_A_BASE, EQADC_MMIO_SIZE) {
            return self
                .eqadc_a
                .write(off, size, data, pc)
                .map_err(|e| SocBusError::Eqadc(EqadcFaultWrapper(e)));
        }
        if let Some(off) = in_range(addr, EQADC_B_BASE, EQADC_MMIO_SIZE) {
            return self
                .eqadc_b
                .write(off, size, data, pc)
                .map_err(|e| SocBusError::Eqadc(EqadcFaultWrapper(e)));
        }
        Err(SocBusError::Unmapped(UnmappedAddress(addr)))
    }

    /// One simulator tick: drains INTC's admitted exceptions into the CPU,
    /// pumps both eDMA engines' channel state machines, escalates SWT's
    /// watchdog if its countdown has elapsed, and drains any pending
    /// external FlexCAN/eQADC traffic. Called once per emulated step by the
    /// owning simulator loop (`spec.md` §3, the only place a live `&mut dyn
    /// Cpu` crosses into peripheral code for non-MMIO work).
    pub fn tick(&self, cpu: &mut dyn Cpu, now: f64, pc: u32) {
        self.intc.pump(cpu);
        self.edma_a.pump(cpu, pc);
        self.edma_b.pump(cpu, pc);

        if let Some(remaining) = self.swt.seconds_until_timeout(now) {
            if remaining <= 0.0 {
                self.swt.on_watchdog_expired(now, cpu);
            }
        }

        self.flexcan_a.pump_external_rx(now);
        self.flexcan_b.pump_external_rx(now);
        self.flexcan_c.pump_external_rx(now);
        self.flexcan_d.pump_external_rx(now);
        self.eqadc_a.pump_external_rx();
        self.eqadc_b.pump_external_rx();

        self.intc.pump(cpu);
    }
}

fn in_range(addr: u32, base: u32, size: u32) -> Option<u32> {
    if addr >= base && addr < base + size {
        Some(addr - base)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::MockCpu;

    #[test]
    fn builds_with_default_config_and_validates_event_map() {
        let soc = Soc::new(&SocConfig::default()).unwrap();
        soc.reset_all(0.0);
    }

    #[test]
    fn unmapped_address_is_a_distinct_error() {
        let soc = Soc::new(&SocConfig::default()).unwrap();
        let mut cpu = MockCpu::new();
        let err = soc.read(0x1000_0000, 4, 0, 0.0, &mut cpu).unwrap_err();
        assert!(matches!(err, SocBusError::Unmapped(_)));
    }

    #[test]
    fn intc_and_swt_ranges_do_not_overlap_other_peripherals() {
        let soc = Soc::new(&SocConfig::default()).unwrap();
        let mut cpu = MockCpu::new();
        assert!(soc.read(INTC_BASE, 4, 0, 0.0, &mut cpu).is_ok());
        assert!(soc.read(SWT_BASE, 4, 0, 0.0, &mut cpu).is_ok());
        assert!(soc.read(FLEXCAN_A_BASE, 4, 0, 0.0, &mut cpu).is_ok());
        assert!(soc.read(EQADC_A_BASE, 4, 0, 0.0, &mut cpu).is_ok());
    }
}
