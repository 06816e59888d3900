//! SoC wiring: the static event map, peripheral construction, configuration
//! loading, and logging setup that turns the individual peripheral crates
//! into one simulated MPC5674-class SoC (`spec.md` §6).

pub mod config;
pub mod event_map;
pub mod logging;
pub mod soc;

pub use config::SocConfig;
pub use soc::{
    Soc, SocBusError, UnmappedAddress, EDMA_A_BASE, EDMA_B_BASE, EQADC_A_BASE, EQADC_B_BASE,
    FLEXCAN_A_BASE, FLEXCAN_B_BASE, FLEXCAN_C_BASE, FLEXCAN_D_BASE, INTC_BASE, SWT_BASE,
};
