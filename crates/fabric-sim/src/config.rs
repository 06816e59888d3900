//! SoC-wide configuration: the per-peripheral inputs a project config file
//! supplies (`spec.md` §6, "Configuration inputs"), loaded the way the
//! teacher daemon's own config loads env-backed settings, but as a
//! `serde_json`-backed file since this config is multi-peripheral rather
//! than a handful of scalars.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// One FlexCAN controller's external I/O endpoint. `port: None` disables
/// the bus-socket IO thread entirely (loopback/self-reception still works
/// without it); `host` defaults to loopback when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlexcanEndpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl Default for FlexcanEndpoint {
    fn default() -> Self {
        FlexcanEndpoint {
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

/// One eQADC device's external ADC-sample socket endpoint, same shape as
/// [`FlexcanEndpoint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EqadcEndpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl Default for EqadcEndpoint {
    fn default() -> Self {
        EqadcEndpoint {
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

/// Strap-pin/clock inputs that would otherwise come from the FMPLL/SIU
/// blocks this fabric doesn't model (`spec.md` §1's "trivial register
/// plumbing" carve-out); supplied directly so SWT/FlexCAN's bit-clock
/// prescalers have something real to divide down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockStraps {
    /// `FMPLL.extal`: external oscillator frequency in Hz.
    pub fmpll_extal_hz: f64,
    /// `SIU.pllcfg`: PLL strap configuration driving the system-clock
    /// multiplier at reset.
    pub siu_pllcfg: u8,
    /// `SIU.bootcfg`: boot-mode strap.
    pub siu_bootcfg: u8,
    /// `SIU.wkpcfg`: weak-pull strap.
    pub siu_wkpcfg: u8,
    /// Peripheral (bus) clock in Hz, derived in hardware from `extal` and
    /// the PLL straps; modeled here as a direct input since the PLL's
    /// multiplier table is out of scope.
    pub peripheral_clock_hz: f64,
}

impl Default for ClockStraps {
    fn default() -> Self {
        ClockStraps {
            fmpll_extal_hz: 40_000_000.0,
            siu_pllcfg: 0,
            siu_bootcfg: 0,
            siu_wkpcfg: 0,
            peripheral_clock_hz: 80_000_000.0,
        }
    }
}

/// Top-level SoC configuration: every peripheral's externally-supplied
/// input, loaded once at startup before [`crate::soc::Soc::new`] builds any
/// peripheral.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocConfig {
    pub clocks: ClockStraps,
    pub flexcan_a: FlexcanEndpoint,
    pub flexcan_b: FlexcanEndpoint,
    pub flexcan_c: FlexcanEndpoint,
    pub flexcan_d: FlexcanEndpoint,
    pub eqadc_a: EqadcEndpoint,
    pub eqadc_b: EqadcEndpoint,
}

impl Default for SocConfig {
    fn default() -> Self {
        SocConfig {
            clocks: ClockStraps::default(),
            flexcan_a: FlexcanEndpoint::default(),
            flexcan_b: FlexcanEndpoint::default(),
            flexcan_c: FlexcanEndpoint::default(),
            flexcan_d: FlexcanEndpoint::default(),
            eqadc_a: EqadcEndpoint::default(),
            eqadc_b: EqadcEndpoint::default(),
        }
    }
}

impl SocConfig {
    /// Parses a project config from a JSON string. Missing fields fall back
    /// to [`Default`] field-by-field (`#[serde(default)]`), so a config that
    /// only overrides `flexcan_a.port` is valid.
    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        let config: SocConfig = serde_json::from_str(contents)?;
        Ok(config)
    }

    /// Loads and parses a project config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading SoC config {}: {e}", path.as_ref().display()))?;
        Self::from_json(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disables_every_io_thread() {
        let config = SocConfig::default();
        assert_eq!(config.flexcan_a.port, None);
        assert_eq!(config.eqadc_b.port, None);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config = SocConfig::from_json(r#"{"flexcan_a": {"port": 9001}}"#).unwrap();
        assert_eq!(config.flexcan_a.port, Some(9001));
        assert_eq!(config.flexcan_a.host, "127.0.0.1");
        assert_eq!(config.flexcan_b.port, None);
        assert_eq!(config.clocks.fmpll_extal_hz, 40_000_000.0);
    }

    #[test]
    fn malformed_json_is_a_config_error_not_a_panic() {
        assert!(SocConfig::from_json("{not json").is_err());
    }
}
