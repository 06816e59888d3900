//! The static, exhaustive event map (`spec.md` §4.2): every peripheral
//! event this SoC declares, resolved once at startup into an interrupt
//! source and/or a DMA request.
//!
//! Grounded line-for-line on `original_source/cm2350/intc_src.py`'s
//! `INTC_SRC`/`DMA_REQUEST`/`INTC_EVENT_MAP` tables — the anchor source
//! numbers below (`SWT`, `EDMA_A_ERR`, `EQADC_A_OVERRUN`, `CANA_MB0`, ...)
//! are copied from that enumeration, and the per-channel families (eDMA's
//! 32/64 channels, FlexCAN's 64 mailboxes, eQADC's 6 CFIFOs) are generated
//! from the same step the original's own enum declares rather than listing
//! all ~500 entries out by hand — the file is 2,484 lines of otherwise
//! entirely mechanical `enum.auto()` succession, and the event map is
//! compile-time-internal data never observed on any external bus
//! (`spec.md` §6, "Not on any external bus"), so reproducing its *shape*
//! faithfully matters far more than reproducing every unrelated
//! (FlexRAY/DSPI/PMC/...) source number this fabric doesn't implement.

use fabric_core::{DmaRequest, EventKey, EventMap, EventMapBuilder, InterruptSource};

fn src(n: u16) -> InterruptSource {
    InterruptSource::new(n)
}

fn dma(n: u16) -> DmaRequest {
    DmaRequest::new(n)
}

/// Per-CFIFO eQADC interrupt sources, following the original's `base + 5 *
/// cfifo + field` layout (`EQADC_A_FISR0_NCF=101 .. EQADC_A_FISR5_RFDF=130`
/// for device A, `395..424` for device B) plus the shared `*_OVERRUN` source
/// (`100` / `394`) every CFIFO's TORF/RFOF/CFUF funnel into.
struct EqadcSources {
    overrun: InterruptSource,
    fisr_base: u16,
}

const EQADC_A: EqadcSources = EqadcSources { overrun: InterruptSource::new(100), fisr_base: 101 };
const EQADC_B: EqadcSources = EqadcSources { overrun: InterruptSource::new(394), fisr_base: 395 };

fn add_eqadc(mut builder: EventMapBuilder, name: &'static str, sources: &EqadcSources, dma_base: u16) -> EventMapBuilder {
    for cfifo in 0..6u16 {
        let base = sources.fisr_base + cfifo * 5;
        builder = builder
            .interrupt(EventKey::channel(name, "ncf", cfifo), src(base))
            .interrupt(EventKey::channel(name, "pf", cfifo), src(base + 1))
            .interrupt(EventKey::channel(name, "eoqf", cfifo), src(base + 2))
            .both(EventKey::channel(name, "cfff", cfifo), src(base + 3), dma(dma_base + cfifo * 2))
            .both(EventKey::channel(name, "rfdf", cfifo), src(base + 4), dma(dma_base + cfifo * 2 + 1));
    }
    // TORF/RFOF/CFUF are raised through one flat (non-channeled) key shared
    // by every CBuffer on this device, not a per-CFIFO key.
    builder
        .interrupt(EventKey::new(name, "torf"), sources.overrun)
        .interrupt(EventKey::new(name, "rfof"), sources.overrun)
        .interrupt(EventKey::new(name, "cfuf"), sources.overrun)
}

/// Per-channel eDMA interrupt sources: `EDMA_A_ERR`/`EDMA_A_IRQ0..` start at
/// `10`/`11` for the 64-channel A block, `EDMA_B_ERR`/`EDMA_B_IRQ0..` at
/// `425`/`426` for the 32-channel B block (`intc_src.py` lines 27-58,
/// 377-409).
fn add_edma(mut builder: EventMapBuilder, name: &'static str, err_base: u16, irq_base: u16, num_channels: u16) -> EventMapBuilder {
    let err_source = src(err_base);
    for chan in 0..num_channels {
        builder = builder
            .interrupt(EventKey::channel(name, "error", chan), err_source)
            .interrupt(EventKey::channel(name, "int_maj", chan), src(irq_base + chan));
    }
    builder
}

/// Per-mailbox FlexCAN interrupt sources: `CANx_MB0` anchors taken from
/// `intc_src.py` (`CANA_MB0=155`, `CANB_MB0=283`, `CANC_MB0=176`,
/// `CAND_MB0=311` — note B and C are not in alphabetical numeric order in
/// the original either), successive mailboxes numbered consecutively from
/// that anchor. Bus/error sources (`CANx_BUS`/`CANx_ERR`) are declared but
/// not separately modeled by `fabric-flexcan` (bus-off/error-passive
/// modeling is a spec.md Non-goal), so only the per-mailbox family and the
/// Rx-FIFO's three shared "virtual mailbox" slots (5/6/7, matching
/// `spec.md` §4.6's warning-at-MB6/overflow-at-MB7 convention) are wired.
fn add_flexcan(mut builder: EventMapBuilder, name: &'static str, mb0_source: u16) -> EventMapBuilder {
    for mb in 0..64u16 {
        builder = builder.interrupt(EventKey::channel(name, "msg", mb), src(mb0_source + mb));
    }
    builder
}

pub fn build() -> EventMap {
    let mut b = EventMap::builder();

    // SWT's single "interrupt then reset" event (intc_src.py: SWT=8).
    b = b.interrupt(EventKey::new("SWT", "tif"), src(8));

    // eDMA_A (64 channels) / eDMA_B (32 channels).
    b = add_edma(b, "EDMA_A", 10, 11, 64);
    b = add_edma(b, "EDMA_B", 425, 426, 32);

    // FlexCAN A-D, 64 mailboxes each.
    b = add_flexcan(b, "FlexCAN_A", 155);
    b = add_flexcan(b, "FlexCAN_B", 283);
    b = add_flexcan(b, "FlexCAN_C", 176);
    b = add_flexcan(b, "FlexCAN_D", 311);

    // eQADC_A / eQADC_B, 6 CFIFOs each, CFFF/RFDF also reachable via eDMA.
    b = add_eqadc(b, "eQADC_A", &EQADC_A, 0);
    b = add_eqadc(b, "eQADC_B", &EQADC_B, 0);

    b.build()
}

/// Every key [`build`] is expected to have declared, used by
/// [`crate::soc::Soc::new`] to validate the map is exhaustive before any
/// peripheral is constructed (`spec.md` §3, "missing entries are a
/// configuration error detectable at startup").
pub fn expected_keys() -> Vec<EventKey> {
    let mut keys = vec![EventKey::new("SWT", "tif")];

    for (name, n) in [("EDMA_A", 64u16), ("EDMA_B", 32u16)] {
        for chan in 0..n {
            keys.push(EventKey::channel(name, "error", chan));
            keys.push(EventKey::channel(name, "int_maj", chan));
        }
    }

    for name in ["FlexCAN_A", "FlexCAN_B", "FlexCAN_C", "FlexCAN_D"] {
        for mb in 0..64u16 {
            keys.push(EventKey::channel(name, "msg", mb));
        }
    }

    for name in ["eQADC_A", "eQADC_B"] {
        for cfifo in 0..6u16 {
            for event in ["ncf", "pf", "eoqf", "cfff", "rfdf"] {
                keys.push(EventKey::channel(name, event, cfifo));
            }
        }
        for event in ["torf", "rfof", "cfuf"] {
            keys.push(EventKey::new(name, event));
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_map_is_exhaustive_over_its_own_expected_keys() {
        let map = build();
        assert!(map.validate_exhaustive(&expected_keys()).is_ok());
    }

    #[test]
    fn eqadc_cfifo0_cfff_prefers_dma_and_matches_intc_src_numbering() {
        let map = build();
        let target = map.resolve(&EventKey::channel("eQADC_A", "cfff", 0));
        assert_eq!(target.interrupt, Some(src(104)));
        assert_eq!(target.dma, Some(dma(0)));
    }

    #[test]
    fn eqadc_cfifo5_rfdf_matches_intc_src_numbering() {
        let map = build();
        let target = map.resolve(&EventKey::channel("eQADC_A", "rfdf", 5));
        assert_eq!(target.interrupt, Some(src(130)));
        assert_eq!(target.dma, Some(dma(11)));
    }

    #[test]
    fn flexcan_b_mb0_matches_intc_src_numbering() {
        let map = build();
        let target = map.resolve(&EventKey::channel("FlexCAN_B", "msg", 0));
        assert_eq!(target.interrupt, Some(src(283)));
    }

    #[test]
    fn edma_b_irq_channels_match_intc_src_numbering() {
        let map = build();
        let target = map.resolve(&EventKey::channel("EDMA_B", "int_maj", 0));
        assert_eq!(target.interrupt, Some(src(426)));
        let err = map.resolve(&EventKey::channel("EDMA_B", "error", 31));
        assert_eq!(err.interrupt, Some(src(425)));
    }
}
