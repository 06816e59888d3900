//! The event map: a static, exhaustive table mapping a peripheral-local
//! event name to an interrupt source and/or a DMA request (`spec.md` §4.2),
//! plus the shared dispatch rule every peripheral's `event(...)` entry point
//! applies (`spec.md` §4.1, "Event surface").

use std::collections::HashMap;

/// A 9-bit SoC interrupt source identifier. Disjoint from CPU-fault
/// vectors; ordering among sources is by INTC's Priority Select Register,
/// not by this value, so this type deliberately does not implement `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterruptSource(u16);

impl InterruptSource {
    pub const MAX: u16 = 511;

    pub fn new(source: u16) -> Self {
        assert!(source <= Self::MAX, "interrupt source out of 9-bit range");
        InterruptSource(source)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

/// A DMA request line. Distinct namespace from interrupt sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaRequest(u16);

impl DmaRequest {
    pub fn new(request: u16) -> Self {
        DmaRequest(request)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

/// Identifies one declared event: a peripheral instance name, an
/// event-name, and an optional channel for arrayed peripherals (eDMA
/// channels, FlexCAN mailboxes, eQADC CFIFOs).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub peripheral: &'static str,
    pub event: &'static str,
    pub channel: Option<u16>,
}

impl EventKey {
    pub fn new(peripheral: &'static str, event: &'static str) -> Self {
        EventKey {
            peripheral,
            event,
            channel: None,
        }
    }

    pub fn channel(peripheral: &'static str, event: &'static str, channel: u16) -> Self {
        EventKey {
            peripheral,
            event,
            channel: Some(channel),
        }
    }
}

/// The resolved target(s) for one event. Either component may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTarget {
    pub interrupt: Option<InterruptSource>,
    pub dma: Option<DmaRequest>,
}

/// Raised when the event map is missing a declared key at startup
/// (`spec.md` §3, "missing entries are a configuration error detectable at
/// startup").
#[derive(Debug, Clone, thiserror::Error)]
#[error("event map is not exhaustive: missing entry for {0:?}")]
pub struct EventMapGapError(pub EventKey);

/// A static, exhaustive table of `EventKey -> EventTarget`. Built once at
/// SoC construction time and shared (read-only) by every peripheral; it is
/// the single source of truth for interrupt source numbers, so peripheral
/// code never hard-codes one.
#[derive(Debug, Default, Clone)]
pub struct EventMap {
    entries: HashMap<EventKey, EventTarget>,
}

impl EventMap {
    pub fn builder() -> EventMapBuilder {
        EventMapBuilder::default()
    }

    pub fn resolve(&self, key: &EventKey) -> EventTarget {
        self.entries.get(key).copied().unwrap_or_default()
    }

    /// Verifies every key in `expected` has an entry (present, even if both
    /// components are `None` would still count as declared-absent; what's
    /// disallowed is a key nobody ever declared).
    pub fn validate_exhaustive(&self, expected: &[EventKey]) -> Result<(), EventMapGapError> {
        for key in expected {
            if !self.entries.contains_key(key) {
                return Err(EventMapGapError(key.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EventMapBuilder {
    entries: HashMap<EventKey, EventTarget>,
}

impl EventMapBuilder {
    pub fn interrupt(mut self, key: EventKey, source: InterruptSource) -> Self {
        self.entries.entry(key).or_default().interrupt = Some(source);
        self
    }

    pub fn dma(mut self, key: EventKey, request: DmaRequest) -> Self {
        self.entries.entry(key).or_default().dma = Some(request);
        self
    }

    pub fn both(mut self, key: EventKey, source: InterruptSource, request: DmaRequest) -> Self {
        let entry = self.entries.entry(key).or_default();
        entry.interrupt = Some(source);
        entry.dma = Some(request);
        self
    }

    /// Declares a key with neither an interrupt nor a DMA request, marking
    /// it "known absent" so `validate_exhaustive` does not flag it as a gap.
    pub fn none(mut self, key: EventKey) -> Self {
        self.entries.entry(key).or_default();
        self
    }

    pub fn build(self) -> EventMap {
        EventMap {
            entries: self.entries,
        }
    }
}

/// What a peripheral's `event(...)` call should do, per the dispatch rule in
/// `spec.md` §4.1: an interrupt is queued only on a 0->1 status transition
/// with its mask bit set; if a DMA request is mapped *and* the peripheral's
/// interrupt-vs-DMA selector prefers it, the DMA request is issued instead
/// and the status bit must NOT be set by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Neither an interrupt nor a DMA request fires; the peripheral still
    /// records the status bit (if it was a rising edge).
    None,
    Interrupt(InterruptSource),
    Dma(DmaRequest),
}

/// Applies the dispatch rule. `prefer_dma` is the peripheral's own
/// interrupt-vs-DMA selector bit (e.g. eDMA's per-channel D_REQ convention,
/// eQADC's DMA-enable bit); it only takes effect if the event map actually
/// maps a DMA request for this key.
pub fn dispatch_event(
    rising_edge: bool,
    mask_enabled: bool,
    prefer_dma: bool,
    target: EventTarget,
) -> EventOutcome {
    if prefer_dma {
        if let Some(req) = target.dma {
            return EventOutcome::Dma(req);
        }
    }
    if rising_edge && mask_enabled {
        if let Some(src) = target.interrupt {
            return EventOutcome::Interrupt(src);
        }
    }
    EventOutcome::None
}

/// A narrow handle peripherals use to queue an interrupt source into INTC
/// without depending on the `fabric-intc` crate directly (breaks the
/// dependency cycle; implemented by `fabric-intc::Intc`'s shared handle).
pub trait InterruptQueue: Send + Sync {
    fn queue_external(&self, source: InterruptSource);
}

/// A narrow handle peripherals use to assert a DMA request line, implemented
/// by `fabric-edma`'s engine handle.
pub trait DmaRequestQueue: Send + Sync {
    fn assert_request(&self, request: DmaRequest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_prefers_dma_when_selected_and_mapped() {
        let target = EventTarget {
            interrupt: Some(InterruptSource::new(10)),
            dma: Some(DmaRequest::new(3)),
        };
        assert_eq!(
            dispatch_event(true, true, true, target),
            EventOutcome::Dma(DmaRequest::new(3))
        );
    }

    #[test]
    fn dispatch_falls_back_to_interrupt_without_dma_mapping() {
        let target = EventTarget {
            interrupt: Some(InterruptSource::new(10)),
            dma: None,
        };
        assert_eq!(
            dispatch_event(true, true, true, target),
            EventOutcome::Interrupt(InterruptSource::new(10))
        );
    }

    #[test]
    fn dispatch_none_without_rising_edge_or_mask() {
        let target = EventTarget {
            interrupt: Some(InterruptSource::new(10)),
            dma: None,
        };
        assert_eq!(dispatch_event(false, true, false, target), EventOutcome::None);
        assert_eq!(dispatch_event(true, false, false, target), EventOutcome::None);
    }

    #[test]
    fn validate_exhaustive_reports_gap() {
        let map = EventMap::builder()
            .interrupt(EventKey::new("SWT", "timeout"), InterruptSource::new(1))
            .build();
        let expected = vec![
            EventKey::new("SWT", "timeout"),
            EventKey::new("SWT", "other"),
        ];
        assert!(map.validate_exhaustive(&expected).is_err());
    }
}
