//! `InterruptQueue`/`DmaRequestQueue` doubles, generalizing the per-crate
//! `NullIntc` fixture every peripheral crate's own tests already define
//! (`fabric-swt`, `fabric-edma`, `fabric-flexcan`, `fabric-eqadc`) into one
//! shared implementation, plus a recording variant for scenario tests that
//! need to assert which interrupt/DMA lines actually fired.

use std::sync::Mutex;

use fabric_core::{DmaRequest, DmaRequestQueue, InterruptQueue, InterruptSource};

/// Accepts every interrupt assertion and remembers it, in order, for
/// assertions in `fabric-sim`'s cross-peripheral scenario tests.
#[derive(Default)]
pub struct RecordingIntc {
    queued: Mutex<Vec<InterruptSource>>,
}

impl RecordingIntc {
    pub fn new() -> Self {
        RecordingIntc::default()
    }

    pub fn queued(&self) -> Vec<InterruptSource> {
        self.queued.lock().unwrap().clone()
    }

    pub fn take_queued(&self) -> Vec<InterruptSource> {
        std::mem::take(&mut self.queued.lock().unwrap())
    }
}

impl InterruptQueue for RecordingIntc {
    fn queue_external(&self, source: InterruptSource) {
        tracing::trace!(source = source.get(), "recording interrupt assertion");
        self.queued.lock().unwrap().push(source);
    }
}

/// Discards every DMA request line asserted against it, for tests of
/// peripherals that can assert DMA but whose scenario doesn't exercise it.
pub struct NullDma;

impl DmaRequestQueue for NullDma {
    fn assert_request(&self, _request: DmaRequest) {}
}

/// Records asserted DMA request lines, in order, for scenario tests that
/// wire a real `fabric_edma::Edma` against a channel's trigger source and
/// want to assert the request actually reached it.
#[derive(Default)]
pub struct RecordingDma {
    requested: Mutex<Vec<DmaRequest>>,
}

impl RecordingDma {
    pub fn new() -> Self {
        RecordingDma::default()
    }

    pub fn requested(&self) -> Vec<DmaRequest> {
        self.requested.lock().unwrap().clone()
    }
}

impl DmaRequestQueue for RecordingDma {
    fn assert_request(&self, request: DmaRequest) {
        tracing::trace!(request = request.get(), "recording DMA request assertion");
        self.requested.lock().unwrap().push(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_intc_remembers_assertions_in_order() {
        let intc = RecordingIntc::new();
        intc.queue_external(InterruptSource::new(3));
        intc.queue_external(InterruptSource::new(7));
        assert_eq!(intc.queued(), vec![InterruptSource::new(3), InterruptSource::new(7)]);
    }

    #[test]
    fn take_queued_drains() {
        let intc = RecordingIntc::new();
        intc.queue_external(InterruptSource::new(1));
        assert_eq!(intc.take_queued().len(), 1);
        assert!(intc.queued().is_empty());
    }

    #[test]
    fn recording_dma_remembers_requests() {
        let dma = RecordingDma::new();
        dma.assert_request(DmaRequest::new(5));
        assert_eq!(dma.requested(), vec![DmaRequest::new(5)]);
    }
}
