//! A `Cpu` double combining the register-map fixture every peripheral
//! crate's own tests use (`StubCpu` in `fabric-intc`/`fabric-swt`) with the
//! flat byte-addressed RAM backing `fabric-edma`'s `RamCpu` test fixture
//! uses for its transfer-correctness tests. `fabric-sim`'s scenario tests
//! need both at once: eDMA-driven transfers read/write through `read_memory`/
//! `write_memory`, while exception delivery and timer-paced peripherals
//! (SWT, FlexCAN's bit clock) read/write named registers and check
//! `system_time`.

use std::collections::HashMap;

use fabric_core::{BusError, CpuReg, CurInstr, Cpu, Exception, TlbEntry};

/// A `Cpu` implementation backed by plain host-side maps: no MMU, no
/// instruction decoding, no exception delivery beyond recording what was
/// queued. `system_time` is settable directly rather than advancing on its
/// own, so timer-driven tests can jump straight to the instant they care
/// about instead of ticking a simulated clock.
pub struct MockCpu {
    regs: HashMap<CpuReg, u64>,
    mem: HashMap<u32, u8>,
    pc: u32,
    time: f64,
    queued_exceptions: Vec<Exception>,
    ram_ranges: Vec<(u32, u32)>,
}

impl MockCpu {
    pub fn new() -> Self {
        let mut regs = HashMap::new();
        // A plausible boot-time IVPR/IVOR(4) pair, matching fabric-intc's
        // StubCpu fixture, so exception-delivery assertions have something
        // non-zero to check without every test setting it up itself.
        regs.insert(CpuReg::Ivpr, 0x0040_0000);
        regs.insert(CpuReg::Ivor(4), 0x0000_0900);
        MockCpu {
            regs,
            mem: HashMap::new(),
            pc: 0,
            time: 0.0,
            queued_exceptions: Vec::new(),
            ram_ranges: vec![(0, u32::MAX)],
        }
    }

    /// Overrides the clock scenario tests observe through `system_time()`.
    pub fn set_time(&mut self, seconds: f64) {
        self.time = seconds;
    }

    pub fn advance_time(&mut self, delta_seconds: f64) {
        self.time += delta_seconds;
    }

    /// Restricts `ram_ranges()` to exactly the given spans, for tests that
    /// assert on out-of-range DMA/bus behavior.
    pub fn set_ram_ranges(&mut self, ranges: Vec<(u32, u32)>) {
        self.ram_ranges = ranges;
    }

    /// The exceptions enqueued since the last call, in delivery order.
    pub fn take_queued_exceptions(&mut self) -> Vec<Exception> {
        std::mem::take(&mut self.queued_exceptions)
    }
}

impl Default for MockCpu {
    fn default() -> Self {
        MockCpu::new()
    }
}

impl Cpu for MockCpu {
    fn get_register(&self, reg: CpuReg) -> u64 {
        *self.regs.get(&reg).unwrap_or(&0)
    }

    fn set_register(&mut self, reg: CpuReg, value: u64) {
        self.regs.insert(reg, value);
    }

    fn get_pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, va: u32) {
        self.pc = va;
    }

    fn cur_instr(&self) -> CurInstr {
        CurInstr {
            opcode_info: String::new(),
            pc: self.pc,
            raw_bytes: Vec::new(),
            vle: false,
        }
    }

    fn read_memory(&mut self, va: u32, size: u8) -> Result<Vec<u8>, BusError> {
        Ok((0..size as u32)
            .map(|i| *self.mem.get(&va.wrapping_add(i)).unwrap_or(&0))
            .collect())
    }

    fn write_memory(&mut self, va: u32, data: &[u8]) -> Result<(), BusError> {
        for (i, b) in data.iter().enumerate() {
            self.mem.insert(va.wrapping_add(i as u32), *b);
        }
        Ok(())
    }

    fn translate_instr(&self, va: u32) -> (u32, bool) {
        (va, false)
    }

    fn translate_data(&self, va: u32) -> TlbEntry {
        TlbEntry {
            pa: va,
            cache_inhibited: false,
            write_through: false,
        }
    }

    fn enqueue_exception(&mut self, exc: Exception) {
        self.queued_exceptions.push(exc);
    }

    fn system_time(&self) -> f64 {
        self.time
    }

    fn ram_ranges(&self) -> Vec<(u32, u32)> {
        self.ram_ranges.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_memory() {
        let mut cpu = MockCpu::new();
        cpu.write_memory(0x1000, &[1, 2, 3, 4]).unwrap();
        assert_eq!(cpu.read_memory(0x1000, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unwritten_memory_reads_zero() {
        let mut cpu = MockCpu::new();
        assert_eq!(cpu.read_memory(0xDEAD_0000, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn records_queued_exceptions() {
        let mut cpu = MockCpu::new();
        cpu.enqueue_exception(Exception::new(fabric_core::ExceptionClass::External));
        assert_eq!(cpu.take_queued_exceptions().len(), 1);
        assert!(cpu.take_queued_exceptions().is_empty());
    }

    #[test]
    fn time_is_settable_and_advances() {
        let mut cpu = MockCpu::new();
        cpu.set_time(10.0);
        cpu.advance_time(0.5);
        assert_eq!(cpu.system_time(), 10.5);
    }
}
