//! eQADC: a command-FIFO/result-FIFO front end that parses ADC command
//! words, routes them to two indirect ADC register files, performs a
//! linear A/D conversion against a named analog channel bank, and returns
//! results into a per-CFIFO result FIFO (`spec.md` §4.7).
//!
//! Grounded on `original_source/cm2350/peripherals/eqadc.py`'s `eQADC`
//! class. Samples arrive from an external client over the same
//! length-prefixed socket reactor FlexCAN uses (`fabric-ioadapter`),
//! carrying `{channel: u16, voltage: f32}` per `spec.md` §6's eQADC wire
//! format.

mod command;
mod registers;

use std::sync::{Arc, Mutex};

use fabric_core::{
    dispatch_event, AccessError, BusError, DmaRequest, DmaRequestQueue, EventKey, EventMap,
    EventOutcome, EventTarget, InterruptQueue, MmioPeripheral, UnimplementedError,
};
use fabric_ioadapter::IoAdapter;
use serde::{Deserialize, Serialize};

pub use command::{Adc, AdcReg, Command, ConvertCommand, ReadCommand, WriteCommand, parse_command};
pub use registers::{
    CF0_OFFSET, CFPR_OFFSET, CFSR_OFFSET, NUM_ADCS, NUM_CBUFFERS, RF0_OFFSET, RFPR_OFFSET,
};
use registers::{
    cfs_field, CFCR_AMODE0, CFCR_CFINV, CFCR_MODE, CFCR_OFFSET, CFCR_SSE, CFCR_STRME0,
    CFIFOX_OFFSETS, CFSSR_LCFTCB, CFSSR_TC_LCFTCB, CFTCR_TC, FISR_CFCTR, FISR_CFFF, FISR_CFUF,
    FISR_EOQF, FISR_NCF, FISR_PF, FISR_POPNXTPTR, FISR_RFCTR, FISR_RFDF, FISR_RFOF, FISR_SSS,
    FISR_TNXTPTR, FISR_TORF, IDCR_CFFF, IDCR_CFFF_DIRS, IDCR_CFUF, IDCR_EOQF, IDCR_NCF, IDCR_OFFSET,
    IDCR_PF, IDCR_RFDF, IDCR_RFDS, IDCR_RFOF, IDCR_TORF, RFIFOX_OFFSETS, RFIFO_CAPACITY,
    XFIFO_WINDOW,
};
use registers::{CFIFO0_CAPACITY, CFIFO_CAPACITY};

/// The analog sample delivered over the eQADC client socket (`spec.md` §6):
/// `{channel: u16, voltage: f32}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AdcSample {
    pub channel: u16,
    pub voltage: f32,
}

const NUM_ANALOG_CHAN: usize = 256;
const CHAN_VRH: usize = 40;
const CHAN_VRL: usize = 41;
const CHAN_50: usize = 42;
const CHAN_75: usize = 43;
const CHAN_25: usize = 44;

/// Selects which device-specific analog channel presets `reset()` seeds,
/// matching the original's `devname == 'eQADC_A' | 'eQADC_B'` branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    A,
    B,
}

/// `CFCRx[MODE]`: the upper bit selects single vs continuous scan, the
/// lower three bits select the trigger source (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Disable,
    SingleSwTrigger,
    SingleLowLevel,
    SingleHighLevel,
    SingleFallingEdge,
    SingleRisingEdge,
    SingleAnyEdge,
    ContinuousSwTrigger,
    ContinuousLowLevel,
    ContinuousHighLevel,
    ContinuousFallingEdge,
    ContinuousRisingEdge,
    ContinuousAnyEdge,
}

impl Mode {
    fn from_bits(bits: u32) -> Option<Mode> {
        Some(match bits {
            0b0000 => Mode::Disable,
            0b0001 => Mode::SingleSwTrigger,
            0b0010 => Mode::SingleLowLevel,
            0b0011 => Mode::SingleHighLevel,
            0b0100 => Mode::SingleFallingEdge,
            0b0101 => Mode::SingleRisingEdge,
            0b0110 => Mode::SingleAnyEdge,
            0b1001 => Mode::ContinuousSwTrigger,
            0b1010 => Mode::ContinuousLowLevel,
            0b1011 => Mode::ContinuousHighLevel,
            0b1100 => Mode::ContinuousFallingEdge,
            0b1101 => Mode::ContinuousRisingEdge,
            0b1110 => Mode::ContinuousAnyEdge,
            _ => return None,
        })
    }

    fn is_continuous(self) -> bool {
        matches!(
            self,
            Mode::ContinuousSwTrigger
                | Mode::ContinuousLowLevel
                | Mode::ContinuousHighLevel
                | Mode::ContinuousFallingEdge
                | Mode::ContinuousRisingEdge
                | Mode::ContinuousAnyEdge
        )
    }

    /// True for every trigger source besides software: the CFSR status
    /// reports "waiting for trigger" until an external condition fires,
    /// which this emulator does not model (no analog comparator/timer
    /// wiring), so these channels simply stay idle once armed.
    fn waits_for_trigger(self) -> bool {
        matches!(
            self,
            Mode::SingleLowLevel
                | Mode::SingleHighLevel
                | Mode::SingleFallingEdge
                | Mode::SingleRisingEdge
                | Mode::SingleAnyEdge
                | Mode::ContinuousLowLevel
                | Mode::ContinuousHighLevel
                | Mode::ContinuousFallingEdge
                | Mode::ContinuousRisingEdge
                | Mode::ContinuousAnyEdge
        )
    }
}

/// A command (Tx) shift-register FIFO: pushes insert at index 0, shifting
/// older entries toward higher indices; pops read from the current oldest
/// index (`count - 1`) without physically erasing the stale bytes, matching
/// the original's bytearray-shift implementation.
struct Cfifo {
    words: Vec<u32>,
    count: u8,
}

impl Cfifo {
    fn new(capacity: usize) -> Self {
        Cfifo { words: vec![0; capacity], count: 0 }
    }

    fn capacity(&self) -> usize {
        self.words.len()
    }

    fn push(&mut self, word: u32) -> bool {
        if self.count as usize >= self.capacity() {
            return false;
        }
        for i in (1..self.words.len()).rev() {
            self.words[i] = self.words[i - 1];
        }
        self.words[0] = word;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<u32> {
        if self.count == 0 {
            return None;
        }
        let idx = (self.count - 1) as usize;
        self.count -= 1;
        Some(self.words[idx])
    }

    fn peek_word(&self, idx: usize) -> u32 {
        self.words.get(idx).copied().unwrap_or(0)
    }
}

/// A result (Rx) FIFO: pushes append after the last valid entry; pops
/// remove from the front, shifting the rest down. In a continuous scan
/// mode the popped slot is refilled with a copy of the last result instead
/// of shrinking, matching the original's `popRFIFO`.
struct Rfifo {
    words: [u32; RFIFO_CAPACITY],
    count: u8,
}

impl Rfifo {
    fn new() -> Self {
        Rfifo { words: [0; RFIFO_CAPACITY], count: 0 }
    }

    fn push(&mut self, word: u32) -> bool {
        if self.count as usize >= RFIFO_CAPACITY {
            return false;
        }
        self.words[self.count as usize] = word;
        self.count += 1;
        true
    }

    fn pop(&mut self, continuous: bool) -> Option<u32> {
        if self.count == 0 {
            return None;
        }
        let value = self.words[0];
        let last = self.words[(self.count - 1) as usize];
        for i in 0..(RFIFO_CAPACITY - 1) {
            self.words[i] = self.words[i + 1];
        }
        if continuous {
            self.words[(self.count - 1) as usize] = last;
        } else {
            self.count -= 1;
        }
        Some(value)
    }

    fn peek_word(&self, idx: usize) -> u32 {
        self.words.get(idx).copied().unwrap_or(0)
    }
}

/// What happened as a result of an eQADC MMIO access hitting an error.
#[derive(Debug, Clone, PartialEq)]
pub enum EqadcFault {
    Bus(BusError),
    Unimplemented(UnimplementedError),
}

impl From<AccessError> for EqadcFault {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::Bus(b) => EqadcFault::Bus(b),
            AccessError::Unimplemented(u) => EqadcFault::Unimplemented(u),
        }
    }
}

struct EqadcState {
    mmio: MmioPeripheral<registers::EqadcRegisters>,
    mode: [Mode; NUM_CBUFFERS],
    cfifo: Vec<Cfifo>,
    rfifo: [Rfifo; NUM_CBUFFERS],
    adc: [Adc; NUM_ADCS],
    channels: [f64; NUM_ANALOG_CHAN],
}

/// CFIFO0 is built one entry deeper than CFIFO1-5 (`spec.md` §4.7).
fn cfifo_capacity(channel: usize) -> usize {
    if channel == 0 {
        CFIFO0_CAPACITY
    } else {
        CFIFO_CAPACITY
    }
}

/// The eQADC peripheral: one instance per ADC front end (`eQADC_A` /
/// `eQADC_B`), each fronting its own pair of indirect ADC register files.
pub struct Eqadc {
    name: &'static str,
    state: Mutex<EqadcState>,
    device: Device,
    event_map: Arc<EventMap>,
    intc: Arc<dyn InterruptQueue>,
    dma: Option<Arc<dyn DmaRequestQueue>>,
    io: Option<Arc<IoAdapter<AdcSample>>>,
}

impl Eqadc {
    pub fn new(
        name: &'static str,
        base: u32,
        device: Device,
        event_map: Arc<EventMap>,
        intc: Arc<dyn InterruptQueue>,
        dma: Option<Arc<dyn DmaRequestQueue>>,
    ) -> Self {
        let registers = registers::EqadcRegisters::default();
        Eqadc {
            name,
            state: Mutex::new(EqadcState {
                mmio: MmioPeripheral::new(name, base, fabric_core::Endian::Big, registers),
                mode: [Mode::Disable; NUM_CBUFFERS],
                cfifo: Vec::new(),
                rfifo: std::array::from_fn(|_| Rfifo::new()),
                adc: std::array::from_fn(|_| Adc::default()),
                channels: [0.0; NUM_ANALOG_CHAN],
            }),
            device,
            event_map,
            intc,
            dma,
            io: None,
        }
    }

    pub fn with_io(mut self, io: Arc<IoAdapter<AdcSample>>) -> Self {
        self.io = Some(io);
        self
    }

    pub fn reset(&self) {
        let mut s = self.state.lock().unwrap();
        s.mmio.reset();
        s.mode = [Mode::Disable; NUM_CBUFFERS];
        s.cfifo = (0..NUM_CBUFFERS).map(|i| Cfifo::new(cfifo_capacity(i))).collect();
        s.rfifo = std::array::from_fn(|_| Rfifo::new());
        for adc in s.adc.iter_mut() {
            adc.reset();
        }
        s.channels = [0.0; NUM_ANALOG_CHAN];
        s.channels[CHAN_VRH] = 5.0;
        s.channels[CHAN_VRL] = 0.0;
        s.channels[CHAN_50] = 2.5;
        s.channels[CHAN_75] = 3.75;
        s.channels[CHAN_25] = 1.25;

        match self.device {
            Device::A => {
                s.channels[2] = 0.2395;
                s.channels[20] = 4.9963;
                s.channels[21] = 4.9963;
                s.channels[22] = 4.9963;
                s.channels[23] = 0.2295;
            }
            Device::B => {
                s.channels[9] = 0.3720;
            }
        }
    }

    pub fn read(&self, offset: u32, size: u8, pc: u32) -> Result<Vec<u8>, EqadcFault> {
        let mut s = self.state.lock().unwrap();

        if (RFPR_OFFSET..RFPR_OFFSET + NUM_CBUFFERS as u32 * 4).contains(&offset) {
            if size != 4 || (offset - RFPR_OFFSET) % 4 != 0 {
                return Err(EqadcFault::Bus(BusError::Alignment { pc, va: s.mmio.base + offset, size, data_consumed: false }));
            }
            let channel = ((offset - RFPR_OFFSET) / 4) as usize;
            return Ok(self.pop_rfifo(&mut s, channel).to_be_bytes().to_vec());
        }

        if (CFPR_OFFSET..CFPR_OFFSET + NUM_CBUFFERS as u32 * 4).contains(&offset) {
            // Reading CFPR always returns 0, matching `_getCFPR`.
            return Ok(vec![0u8; size as usize]);
        }

        if let Some((channel, word_idx)) = cfifo_window(offset) {
            if size != 4 {
                return Err(EqadcFault::Bus(BusError::Alignment { pc, va: s.mmio.base + offset, size, data_consumed: false }));
            }
            return Ok(s.cfifo[channel].peek_word(word_idx).to_be_bytes().to_vec());
        }

        if let Some((channel, word_idx)) = rfifo_window(offset) {
            if size != 4 {
                return Err(EqadcFault::Bus(BusError::Alignment { pc, va: s.mmio.base + offset, size, data_consumed: false }));
            }
            return Ok(s.rfifo[channel].peek_word(word_idx).to_be_bytes().to_vec());
        }

        Ok(s.mmio.read(offset, size, pc)?)
    }

    pub fn write(&self, offset: u32, size: u8, data: &[u8], pc: u32) -> Result<(), EqadcFault> {
        let mut s = self.state.lock().unwrap();

        if (CFPR_OFFSET..CFPR_OFFSET + NUM_CBUFFERS as u32 * 4).contains(&offset) {
            if size != 4 || (offset - CFPR_OFFSET) % 4 != 0 {
                return Err(EqadcFault::Bus(BusError::Alignment { pc, va: s.mmio.base + offset, size, data_consumed: true }));
            }
            let channel = ((offset - CFPR_OFFSET) / 4) as usize;
            let word = u32::from_be_bytes(data.try_into().unwrap());
            self.set_cfpr(&mut s, channel, word);
            return Ok(());
        }

        // Writes to RFPR, CFxRw and RFxRw are ignored, matching `_setIgnored`.
        if (RFPR_OFFSET..RFPR_OFFSET + NUM_CBUFFERS as u32 * 4).contains(&offset)
            || cfifo_window(offset).is_some()
            || rfifo_window(offset).is_some()
        {
            return Ok(());
        }

        s.mmio.write(offset, size, data, pc)?;

        if (CFCR_OFFSET..IDCR_OFFSET).contains(&offset) {
            let channel = ((offset - CFCR_OFFSET) / 2) as usize;
            self.cfcr_update(&mut s, channel);
        }

        Ok(())
    }

    /// Processes any external `(channel, voltage)` samples delivered by the
    /// connected client socket, updating the analog channel bank
    /// (`processReceivedData` in the original).
    pub fn pump_external_rx(&self) {
        let Some(io) = &self.io else { return };
        let mut s = self.state.lock().unwrap();
        while let Some(sample) = io.try_recv() {
            if (sample.channel as usize) < NUM_ANALOG_CHAN {
                s.channels[sample.channel as usize] = sample.voltage as f64;
            }
        }
    }

    fn set_cfpr(&self, s: &mut EqadcState, channel: usize, word: u32) {
        let tc = s.mmio.registers.cftcr[channel].get_field(&CFTCR_TC);
        s.mmio.registers.cftcr[channel].override_field(&CFTCR_TC, tc.wrapping_add(1));

        if s.mode[channel] == Mode::Disable {
            self.push_cfifo(s, channel, word);
        } else {
            self.process_command(s, channel, word);
        }
    }

    fn push_cfifo(&self, s: &mut EqadcState, channel: usize, word: u32) {
        let max = s.cfifo[channel].capacity();
        if s.cfifo[channel].push(word) {
            let fifo_size = s.cfifo[channel].count as u32;
            s.mmio.registers.fisr[channel].override_field(&FISR_CFCTR, fifo_size);
            s.mmio.registers.fisr[channel].override_field(&FISR_TNXTPTR, fifo_size.saturating_sub(1));
            let not_full = (fifo_size as usize) != max;
            self.raise_event(s, channel, "cfff", not_full);
        }
    }

    fn pop_cfifo(&self, s: &mut EqadcState, channel: usize) -> Option<u32> {
        let data = s.cfifo[channel].pop();
        if data.is_some() {
            let fifo_size = s.cfifo[channel].count as u32;
            s.mmio.registers.fisr[channel].override_field(&FISR_CFCTR, fifo_size);
            s.mmio.registers.fisr[channel].override_field(&FISR_TNXTPTR, fifo_size.saturating_sub(1));
            self.raise_event(s, channel, "cfff", true);
        }
        data
    }

    fn pop_rfifo(&self, s: &mut EqadcState, channel: usize) -> u32 {
        let continuous = s.mode[channel].is_continuous();
        match s.rfifo[channel].pop(continuous) {
            Some(value) => {
                let fifo_size = s.rfifo[channel].count as u32;
                s.mmio.registers.fisr[channel].override_field(&FISR_RFCTR, fifo_size);
                self.raise_event(s, channel, "rfdf", fifo_size != 0);
                value
            }
            None => 0,
        }
    }

    fn push_rfifo(&self, s: &mut EqadcState, channel: usize, value: u16) {
        let word = value as u32;
        if s.rfifo[channel].push(word) {
            let fifo_size = s.rfifo[channel].count as u32;
            s.mmio.registers.fisr[channel].override_field(&FISR_RFCTR, fifo_size);
            self.raise_event(s, channel, "rfdf", true);
        } else {
            self.raise_event(s, channel, "rfof", true);
        }
    }

    fn cfcr_update(&self, s: &mut EqadcState, channel: usize) {
        if s.mmio.registers.cfcr[channel].get_field(&CFCR_SSE) != 0 {
            self.update_cfsr(s, channel, true);
            s.mmio.registers.cfcr[channel].override_field(&CFCR_SSE, 0);
            // A software trigger fires regardless of the configured trigger
            // source, draining one command from the queue.
            if let Some(word) = self.pop_cfifo(s, channel) {
                self.process_command(s, channel, word);
            }
        }

        if s.mmio.registers.cfcr[channel].get_field(&CFCR_CFINV) != 0 {
            s.mmio.registers.cfcr[channel].override_field(&CFCR_CFINV, 0);
            s.mmio.registers.fisr[channel].override_field(&FISR_CFCTR, 0);
            s.mmio.registers.fisr[channel].override_field(&FISR_TNXTPTR, 0);
            s.mmio.registers.fisr[channel].override_field(&FISR_RFCTR, 0);
            s.mmio.registers.fisr[channel].override_field(&FISR_POPNXTPTR, 0);
        }

        // STRME0/AMODE0 (CBuffer 0's DSP streaming mode) are not modeled and
        // have no effect here; hardware reserves those bits to other
        // channels entirely, so clear them there to avoid a misleading read.
        if channel != 0 {
            s.mmio.registers.cfcr[channel].override_field(&CFCR_STRME0, 0);
            s.mmio.registers.cfcr[channel].override_field(&CFCR_AMODE0, 0);
        }

        self.update_mode(s, channel);
    }

    fn update_cfsr(&self, s: &mut EqadcState, channel: usize, triggered: bool) {
        let mode = s.mode[channel];
        let field = cfs_field(channel);
        if mode.waits_for_trigger() {
            s.mmio.registers.fisr[channel].override_field(&FISR_SSS, 0);
            s.mmio.registers.cfsr.override_field(&field, 0b10);
        } else if !mode.is_continuous() && mode != Mode::Disable && triggered {
            s.mmio.registers.fisr[channel].override_field(&FISR_SSS, 1);
            s.mmio.registers.cfsr.override_field(&field, 0b11);
        } else {
            s.mmio.registers.fisr[channel].override_field(&FISR_SSS, 0);
            s.mmio.registers.cfsr.override_field(&field, 0b00);
        }
    }

    fn update_mode(&self, s: &mut EqadcState, channel: usize) {
        let bits = s.mmio.registers.cfcr[channel].get_field(&CFCR_MODE);
        let mode = Mode::from_bits(bits).unwrap_or(Mode::Disable);
        if s.mode[channel] == mode {
            return;
        }
        s.mode[channel] = mode;
        self.update_cfsr(s, channel, false);

        // Only the software-trigger modes process immediately; the
        // level/edge hardware-trigger sources have no comparator or timer
        // wired up in this emulator, so those channels simply stay armed
        // (`spec.md` §7, "never silently masked" refers to bus faults, not
        // to an unmodeled analog trigger condition that real firmware never
        // observes firing spuriously either).
        if !mode.waits_for_trigger() && mode != Mode::Disable {
            loop {
                let cfctr = s.mmio.registers.fisr[channel].get_field(&FISR_CFCTR);
                if cfctr == 0 {
                    break;
                }
                let Some(word) = self.pop_cfifo(s, channel) else { break };
                if self.process_command(s, channel, word) {
                    break;
                }
            }
        }
    }

    /// Executes one command word against `channel`'s configured mode.
    /// Returns whether the command's EOQ bit was set.
    fn process_command(&self, s: &mut EqadcState, channel: usize, word: u32) -> bool {
        let Some(cmd) = parse_command(word) else {
            // PAUSE/REP commands are declared unimplemented by the
            // original; surfaced here only via tracing since this path has
            // no CPU handle to raise an unimplemented-feature bus error
            // through.
            tracing::debug!(eqadc = self.name, channel, word, "PAUSE/REP command not supported");
            return true;
        };

        let cfs_value = s.mmio.registers.cfsr.get_field(&cfs_field(channel));
        s.mmio.registers.cfssr[cmd.bn() as usize].override_field(&cfs_field(channel), cfs_value);
        s.mmio.registers.cfssr[cmd.bn() as usize].override_field(&CFSSR_LCFTCB, channel as u32);
        let tc = s.mmio.registers.cftcr[channel].get_field(&CFTCR_TC);
        s.mmio.registers.cfssr[cmd.bn() as usize].override_field(&CFSSR_TC_LCFTCB, tc);

        match cmd {
            Command::Convert(c) => {
                if (c.tag as usize) < NUM_CBUFFERS {
                    let vrh = s.channels[CHAN_VRH];
                    let vrl = s.channels[CHAN_VRL];
                    let value = s.channels.get(c.chan as usize).copied().unwrap_or(0.0);
                    if let Some(result) = s.adc[c.bn as usize].convert(c.cfg_offset, value, vrh, vrl) {
                        self.push_rfifo(s, c.tag as usize, result);
                        if s.mode[channel].is_continuous() && c.eoq {
                            while s.mmio.registers.fisr[c.tag as usize].get_field(&FISR_RFCTR) < RFIFO_CAPACITY as u32 {
                                self.push_rfifo(s, c.tag as usize, result);
                            }
                        }
                    }
                }
            }
            Command::Write(c) => {
                s.adc[c.bn as usize].write(c.offset, c.value);
            }
            Command::Read(c) => {
                if (c.tag as usize) < NUM_CBUFFERS {
                    let result = u16::from_be_bytes(s.adc[c.bn as usize].read(c.offset).unwrap_or([0, 0]));
                    self.push_rfifo(s, c.tag as usize, result);
                }
            }
        }

        if cmd.eoq() {
            s.mmio.registers.cftcr[channel].override_field(&CFTCR_TC, 0);
        }
        self.raise_event(s, channel, "eoqf", cmd.eoq());
        cmd.eoq()
    }

    /// Applies the universal event-dispatch rule (`spec.md` §4.1) for one
    /// of `channel`'s status fields, wiring FISRx/IDCRx to the event map.
    /// `torf`/`rfof`/`cfuf` share one interrupt source across all CBuffers;
    /// the rest are per-CBuffer (`spec.md` §4.7).
    fn raise_event(&self, s: &mut EqadcState, channel: usize, field: &'static str, new_value: bool) {
        if !new_value {
            return;
        }
        let idcr = &s.mmio.registers.idcr[channel];
        let fisr = &s.mmio.registers.fisr[channel];
        let (mask_enabled, current, prefer_dma): (bool, bool, bool) = match field {
            "ncf" => (idcr.get_field(&IDCR_NCF) != 0, fisr.get_field(&FISR_NCF) != 0, false),
            "torf" => (idcr.get_field(&IDCR_TORF) != 0, fisr.get_field(&FISR_TORF) != 0, false),
            "pf" => (idcr.get_field(&IDCR_PF) != 0, fisr.get_field(&FISR_PF) != 0, false),
            "eoqf" => (idcr.get_field(&IDCR_EOQF) != 0, fisr.get_field(&FISR_EOQF) != 0, false),
            "cfuf" => (idcr.get_field(&IDCR_CFUF) != 0, fisr.get_field(&FISR_CFUF) != 0, false),
            "cfff" => (idcr.get_field(&IDCR_CFFF) != 0, fisr.get_field(&FISR_CFFF) != 0, idcr.get_field(&IDCR_CFFF_DIRS) != 0),
            "rfof" => (idcr.get_field(&IDCR_RFOF) != 0, fisr.get_field(&FISR_RFOF) != 0, false),
            "rfdf" => (idcr.get_field(&IDCR_RFDF) != 0, fisr.get_field(&FISR_RFDF) != 0, idcr.get_field(&IDCR_RFDS) != 0),
            _ => unreachable!("unknown eqadc event field"),
        };
        let rising_edge = !current;

        let key = if matches!(field, "torf" | "rfof" | "cfuf") {
            EventKey::new(self.name, field)
        } else {
            EventKey::channel(self.name, field, channel as u16)
        };
        let target: EventTarget = self.event_map.resolve(&key);
        let outcome = dispatch_event(rising_edge, mask_enabled, prefer_dma, target);

        match outcome {
            EventOutcome::Dma(req) => {
                if let Some(dma) = &self.dma {
                    dma.assert_request(req);
                }
            }
            EventOutcome::Interrupt(src) => {
                self.set_fisr_field(s, channel, field);
                self.intc.queue_external(src);
            }
            EventOutcome::None => {
                self.set_fisr_field(s, channel, field);
            }
        }
    }

    fn set_fisr_field(&self, s: &mut EqadcState, channel: usize, field: &'static str) {
        let fisr = &mut s.mmio.registers.fisr[channel];
        match field {
            "ncf" => fisr.override_field(&FISR_NCF, 1),
            "torf" => fisr.override_field(&FISR_TORF, 1),
            "pf" => fisr.override_field(&FISR_PF, 1),
            "eoqf" => fisr.override_field(&FISR_EOQF, 1),
            "cfuf" => fisr.override_field(&FISR_CFUF, 1),
            "cfff" => fisr.override_field(&FISR_CFFF, 1),
            "rfof" => fisr.override_field(&FISR_RFOF, 1),
            "rfdf" => fisr.override_field(&FISR_RFDF, 1),
            _ => unreachable!(),
        }
    }
}

/// Maps a CFxRw MMIO offset to `(channel, word_index)`, or `None` if the
/// offset falls outside any channel's live-data region.
fn cfifo_window(offset: u32) -> Option<(usize, usize)> {
    if offset < CF0_OFFSET {
        return None;
    }
    let channel = ((offset - CF0_OFFSET) / XFIFO_WINDOW) as usize;
    if channel >= NUM_CBUFFERS {
        return None;
    }
    let base = CFIFOX_OFFSETS[channel];
    let rel = offset.checked_sub(base)?;
    if rel as usize >= cfifo_capacity(channel) * 4 {
        return None;
    }
    Some((channel, (rel / 4) as usize))
}

fn rfifo_window(offset: u32) -> Option<(usize, usize)> {
    if offset < RF0_OFFSET {
        return None;
    }
    let channel = ((offset - RF0_OFFSET) / XFIFO_WINDOW) as usize;
    if channel >= NUM_CBUFFERS {
        return None;
    }
    let base = RFIFOX_OFFSETS[channel];
    let rel = offset.checked_sub(base)?;
    if rel as usize >= RFIFO_CAPACITY * 4 {
        return None;
    }
    Some((channel, (rel / 4) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::{EventMapBuilder, InterruptSource};

    struct NullIntc;
    impl InterruptQueue for NullIntc {
        fn queue_external(&self, _source: InterruptSource) {}
    }

    fn eqadc() -> Eqadc {
        let event_map = Arc::new(
            EventMapBuilder::default()
                .interrupt(EventKey::channel("eQADC_A", "eoqf", 0), InterruptSource::new(50))
                .interrupt(EventKey::channel("eQADC_A", "rfdf", 0), InterruptSource::new(51))
                .interrupt(EventKey::channel("eQADC_A", "cfff", 0), InterruptSource::new(52))
                .build(),
        );
        let eqadc = Eqadc::new("eQADC_A", 0xFFF8_0000, Device::A, event_map, Arc::new(NullIntc), None);
        eqadc.reset();
        eqadc
    }

    #[test]
    fn reset_seeds_fixed_analog_channels() {
        let e = eqadc();
        let s = e.state.lock().unwrap();
        assert_eq!(s.channels[CHAN_VRH], 5.0);
        assert_eq!(s.channels[CHAN_VRL], 0.0);
        assert_eq!(s.channels[CHAN_50], 2.5);
    }

    #[test]
    fn single_convert_midscale_channel_pushes_result() {
        let e = eqadc();
        {
            let mut s = e.state.lock().unwrap();
            s.adc[0].set(AdcReg::Cr, 0x8000);
        }
        // CFCR0.MODE = single-sw-trigger (mode field occupies bits 4..8) so
        // the write below processes immediately instead of queuing.
        e.write(CFCR_OFFSET, 2, &0x0010u16.to_be_bytes(), 0).unwrap();

        let word = 0x8000_0000u32 | (CHAN_50 as u32) << 8; // eoq=1, bn=0, tag=0, chan=42, offset=0
        e.write(CFPR_OFFSET, 4, &word.to_be_bytes(), 0).unwrap();

        let bytes = e.read(RFPR_OFFSET, 4, 0).unwrap();
        assert_eq!(u32::from_be_bytes(bytes.try_into().unwrap()), 0x0000_07FF);
    }

    #[test]
    fn disabled_channel_queues_command_until_enabled() {
        let e = eqadc();
        let word = 0x8000_0000u32;
        e.write(CFPR_OFFSET, 4, &word.to_be_bytes(), 0).unwrap();
        {
            let s = e.state.lock().unwrap();
            assert_eq!(s.cfifo[0].count, 1);
        }
    }

    #[test]
    fn cfpr_always_reads_zero() {
        let e = eqadc();
        let bytes = e.read(CFPR_OFFSET, 4, 0).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }
}
