//! The FlexCAN controller: mailbox CODE state machine, Rx FIFO with its
//! three parallel filter caches, RTR auto-reply, self-reception/loopback,
//! and the bit-clock timer.
//!
//! Grounded on `original_source/cm2350/peripherals/flexcan.py`. This
//! emulation carries the same scope cut the original documents: bus-off
//! transitions and CAN bus error states are not modeled (the bus is
//! considered always-up once enabled), and the MMIO range is not
//! dynamically trimmed based on `MCR[MAXMB]`.
//!
//! Two source-level issues in the original were normalized rather than
//! ported verbatim (see `DESIGN.md` for the full rationale):
//! - `mcrUpdate`'s mailbox rescan referenced an undefined `mb_idx` local
//!   (the loop variable is named `mb`); this port just uses the loop
//!   variable directly.
//! - `mcrUpdate`'s warning-interrupt-disable branch wrote
//!   `self.registers.mcr.twrn_int`/`rwrn_int`, but those fields are declared
//!   on `FLEXCAN_x_ESR`, not `FLEXCAN_x_MCR`; this port clears them on
//!   `ESR` where they actually live.
//! - `normalTx`'s "not ready to transmit" debug log referenced an undefined
//!   `obj` local; this port logs the mailbox's own decoded message instead.

mod registers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fabric_core::{
    dispatch_event, AccessError, EventKey, EventMap, EventOutcome, InterruptQueue, MmioPeripheral,
    TimerRegister,
};
use fabric_ioadapter::IoAdapter;
use serde::{Deserialize, Serialize};

pub use registers::{
    CTRL_OFFSET, ECR_OFFSET, ESR_OFFSET, IFLAG1_OFFSET, IFLAG2_OFFSET, IMASK1_OFFSET,
    IMASK2_OFFSET, MB0_OFFSET, MB_END_OFFSET, MCR_OFFSET, MMIO_SIZE, RXGMASK_OFFSET,
    RX14MASK_OFFSET, RX15MASK_OFFSET, RXIMR0_OFFSET, TIMER_OFFSET,
};
use registers::{
    FlexcanRegisters, CTRL_CLK_SRC, CTRL_LOM, CTRL_LPB, CTRL_PRESDIV, CTRL_PROPSEG, CTRL_PSEG1,
    CTRL_PSEG2, CTRL_TSYN, ESR_RWRN_INT, ESR_TWRN_INT, MAX_MB, MCR_FEN, MCR_FRZ, MCR_FRZ_ACK,
    MCR_HALT, MCR_MBFEN, MCR_MDIS, MCR_MDISACK, MCR_NOT_RDY, MCR_SOFT_RST, MCR_SRX_DIS,
};

const FLEXCAN_ID_MASK: u32 = 0x1FFF_FFFF;
const FLEXCAN_STD_ID_SHIFT: u32 = 18;
const FLEXCAN_STD_ID_MASK: u32 = 0x1FFC_0000;

const CODE_RX_INACTIVE: u8 = 0x00;
const CODE_RX_FULL: u8 = 0x02;
const CODE_RX_OVERRUN: u8 = 0x03;
const CODE_RX_EMPTY: u8 = 0x04;
const CODE_TX_INACTIVE: u8 = 0x08;
const CODE_TX_RTR: u8 = 0x0A;
const CODE_TX_ACTIVE: u8 = 0x0C;
const CODE_TX_RTR_SENDING: u8 = 0x0E;

const RXFIFO_MAX_LEN: usize = 6;
const RXFIFO_MSG_AVAIL_CHAN: usize = 5;
const RXFIFO_WARNING_CHAN: usize = 6;
const RXFIFO_OVERFLOW_CHAN: usize = 7;

/// Clock sources feeding the bit-clock prescaler. FMPLL/SIU aren't modeled
/// by this fabric (out of scope per the original's "trivial register
/// plumbing" boundary), so the two candidate frequencies are supplied
/// directly, the same shape `fabric-swt::ClockConfig` uses.
#[derive(Debug, Clone, Copy)]
pub struct ClockConfig {
    pub external_hz: f64,
    pub peripheral_hz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlexcanMode {
    Disable,
    Freeze,
    Normal,
    ListenOnly,
    LoopBack,
}

/// A CAN message in flight, either decoded from a mailbox or arriving from
/// an external bus client. Serializable: this is the payload
/// `fabric-ioadapter` exchanges over its length-prefixed socket framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    pub rtr: bool,
    pub ide: bool,
    pub arbid: u32,
    pub length: u8,
    pub data: Vec<u8>,
    pub timestamp: Option<u16>,
}

impl CanFrame {
    fn from_mb_words(words: [u32; 4]) -> Self {
        let length_val = (words[0] >> 16) & 0xFF;
        let ide = length_val & 0x20 != 0;
        let rtr = length_val & 0x10 != 0;
        let length = (length_val & 0x0F) as u8;
        let id_raw = words[1] & FLEXCAN_ID_MASK;
        let arbid = if ide { id_raw } else { id_raw >> FLEXCAN_STD_ID_SHIFT };
        let bytes = [
            (words[2] >> 24) as u8,
            (words[2] >> 16) as u8,
            (words[2] >> 8) as u8,
            words[2] as u8,
            (words[3] >> 24) as u8,
            (words[3] >> 16) as u8,
            (words[3] >> 8) as u8,
            words[3] as u8,
        ];
        let timestamp = (words[0] & 0xFFFF) as u16;
        CanFrame {
            rtr,
            ide,
            arbid,
            length,
            data: bytes[..length as usize].to_vec(),
            timestamp: Some(timestamp),
        }
    }

    fn into_mb_words(&self, code: u8, timestamp: u16, prio: u8) -> [u32; 4] {
        let mut length_val = ((self.rtr as u32) << 4) | (self.length as u32 & 0x0F);
        if self.ide {
            length_val |= 0x60;
        }
        let id_val = if self.ide {
            ((prio as u32) << 29) | (self.arbid & FLEXCAN_ID_MASK)
        } else {
            ((prio as u32) << 29) | ((self.arbid & 0x7FF) << FLEXCAN_STD_ID_SHIFT)
        };
        let mut data8 = [0u8; 8];
        let n = self.data.len().min(8);
        data8[..n].copy_from_slice(&self.data[..n]);
        let w0 = ((code as u32) << 24) | ((length_val & 0xFF) << 16) | (timestamp as u32 & 0xFFFF);
        let w2 = u32::from_be_bytes([data8[0], data8[1], data8[2], data8[3]]);
        let w3 = u32::from_be_bytes([data8[4], data8[5], data8[6], data8[7]]);
        [w0, id_val, w2, w3]
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FilterEntry {
    mask: u32,
    filt: u32,
}

/// One bit-shift direction/amount, used to slide an RxFIFO filter's embedded
/// sub-ID into the same bit position an incoming arbitration ID is compared
/// at.
#[derive(Debug, Clone, Copy)]
enum ShiftOp {
    Left(u32),
    Right(u32),
}

impl ShiftOp {
    fn apply(self, v: u32) -> u32 {
        match self {
            ShiftOp::Left(n) => v << n,
            ShiftOp::Right(n) => v >> n,
        }
    }
}

/// One sub-filter carved out of an RxFIFO filter-table word under a given
/// IDAM mode: the std/ext ID mask+shift pair, plus (where the mode leaves
/// room for them) the bit masks locating an embedded RTR/IDE qualifier.
/// `rem_mask`/`ext_mask` are `None` when the mode packs IDs densely enough
/// that no bit is left over for RTR/IDE (the four-8-bit-ID mode), matching
/// the bit layout from `original_source/cm2350/peripherals/flexcan.py`'s
/// `FLEXCAN_RxFIFO_FILTER_{REM,EXT,ID}_MASKS` tables. That source's
/// `_SHIFTS` tables reuse the mask constants themselves as shift amounts for
/// REM/EXT (a copy-paste slip — shifting by `0x8000_0000` would collapse to
/// zero); this uses each mask's bit position (`trailing_zeros`) instead,
/// which is the only shift that actually extracts the flagged bit.
struct RxFifoFilterSpec {
    rem_mask: Option<u32>,
    ext_mask: Option<u32>,
    std_mask_bits: u32,
    std_shift: ShiftOp,
    ext_mask_bits: u32,
    ext_shift: ShiftOp,
}

/// Per-IDAM-mode sub-filter tables (`spec.md` §4.6's four filter formats).
/// Mode `0b11` (reject-all) is handled by the caller before ever consulting
/// this table.
fn rxfifo_filter_specs(idam: u32) -> &'static [RxFifoFilterSpec] {
    use ShiftOp::{Left as L, Right as R};
    const MODE_ONE_FULL: [RxFifoFilterSpec; 1] = [RxFifoFilterSpec {
        rem_mask: Some(0x8000_0000),
        ext_mask: Some(0x4000_0000),
        std_mask_bits: 0x3FF8_0000,
        std_shift: R(19),
        ext_mask_bits: 0x3FFF_FFFE,
        ext_shift: R(1),
    }];
    const MODE_TWO_14BIT: [RxFifoFilterSpec; 2] = [
        RxFifoFilterSpec {
            rem_mask: Some(0x8000_0000),
            ext_mask: Some(0x4000_0000),
            std_mask_bits: 0x3FF8_0000,
            std_shift: R(19),
            ext_mask_bits: 0x3FFF_0000,
            ext_shift: R(1),
        },
        RxFifoFilterSpec {
            rem_mask: Some(0x0000_8000),
            ext_mask: Some(0x0000_4000),
            std_mask_bits: 0x0000_3FF8,
            std_shift: R(3),
            ext_mask_bits: 0x0000_3FFF,
            ext_shift: L(15),
        },
    ];
    const MODE_FOUR_8BIT: [RxFifoFilterSpec; 4] = [
        RxFifoFilterSpec {
            rem_mask: None,
            ext_mask: None,
            std_mask_bits: 0xFF00_0000,
            std_shift: R(21),
            ext_mask_bits: 0xFF00_0000,
            ext_shift: R(3),
        },
        RxFifoFilterSpec {
            rem_mask: None,
            ext_mask: None,
            std_mask_bits: 0x00FF_0000,
            std_shift: R(13),
            ext_mask_bits: 0x00FF_0000,
            ext_shift: L(5),
        },
        RxFifoFilterSpec {
            rem_mask: None,
            ext_mask: None,
            std_mask_bits: 0x0000_FF00,
            std_shift: R(5),
            ext_mask_bits: 0x000F_F000,
            ext_shift: L(13),
        },
        RxFifoFilterSpec {
            rem_mask: None,
            ext_mask: None,
            std_mask_bits: 0x0000_00FF,
            std_shift: L(3),
            ext_mask_bits: 0x0000_00FF,
            ext_shift: L(21),
        },
    ];
    match idam {
        0b00 => &MODE_ONE_FULL,
        0b01 => &MODE_TWO_14BIT,
        0b10 => &MODE_FOUR_8BIT,
        _ => &[],
    }
}

#[derive(Default)]
struct RxFifoFilters {
    std: Vec<(u32, u32)>,
    ext: Vec<(u32, u32)>,
}

struct FlexcanState {
    mmio: MmioPeripheral<FlexcanRegisters>,
    timer: TimerRegister,
    mode: FlexcanMode,
    speed: Option<f64>,
    rx_fifo: Vec<Option<CanFrame>>,
    rx_fifo_filters_data: RxFifoFilters,
    rx_fifo_filters_rtr: RxFifoFilters,
    rx_filters_std: HashMap<usize, FilterEntry>,
    rx_filters_ext: HashMap<usize, FilterEntry>,
    rtr_filters_std: HashMap<usize, FilterEntry>,
    rtr_filters_ext: HashMap<usize, FilterEntry>,
}

impl FlexcanState {
    fn mb_words(&self, mb: usize) -> [u32; 4] {
        let base = mb * 4;
        [
            self.mmio.registers.mb[base],
            self.mmio.registers.mb[base + 1],
            self.mmio.registers.mb[base + 2],
            self.mmio.registers.mb[base + 3],
        ]
    }

    fn set_mb_words(&mut self, mb: usize, words: [u32; 4]) {
        let base = mb * 4;
        self.mmio.registers.mb[base] = words[0];
        self.mmio.registers.mb[base + 1] = words[1];
        self.mmio.registers.mb[base + 2] = words[2];
        self.mmio.registers.mb[base + 3] = words[3];
    }

    fn mb_code(&self, mb: usize) -> u8 {
        (self.mmio.registers.mb[mb * 4] >> 24) as u8 & 0x0F
    }

    fn set_mb_code(&mut self, mb: usize, code: u8) {
        let w = self.mmio.registers.mb[mb * 4];
        self.mmio.registers.mb[mb * 4] = (w & 0x00FF_FFFF) | ((code as u32) << 24);
    }

    fn set_mb_timestamp(&mut self, mb: usize, ts: u16) {
        let w = self.mmio.registers.mb[mb * 4];
        self.mmio.registers.mb[mb * 4] = (w & 0xFFFF_0000) | ts as u32;
    }

    fn mask_for_mb(&self, mb: usize) -> u32 {
        if self.mmio.registers.mcr_field(&MCR_MBFEN) {
            return self.mmio.registers.rximr[mb];
        }
        if !self.mmio.registers.mcr_field(&MCR_FEN) {
            match mb {
                14 => self.mmio.registers.rx14mask.raw(),
                15 => self.mmio.registers.rx15mask.raw(),
                _ => self.mmio.registers.rxgmask.raw(),
            }
        } else {
            match mb {
                6 | 14 => self.mmio.registers.rx14mask.raw(),
                7 | 15 => self.mmio.registers.rx15mask.raw(),
                _ => self.mmio.registers.rxgmask.raw(),
            }
        }
    }
}

/// The FlexCAN controller.
pub struct Flexcan {
    name: &'static str,
    state: Mutex<FlexcanState>,
    clocks: ClockConfig,
    event_map: Arc<EventMap>,
    intc: Arc<dyn InterruptQueue>,
    io: Option<Arc<IoAdapter<CanFrame>>>,
}

impl Flexcan {
    pub fn new(
        name: &'static str,
        base: u32,
        clocks: ClockConfig,
        event_map: Arc<EventMap>,
        intc: Arc<dyn InterruptQueue>,
    ) -> Self {
        Flexcan {
            name,
            state: Mutex::new(FlexcanState {
                mmio: MmioPeripheral::new(name, base, fabric_core::Endian::Big, FlexcanRegisters::default()),
                timer: TimerRegister::new(1.0, false, 1 << 16),
                mode: FlexcanMode::Disable,
                speed: None,
                rx_fifo: Vec::new(),
                rx_fifo_filters_data: RxFifoFilters::default(),
                rx_fifo_filters_rtr: RxFifoFilters::default(),
                rx_filters_std: HashMap::new(),
                rx_filters_ext: HashMap::new(),
                rtr_filters_std: HashMap::new(),
                rtr_filters_ext: HashMap::new(),
            }),
            clocks,
            event_map,
            intc,
            io: None,
        }
    }

    /// Attaches an external CAN-bus socket adapter. Without one, FlexCAN
    /// still fully supports loopback/self-reception; only frames destined
    /// for (or arriving from) an outside client require this.
    pub fn with_io(mut self, io: Arc<IoAdapter<CanFrame>>) -> Self {
        self.io = Some(io);
        self
    }

    pub fn mode(&self) -> FlexcanMode {
        self.state.lock().unwrap().mode
    }

    pub fn reset(&self, now: f64) {
        let mut s = self.state.lock().unwrap();
        s.rx_fifo.clear();
        reset_filters(&mut s);
        s.mmio.reset();
        s.mode = FlexcanMode::Disable;
        self.update_speed(&mut s, now);
    }

    pub fn read(&self, offset: u32, size: u8, pc: u32, now: f64) -> Result<Vec<u8>, AccessError> {
        let s = self.state.lock().unwrap();
        if offset == TIMER_OFFSET {
            return Ok(s.timer.value(now).to_be_bytes().to_vec());
        }
        s.mmio.read(offset, size, pc)
    }

    pub fn write(
        &self,
        offset: u32,
        size: u8,
        data: &[u8],
        pc: u32,
        now: f64,
    ) -> Result<(), AccessError> {
        let mut s = self.state.lock().unwrap();
        if offset == TIMER_OFFSET {
            let mut buf = [0u8; 4];
            let n = data.len().min(4);
            buf[4 - n..].copy_from_slice(&data[..n]);
            s.timer.set_value(now, u32::from_be_bytes(buf));
            return Ok(());
        }

        s.mmio.write(offset, size, data, pc)?;

        if offset == MCR_OFFSET {
            self.mcr_update(&mut s, now);
        } else if offset == CTRL_OFFSET {
            self.ctrl_update(&mut s, now);
        } else if offset == IFLAG1_OFFSET {
            self.iflag1_update(&mut s, now);
        } else if (MB0_OFFSET..MB_END_OFFSET).contains(&offset) && (offset - MB0_OFFSET) % 16 == 0
        {
            let mb = ((offset - MB0_OFFSET) / 16) as usize;
            self.mb_update(&mut s, mb, now);
        }

        Ok(())
    }

    /// Drains one externally-received frame (if any) into mailbox/RxFIFO
    /// processing. Called by the owning simulator's tick loop.
    pub fn pump_external_rx(&self, now: f64) {
        let Some(io) = self.io.clone() else { return };
        if let Some(frame) = io.try_recv() {
            let mut s = self.state.lock().unwrap();
            self.process_received_data(&mut s, frame, now);
        }
    }

    fn mcr_update(&self, s: &mut FlexcanState, now: f64) {
        let old_mode = s.mode;
        self.update_mode(s, now);

        if !s.mmio.registers.mcr_field(&registers::MCR_WRN_EN) {
            s.mmio.registers.esr.override_field(&ESR_TWRN_INT, 0);
            s.mmio.registers.esr.override_field(&ESR_RWRN_INT, 0);
        }

        if matches!(s.mode, FlexcanMode::Normal | FlexcanMode::LoopBack)
            && matches!(old_mode, FlexcanMode::Disable | FlexcanMode::Freeze)
        {
            for mb in 0..MAX_MB {
                let code = s.mb_code(mb);
                if code == CODE_TX_ACTIVE || code == CODE_TX_RTR_SENDING {
                    self.mb_update(s, mb, now);
                }
            }
        }
    }

    fn ctrl_update(&self, s: &mut FlexcanState, now: f64) {
        self.update_mode(s, now);
        self.update_speed(s, now);
    }

    fn iflag1_update(&self, s: &mut FlexcanState, now: f64) {
        if s.mmio.registers.mcr_field(&MCR_NOT_RDY) {
            return;
        }
        if s.mmio.registers.mcr_field(&MCR_FEN)
            && !s.rx_fifo.is_empty()
            && s.mmio.registers.iflag1.raw() & (1 << RXFIFO_MSG_AVAIL_CHAN) == 0
        {
            if s.rx_fifo.len() == 1 {
                s.rx_fifo.remove(0);
            } else if s.rx_fifo.len() > 1 {
                if let Some(msg) = s.rx_fifo.remove(1) {
                    self.normal_rx(s, 0, msg, now);
                }
            }
        }
    }

    fn mb_update(&self, s: &mut FlexcanState, mb: usize, now: f64) {
        match s.mb_code(mb) {
            CODE_TX_ACTIVE | CODE_TX_RTR_SENDING => self.normal_tx(s, mb, now),
            CODE_RX_EMPTY => self.filter_add_rx_mb(s, mb),
            CODE_TX_RTR => self.filter_add_rtr_mb(s, mb),
            _ => self.filter_remove_mb(s, mb),
        }
    }

    fn normal_rx(&self, s: &mut FlexcanState, mb: usize, msg: CanFrame, now: f64) {
        if s.mmio.registers.ctrl_field(&CTRL_TSYN) {
            let fen = s.mmio.registers.mcr_field(&MCR_FEN);
            if (fen && mb == 8) || (!fen && mb == 0) {
                s.timer.set_value(now, 0);
            }
        }

        if mb == 0 && s.mmio.registers.mcr_field(&MCR_FEN) {
            let ts = msg.timestamp.unwrap_or(0);
            let words = msg.into_mb_words(CODE_RX_INACTIVE, ts, 0);
            s.set_mb_words(mb, words);
            self.raise_msg_event(s, RXFIFO_MSG_AVAIL_CHAN);
        } else {
            let ts = s.timer.value(now) as u16;
            let words = msg.into_mb_words(CODE_RX_FULL, ts, 0);
            s.set_mb_words(mb, words);
            self.raise_msg_event(s, mb);
        }
    }

    fn normal_tx(&self, s: &mut FlexcanState, mb: usize, now: f64) {
        if s.mmio.registers.mcr_field(&MCR_NOT_RDY) {
            tracing::debug!(peripheral = self.name, mb, "not ready to transmit");
            return;
        }

        let msg = CanFrame::from_mb_words(s.mb_words(mb));
        match s.mb_code(mb) {
            CODE_TX_ACTIVE => {
                if msg.rtr {
                    s.set_mb_code(mb, CODE_RX_EMPTY);
                    self.filter_add_rx_mb(s, mb);
                } else {
                    s.set_mb_code(mb, CODE_TX_INACTIVE);
                    self.filter_remove_mb(s, mb);
                }
            }
            CODE_TX_RTR_SENDING => {
                s.set_mb_code(mb, CODE_TX_RTR);
                self.filter_add_rtr_mb(s, mb);
            }
            other => {
                tracing::warn!(peripheral = self.name, mb, code = other, "unexpected CODE for mailbox transmit");
                return;
            }
        }

        if s.mode == FlexcanMode::Normal {
            let ts = s.timer.value(now) as u16;
            s.set_mb_timestamp(mb, ts);
            if let Some(io) = &self.io {
                io.transmit(msg.clone());
            }
            self.raise_msg_event(s, mb);
        }

        if matches!(s.mode, FlexcanMode::Normal | FlexcanMode::LoopBack)
            && !s.mmio.registers.mcr_field(&MCR_SRX_DIS)
        {
            self.process_received_data(s, msg, now);
        }
    }

    fn process_received_data(&self, s: &mut FlexcanState, msg: CanFrame, now: f64) {
        if s.mmio.registers.mcr_field(&MCR_NOT_RDY) {
            tracing::debug!(peripheral = self.name, ?msg, "not ready to receive");
            return;
        }

        enum LastMatch {
            None,
            RxFifo,
            Mailbox(usize),
        }
        let mut last_match = LastMatch::None;

        if s.mmio.registers.mcr_field(&MCR_FEN) {
            let table = if msg.rtr { &s.rx_fifo_filters_rtr } else { &s.rx_fifo_filters_data };
            let list = if msg.ide { &table.ext } else { &table.std };
            let mut matched = false;
            for &(mask, filt) in list {
                if msg.arbid & mask == filt {
                    matched = true;
                    break;
                }
            }
            if matched {
                if self.rx_fifo_recv(s, msg.clone(), now) {
                    return;
                }
                last_match = LastMatch::RxFifo;
            }
        }

        if msg.rtr {
            let map = if msg.ide { &s.rtr_filters_ext } else { &s.rtr_filters_std };
            let hit = map
                .iter()
                .find(|(_, e)| msg.arbid & e.mask == e.filt)
                .map(|(&mb, _)| mb);
            if let Some(mb) = hit {
                self.normal_tx(s, mb, now);
                return;
            }
        }

        {
            let map = if msg.ide { &s.rx_filters_ext } else { &s.rx_filters_std };
            let hits: Vec<usize> = map
                .iter()
                .filter(|(_, e)| msg.arbid & e.mask == e.filt)
                .map(|(&mb, _)| mb)
                .collect();
            for mb in hits {
                if s.mb_code(mb) == CODE_RX_EMPTY {
                    self.normal_rx(s, mb, msg, now);
                    return;
                }
                last_match = LastMatch::Mailbox(mb);
            }
        }

        match last_match {
            LastMatch::RxFifo => self.raise_msg_event(s, RXFIFO_OVERFLOW_CHAN),
            LastMatch::Mailbox(mb) => s.set_mb_code(mb, CODE_RX_OVERRUN),
            LastMatch::None => {
                tracing::debug!(peripheral = self.name, ?msg, "discarding received msg, no mailbox match");
            }
        }
    }

    fn rx_fifo_recv(&self, s: &mut FlexcanState, mut msg: CanFrame, now: f64) -> bool {
        msg.timestamp = Some(s.timer.value(now) as u16);
        if s.rx_fifo.is_empty() {
            self.normal_rx(s, 0, msg, now);
            s.rx_fifo.push(None);
            true
        } else if s.rx_fifo.len() < RXFIFO_MAX_LEN {
            s.rx_fifo.push(Some(msg));
            if s.rx_fifo.len() == RXFIFO_MAX_LEN {
                self.raise_msg_event(s, RXFIFO_WARNING_CHAN);
            }
            true
        } else {
            false
        }
    }

    fn raise_msg_event(&self, s: &mut FlexcanState, mb: usize) {
        let bit = 1u32 << (mb % 32);
        let (imask, iflag) = if mb < 32 {
            (s.mmio.registers.imask1.raw(), s.mmio.registers.iflag1.raw())
        } else {
            (s.mmio.registers.imask2.raw(), s.mmio.registers.iflag2.raw())
        };
        let mask_enabled = imask & bit != 0;
        let rising = iflag & bit == 0;
        if mb < 32 {
            s.mmio.registers.iflag1.override_raw(iflag | bit);
        } else {
            s.mmio.registers.iflag2.override_raw(iflag | bit);
        }

        let target = self.event_map.resolve(&EventKey::channel(self.name, "msg", mb as u16));
        let outcome = dispatch_event(rising, mask_enabled, false, target);
        if let EventOutcome::Interrupt(source) = outcome {
            self.intc.queue_external(source);
        }
    }

    fn update_mode(&self, s: &mut FlexcanState, now: f64) {
        if s.mmio.registers.mcr_field(&MCR_SOFT_RST) {
            self.soft_reset(s, now);
            s.mmio.registers.mcr.override_field(&MCR_SOFT_RST, 0);
        }

        let mode;
        if s.mmio.registers.mcr_field(&MCR_MDIS) {
            mode = FlexcanMode::Disable;
            s.mmio.registers.mcr.override_field(&MCR_MDISACK, 1);
            s.mmio.registers.mcr.override_field(&MCR_NOT_RDY, 1);
            s.mmio.registers.mcr.override_field(&MCR_FRZ_ACK, 0);
            s.timer.stop(now);
        } else if s.mmio.registers.mcr_field(&MCR_HALT) && s.mmio.registers.mcr_field(&MCR_FRZ) {
            mode = FlexcanMode::Freeze;
            s.mmio.registers.mcr.override_field(&MCR_MDISACK, 0);
            s.mmio.registers.mcr.override_field(&MCR_NOT_RDY, 1);
            s.mmio.registers.mcr.override_field(&MCR_FRZ_ACK, 1);
            s.timer.stop(now);
        } else {
            s.mmio.registers.mcr.override_field(&MCR_MDISACK, 0);
            s.mmio.registers.mcr.override_field(&MCR_NOT_RDY, 0);
            s.mmio.registers.mcr.override_field(&MCR_FRZ_ACK, 0);

            mode = if s.mmio.registers.ctrl_field(&CTRL_LOM) {
                FlexcanMode::ListenOnly
            } else if s.mmio.registers.ctrl_field(&CTRL_LPB) {
                FlexcanMode::LoopBack
            } else {
                FlexcanMode::Normal
            };

            if matches!(s.mode, FlexcanMode::Disable | FlexcanMode::Freeze) {
                self.filter_update(s);
                s.timer.start(now);
            }
        }

        if s.mode != mode {
            tracing::debug!(peripheral = self.name, ?mode, "changing mode");
            s.mode = mode;
        }
    }

    fn update_speed(&self, s: &mut FlexcanState, now: f64) {
        if matches!(s.mode, FlexcanMode::Disable | FlexcanMode::Freeze) {
            s.speed = None;
            return;
        }

        let presdiv = s.mmio.registers.ctrl.get_field(&CTRL_PRESDIV) as f64 + 1.0;
        let sclk = if s.mmio.registers.ctrl_field(&CTRL_CLK_SRC) {
            self.clocks.peripheral_hz / presdiv
        } else {
            self.clocks.external_hz / presdiv
        };

        let tq_per_bit = s.mmio.registers.ctrl.get_field(&CTRL_PROPSEG) as f64
            + s.mmio.registers.ctrl.get_field(&CTRL_PSEG1) as f64
            + s.mmio.registers.ctrl.get_field(&CTRL_PSEG2) as f64
            + 4.0;

        let speed = sclk / tq_per_bit;
        s.speed = Some(speed);
        s.timer.set_frequency(now, speed);
    }

    fn soft_reset(&self, s: &mut FlexcanState, now: f64) {
        let mdis = s.mmio.registers.mcr_field(&MCR_MDIS) as u32;
        s.mmio.registers.mcr.reset();
        s.mmio.registers.ecr.reset();
        s.mmio.registers.esr.reset();
        s.mmio.registers.imask1.reset();
        s.mmio.registers.imask2.reset();
        s.mmio.registers.iflag1.reset();
        s.mmio.registers.iflag2.reset();
        s.rx_fifo.clear();
        reset_filters(s);
        s.mmio.registers.mcr.override_field(&MCR_MDIS, mdis);
        self.update_mode(s, now);
        self.update_speed(s, now);
    }

    fn filter_add_rx_mb(&self, s: &mut FlexcanState, mb: usize) {
        s.rtr_filters_std.remove(&mb);
        s.rtr_filters_ext.remove(&mb);

        let mask_val = s.mask_for_mb(mb);
        let ext_mask = mask_val & FLEXCAN_ID_MASK;
        let id_word = s.mmio.registers.mb[mb * 4 + 1];
        let ext_filt = id_word & FLEXCAN_ID_MASK & ext_mask;
        s.rx_filters_ext.insert(mb, FilterEntry { mask: ext_mask, filt: ext_filt });

        if ext_filt & FLEXCAN_STD_ID_MASK == 0 {
            let std_mask = ext_mask >> FLEXCAN_STD_ID_SHIFT;
            let std_filt = ext_filt >> FLEXCAN_STD_ID_SHIFT;
            s.rx_filters_std.insert(mb, FilterEntry { mask: std_mask, filt: std_filt });
        }
    }

    fn filter_add_rtr_mb(&self, s: &mut FlexcanState, mb: usize) {
        s.rx_filters_std.remove(&mb);
        s.rx_filters_ext.remove(&mb);

        let mask_val = s.mask_for_mb(mb);
        let ext_mask = mask_val & FLEXCAN_ID_MASK;
        let id_word = s.mmio.registers.mb[mb * 4 + 1];
        let ext_filt = id_word & FLEXCAN_ID_MASK & ext_mask;
        s.rtr_filters_ext.insert(mb, FilterEntry { mask: ext_mask, filt: ext_filt });

        if ext_filt & FLEXCAN_STD_ID_MASK == 0 {
            let std_mask = ext_mask >> FLEXCAN_STD_ID_SHIFT;
            let std_filt = ext_filt >> FLEXCAN_STD_ID_SHIFT;
            s.rtr_filters_std.insert(mb, FilterEntry { mask: std_mask, filt: std_filt });
        }
    }

    fn filter_remove_mb(&self, s: &mut FlexcanState, mb: usize) {
        s.rx_filters_std.remove(&mb);
        s.rx_filters_ext.remove(&mb);
        s.rtr_filters_std.remove(&mb);
        s.rtr_filters_ext.remove(&mb);
    }

    /// Rebuilds all receive filter caches from the current mailbox CODE
    /// values and mask registers. All four IDAM modes (one 29-bit ID, two
    /// 14-bit IDs, four 8-bit IDs, or reject-all per filter word) are
    /// decomposed against the RxFIFO filter table.
    fn filter_update(&self, s: &mut FlexcanState) {
        reset_filters(s);

        let start_mb = if s.mmio.registers.mcr_field(&MCR_FEN) {
            self.rebuild_rx_fifo_filters(s);
            8
        } else {
            0
        };

        for mb in start_mb..MAX_MB {
            match s.mb_code(mb) {
                CODE_RX_EMPTY | CODE_RX_FULL | CODE_RX_OVERRUN => self.filter_add_rx_mb(s, mb),
                CODE_TX_RTR => self.filter_add_rtr_mb(s, mb),
                _ => {}
            }
        }
    }

    fn rebuild_rx_fifo_filters(&self, s: &mut FlexcanState) {
        let idam = s.mmio.registers.mcr.get_field(&registers::MCR_IDAM);
        if idam == 0b11 {
            // Reject-all: leave both filter tables empty.
            return;
        }

        // The 8 32-bit words spanning MB6-MB7 each hold one or more filters,
        // packed per the IDAM mode. Every `RxFifoFilterSpec` for this mode
        // carves one ID (std+ext shift/mask pair) plus, where the mode
        // leaves room for them, an embedded RTR bit and IDE bit out of the
        // filter word.
        let filters: [u32; 8] = std::array::from_fn(|i| s.mmio.registers.mb[6 * 4 + i]);
        for (i, &filt_val) in filters.iter().enumerate() {
            let mask_val = s.mask_for_mb(i);
            for spec in rxfifo_filter_specs(idam) {
                let rtr = spec
                    .rem_mask
                    .filter(|&m| m & mask_val != 0)
                    .map(|m| (filt_val & m) >> m.trailing_zeros() != 0);
                let ide = spec
                    .ext_mask
                    .filter(|&m| m & mask_val != 0)
                    .map(|m| (filt_val & m) >> m.trailing_zeros() != 0);

                let want_std = ide != Some(true);
                let want_ext = ide != Some(false);
                let want_data = rtr != Some(true);
                let want_rtr = rtr != Some(false);

                if want_std {
                    let mask = spec.std_shift.apply(mask_val & spec.std_mask_bits);
                    let filt = spec.std_shift.apply(filt_val & spec.std_mask_bits);
                    if want_data {
                        s.rx_fifo_filters_data.std.push((mask, filt));
                    }
                    if want_rtr {
                        s.rx_fifo_filters_rtr.std.push((mask, filt));
                    }
                }
                if want_ext {
                    let mask = spec.ext_shift.apply(mask_val & spec.ext_mask_bits);
                    let filt = spec.ext_shift.apply(filt_val & spec.ext_mask_bits);
                    if want_data {
                        s.rx_fifo_filters_data.ext.push((mask, filt));
                    }
                    if want_rtr {
                        s.rx_fifo_filters_rtr.ext.push((mask, filt));
                    }
                }
            }
        }
    }
}

fn reset_filters(s: &mut FlexcanState) {
    s.rx_fifo_filters_data.std.clear();
    s.rx_fifo_filters_data.ext.clear();
    s.rx_fifo_filters_rtr.std.clear();
    s.rx_fifo_filters_rtr.ext.clear();
    s.rx_filters_std.clear();
    s.rx_filters_ext.clear();
    s.rtr_filters_std.clear();
    s.rtr_filters_ext.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::{EventMapBuilder, InterruptSource};

    struct NullIntc;
    impl InterruptQueue for NullIntc {
        fn queue_external(&self, _source: InterruptSource) {}
    }

    fn flexcan() -> Flexcan {
        let event_map = Arc::new(EventMapBuilder::default().build());
        let clocks = ClockConfig { external_hz: 40_000_000.0, peripheral_hz: 80_000_000.0 };
        let can = Flexcan::new("FlexCAN_A", 0xFFFC_0000, clocks, event_map, Arc::new(NullIntc));
        can.reset(0.0);
        can
    }

    fn write_reg(can: &Flexcan, offset: u32, value: u32, now: f64) {
        can.write(offset, 4, &value.to_be_bytes(), 0, now).unwrap();
    }

    fn read_reg(can: &Flexcan, offset: u32, now: f64) -> u32 {
        u32::from_be_bytes(can.read(offset, 4, 0, now).unwrap().try_into().unwrap())
    }

    fn enable_normal_mode(can: &Flexcan, now: f64) {
        // Clear MDIS and HALT so MCR leaves DISABLE/FREEZE; CTRL defaults to
        // neither LOM nor LPB, so normal mode is selected.
        let mcr = read_reg(can, MCR_OFFSET, now);
        write_reg(can, MCR_OFFSET, mcr & !((1 << 31) | (1 << 28)), now);
    }

    #[test]
    fn reset_starts_in_disable_mode() {
        let can = flexcan();
        assert_eq!(can.mode(), FlexcanMode::Disable);
    }

    #[test]
    fn enabling_transitions_to_normal_mode() {
        let can = flexcan();
        enable_normal_mode(&can, 0.0);
        assert_eq!(can.mode(), FlexcanMode::Normal);
    }

    #[test]
    fn loopback_self_reception_delivers_to_matching_mailbox() {
        let can = flexcan();
        enable_normal_mode(&can, 0.0);

        // Put CTRL[LPB] on (loopback) instead of plain normal mode.
        let ctrl = read_reg(&can, CTRL_OFFSET, 0.0);
        write_reg(&can, CTRL_OFFSET, ctrl | (1 << 19), 0.0);
        assert_eq!(can.mode(), FlexcanMode::LoopBack);

        // Configure mailbox 1 as an empty Rx mailbox filtering on std ID 0x123.
        let mb1_id_offset = MB0_OFFSET + 1 * 16 + 4;
        write_reg(&can, mb1_id_offset, 0x123u32 << 18, 0.0);
        write_reg(&can, MB0_OFFSET + 1 * 16, (CODE_RX_EMPTY as u32) << 24, 0.0);

        // Configure mailbox 0 as a Tx mailbox carrying the same ID, 2 data bytes.
        let mb0_id_offset = MB0_OFFSET + 4;
        write_reg(&can, mb0_id_offset, 0x123u32 << 18, 0.0);
        write_reg(&can, MB0_OFFSET + 8, u32::from_be_bytes([0xAA, 0xBB, 0, 0]), 0.0);
        let code_len_word = ((CODE_TX_ACTIVE as u32) << 24) | (2u32 << 16);
        write_reg(&can, MB0_OFFSET, code_len_word, 0.0);

        let s = can.state.lock().unwrap();
        assert_eq!(s.mb_code(1), CODE_RX_FULL);
        let received = CanFrame::from_mb_words(s.mb_words(1));
        assert_eq!(received.arbid, 0x123);
        assert_eq!(received.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn rx_fifo_places_first_message_directly_in_mb0() {
        let mut can = flexcan();
        enable_normal_mode(&can, 0.0);
        write_reg(&can, MCR_OFFSET, read_reg(&can, MCR_OFFSET, 0.0) | (1 << 2), 0.0); // FEN

        let frame = CanFrame {
            rtr: false,
            ide: false,
            arbid: 0x42,
            length: 1,
            data: vec![0xFF],
            timestamp: None,
        };
        {
            let mut s = can.state.lock().unwrap();
            can_process(&mut can, &mut s, frame.clone());
        }

        let s = can.state.lock().unwrap();
        assert_eq!(s.rx_fifo.len(), 1);
        assert!(s.rx_fifo[0].is_none());
    }

    // Calling process_received_data directly (private) via a thin shim kept
    // local to tests, since rx_fifo_recv's effects are otherwise only
    // observable through the external-IO path.
    fn can_process(can: &mut Flexcan, s: &mut FlexcanState, frame: CanFrame) {
        can.process_received_data(s, frame, 0.0);
    }
}
