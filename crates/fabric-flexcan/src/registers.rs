//! FlexCAN register file. Offsets and field layout from
//! `original_source/cm2350/peripherals/flexcan.py`'s `FLEXCAN_x_MCR` /
//! `FLEXCAN_x_CTRL` / `FLEXCAN_x_ECR` / `FLEXCAN_x_ESR` and
//! `FLEXCAN_REGISTERS`.
//!
//! The TIMER register (offset 0x0008) has no backing storage here — like
//! SWT's `SWT_CO` it's computed live from a [`fabric_core::TimerRegister`]
//! and special-cased in `lib.rs`. The 64 mailboxes and 64 RXIMR mask words
//! are modeled as flat `Vec<u32>` word arrays rather than individual
//! `Register`s (the original manages them as a raw byte array too, for the
//! same reason: reusing one layout for both normal-mailbox and RxFIFO
//! modes). `describe()` exposes each as an ordinary 32-bit read/write
//! register so the generic MMIO base's alignment/segmented-access handling
//! applies uniformly; this means mailbox writes are only recognized as
//! "CODE byte written" at 4-byte (word) granularity instead of the real
//! part's byte granularity, since `RegisterSet` describes whole registers,
//! not sub-register bytes. See `DESIGN.md`.

use fabric_core::{AccessClass, Field, Register, RegisterDescriptor, RegisterSet, Width};

pub const MCR_OFFSET: u32 = 0x0000;
pub const CTRL_OFFSET: u32 = 0x0004;
pub const TIMER_OFFSET: u32 = 0x0008;
pub const RXGMASK_OFFSET: u32 = 0x0010;
pub const RX14MASK_OFFSET: u32 = 0x0014;
pub const RX15MASK_OFFSET: u32 = 0x0018;
pub const ECR_OFFSET: u32 = 0x001C;
pub const ESR_OFFSET: u32 = 0x0020;
pub const IMASK2_OFFSET: u32 = 0x0024;
pub const IMASK1_OFFSET: u32 = 0x0028;
pub const IFLAG2_OFFSET: u32 = 0x002C;
pub const IFLAG1_OFFSET: u32 = 0x0030;

pub const MB0_OFFSET: u32 = 0x0080;
pub const MB_END_OFFSET: u32 = 0x0480;
pub const RXIMR0_OFFSET: u32 = 0x0880;
pub const RXIMR_END_OFFSET: u32 = 0x0980;

pub const MMIO_SIZE: u32 = 0x4000;

pub const MAX_MB: usize = 64;
/// Each mailbox is 4 32-bit words (16 bytes).
pub const MBX_WORDS: usize = 4;
pub const RXIMR_WORDS: usize = MAX_MB;

// MCR fields, MSB-0 numbering, declaration order from the original mirrors
// bit order (`mdis` is bit 0, `maxmb` is the low 6 bits).
pub const MCR_MDIS: Field = Field::msb0("mdis", 32, 0, 1);
pub const MCR_FRZ: Field = Field::msb0("frz", 32, 1, 1);
pub const MCR_FEN: Field = Field::msb0("fen", 32, 2, 1);
pub const MCR_HALT: Field = Field::msb0("halt", 32, 3, 1);
pub const MCR_NOT_RDY: Field = Field::msb0("not_rdy", 32, 4, 1);
pub const MCR_SOFT_RST: Field = Field::msb0("soft_rst", 32, 6, 1);
pub const MCR_FRZ_ACK: Field = Field::msb0("frz_ack", 32, 7, 1);
pub const MCR_SUPV: Field = Field::msb0("supv", 32, 8, 1);
pub const MCR_WRN_EN: Field = Field::msb0("wrn_en", 32, 10, 1);
pub const MCR_MDISACK: Field = Field::msb0("mdisack", 32, 11, 1);
pub const MCR_DOZE: Field = Field::msb0("doze", 32, 13, 1);
pub const MCR_SRX_DIS: Field = Field::msb0("srx_dis", 32, 14, 1);
pub const MCR_MBFEN: Field = Field::msb0("mbfen", 32, 15, 1);
pub const MCR_LPRIO_EN: Field = Field::msb0("lprio_en", 32, 18, 1);
pub const MCR_AEN: Field = Field::msb0("aen", 32, 19, 1);
pub const MCR_IDAM: Field = Field::msb0("idam", 32, 22, 2);
pub const MCR_MAXMB: Field = Field::msb0("maxmb", 32, 26, 6);

/// FRZ=1, HALT=1, NOT_RDY=1, FRZ_ACK=1, SUPV=1, MDISACK=1, MAXMB=0b001111.
pub const MCR_RESET: u32 = 0x5990_000F;

pub const CTRL_PRESDIV: Field = Field::msb0("presdiv", 32, 0, 8);
pub const CTRL_RJW: Field = Field::msb0("rjw", 32, 8, 2);
pub const CTRL_PSEG1: Field = Field::msb0("pseg1", 32, 10, 3);
pub const CTRL_PSEG2: Field = Field::msb0("pseg2", 32, 13, 3);
pub const CTRL_BOFF_MSK: Field = Field::msb0("boff_msk", 32, 16, 1);
pub const CTRL_ERR_MSK: Field = Field::msb0("err_msk", 32, 17, 1);
pub const CTRL_CLK_SRC: Field = Field::msb0("clk_src", 32, 18, 1);
pub const CTRL_LPB: Field = Field::msb0("lpb", 32, 19, 1);
pub const CTRL_TWRN_MSK: Field = Field::msb0("twrn_msk", 32, 20, 1);
pub const CTRL_RWRN_MSK: Field = Field::msb0("rwrn_msk", 32, 21, 1);
pub const CTRL_SMP: Field = Field::msb0("smp", 32, 24, 1);
pub const CTRL_BOFF_REC: Field = Field::msb0("boff_rec", 32, 25, 1);
pub const CTRL_TSYN: Field = Field::msb0("tsyn", 32, 26, 1);
pub const CTRL_LBUF: Field = Field::msb0("lbuf", 32, 27, 1);
pub const CTRL_LOM: Field = Field::msb0("lom", 32, 28, 1);
pub const CTRL_PROPSEG: Field = Field::msb0("propseg", 32, 29, 3);

pub const ECR_RX_ERR: Field = Field::msb0("rx_err", 32, 16, 8);
pub const ECR_TX_ERR: Field = Field::msb0("tx_err", 32, 24, 8);

// ESR: only the bits this emulation actually sets/clears are named. Bus-off
// and error-counter status bits are read-only placeholders that always read
// zero, per the class doc's "Bus Off/On errors ... are not emulated" carve-out.
pub const ESR_TWRN_INT: Field = Field::write_one_to_clear("twrn_int", 16, 1);
pub const ESR_RWRN_INT: Field = Field::write_one_to_clear("rwrn_int", 15, 1);
pub const ESR_BOFF_INT: Field = Field::write_one_to_clear("boff_int", 2, 1);
pub const ESR_ERR_INT: Field = Field::write_one_to_clear("err_int", 1, 1);

pub struct FlexcanRegisters {
    pub mcr: Register,
    pub ctrl: Register,
    pub rxgmask: Register,
    pub rx14mask: Register,
    pub rx15mask: Register,
    pub ecr: Register,
    pub esr: Register,
    pub imask2: Register,
    pub imask1: Register,
    pub iflag2: Register,
    pub iflag1: Register,
    /// `MAX_MB * MBX_WORDS` flat words; mailbox `m`'s word `w` lives at
    /// `mb[m * MBX_WORDS + w]`. Word 0 of each mailbox holds CODE in its
    /// high byte (big-endian layout), matching `CanMsg`'s `'>BBHI8s'` pack
    /// format.
    pub mb: Vec<u32>,
    pub rximr: Vec<u32>,
}

impl Default for FlexcanRegisters {
    fn default() -> Self {
        FlexcanRegisters {
            mcr: Register::new(Width::W32, AccessClass::ReadWrite, MCR_RESET).with_fields(&[
                MCR_MDIS, MCR_FRZ, MCR_FEN, MCR_HALT, MCR_NOT_RDY, MCR_SOFT_RST, MCR_FRZ_ACK,
                MCR_SUPV, MCR_WRN_EN, MCR_MDISACK, MCR_DOZE, MCR_SRX_DIS, MCR_MBFEN,
                MCR_LPRIO_EN, MCR_AEN, MCR_IDAM, MCR_MAXMB,
            ]),
            ctrl: Register::new(Width::W32, AccessClass::ReadWrite, 0).with_fields(&[
                CTRL_PRESDIV, CTRL_RJW, CTRL_PSEG1, CTRL_PSEG2, CTRL_BOFF_MSK, CTRL_ERR_MSK,
                CTRL_CLK_SRC, CTRL_LPB, CTRL_TWRN_MSK, CTRL_RWRN_MSK, CTRL_SMP, CTRL_BOFF_REC,
                CTRL_TSYN, CTRL_LBUF, CTRL_LOM, CTRL_PROPSEG,
            ]),
            rxgmask: Register::new(Width::W32, AccessClass::ReadWrite, 0xFFFF_FFFF),
            rx14mask: Register::new(Width::W32, AccessClass::ReadWrite, 0xFFFF_FFFF),
            rx15mask: Register::new(Width::W32, AccessClass::ReadWrite, 0xFFFF_FFFF),
            ecr: Register::new(Width::W32, AccessClass::ReadWrite, 0)
                .with_fields(&[ECR_RX_ERR, ECR_TX_ERR]),
            esr: Register::new(Width::W32, AccessClass::ReadWrite, 0).with_fields(&[
                ESR_TWRN_INT,
                ESR_RWRN_INT,
                ESR_BOFF_INT,
                ESR_ERR_INT,
            ]),
            imask2: Register::new(Width::W32, AccessClass::ReadWrite, 0),
            imask1: Register::new(Width::W32, AccessClass::ReadWrite, 0),
            iflag2: Register::new(Width::W32, AccessClass::WriteOneToClear, 0),
            iflag1: Register::new(Width::W32, AccessClass::WriteOneToClear, 0),
            mb: vec![0u32; MAX_MB * MBX_WORDS],
            rximr: vec![0u32; RXIMR_WORDS],
        }
    }
}

impl FlexcanRegisters {
    pub fn mcr_field(&self, f: &Field) -> bool {
        self.mcr.get_field(f) != 0
    }

    pub fn ctrl_field(&self, f: &Field) -> bool {
        self.ctrl.get_field(f) != 0
    }

    fn mb_word_index(offset: u32) -> Option<usize> {
        if offset >= MB0_OFFSET && offset < MB_END_OFFSET {
            Some(((offset - MB0_OFFSET) / 4) as usize)
        } else {
            None
        }
    }

    fn rximr_word_index(offset: u32) -> Option<usize> {
        if offset >= RXIMR0_OFFSET && offset < RXIMR_END_OFFSET {
            Some(((offset - RXIMR0_OFFSET) / 4) as usize)
        } else {
            None
        }
    }
}

impl RegisterSet for FlexcanRegisters {
    fn size(&self) -> u32 {
        MMIO_SIZE
    }

    fn describe(&self, offset: u32) -> Option<RegisterDescriptor> {
        let width = Width::W32;
        if let Some(idx) = Self::mb_word_index(offset) {
            let _ = idx;
            return Some(RegisterDescriptor {
                base_offset: offset & !0x3,
                width,
                access: AccessClass::ReadWrite,
            });
        }
        if let Some(idx) = Self::rximr_word_index(offset) {
            let _ = idx;
            return Some(RegisterDescriptor {
                base_offset: offset & !0x3,
                width,
                access: AccessClass::ReadWrite,
            });
        }
        match offset {
            MCR_OFFSET => Some(RegisterDescriptor {
                base_offset: MCR_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            CTRL_OFFSET => Some(RegisterDescriptor {
                base_offset: CTRL_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            RXGMASK_OFFSET => Some(RegisterDescriptor {
                base_offset: RXGMASK_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            RX14MASK_OFFSET => Some(RegisterDescriptor {
                base_offset: RX14MASK_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            RX15MASK_OFFSET => Some(RegisterDescriptor {
                base_offset: RX15MASK_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            ECR_OFFSET => Some(RegisterDescriptor {
                base_offset: ECR_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            ESR_OFFSET => Some(RegisterDescriptor {
                base_offset: ESR_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            IMASK2_OFFSET => Some(RegisterDescriptor {
                base_offset: IMASK2_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            IMASK1_OFFSET => Some(RegisterDescriptor {
                base_offset: IMASK1_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            IFLAG2_OFFSET => Some(RegisterDescriptor {
                base_offset: IFLAG2_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            IFLAG1_OFFSET => Some(RegisterDescriptor {
                base_offset: IFLAG1_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            _ => None,
        }
    }

    fn read_raw(&self, base_offset: u32) -> u32 {
        if let Some(idx) = Self::mb_word_index(base_offset) {
            return self.mb[idx];
        }
        if let Some(idx) = Self::rximr_word_index(base_offset) {
            return self.rximr[idx];
        }
        match base_offset {
            MCR_OFFSET => self.mcr.raw(),
            CTRL_OFFSET => self.ctrl.raw(),
            RXGMASK_OFFSET => self.rxgmask.raw(),
            RX14MASK_OFFSET => self.rx14mask.raw(),
            RX15MASK_OFFSET => self.rx15mask.raw(),
            ECR_OFFSET => self.ecr.raw(),
            ESR_OFFSET => self.esr.raw(),
            IMASK2_OFFSET => self.imask2.raw(),
            IMASK1_OFFSET => self.imask1.raw(),
            IFLAG2_OFFSET => self.iflag2.raw(),
            IFLAG1_OFFSET => self.iflag1.raw(),
            _ => 0,
        }
    }

    fn write_raw(&mut self, base_offset: u32, value: u32) {
        if let Some(idx) = Self::mb_word_index(base_offset) {
            self.mb[idx] = value;
            return;
        }
        if let Some(idx) = Self::rximr_word_index(base_offset) {
            self.rximr[idx] = value;
            return;
        }
        match base_offset {
            MCR_OFFSET => self.mcr.write_raw(value),
            CTRL_OFFSET => self.ctrl.write_raw(value),
            RXGMASK_OFFSET => self.rxgmask.write_raw(value),
            RX14MASK_OFFSET => self.rx14mask.write_raw(value),
            RX15MASK_OFFSET => self.rx15mask.write_raw(value),
            ECR_OFFSET => self.ecr.write_raw(value),
            ESR_OFFSET => self.esr.write_raw(value),
            IMASK2_OFFSET => self.imask2.write_raw(value),
            IMASK1_OFFSET => self.imask1.write_raw(value),
            IFLAG2_OFFSET => self.iflag2.write_raw(value),
            IFLAG1_OFFSET => self.iflag1.write_raw(value),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.mcr.reset();
        self.ctrl.reset();
        self.rxgmask.reset();
        self.rx14mask.reset();
        self.rx15mask.reset();
        self.ecr.reset();
        self.esr.reset();
        self.imask2.reset();
        self.imask1.reset();
        self.iflag2.reset();
        self.iflag1.reset();
        self.mb.iter_mut().for_each(|w| *w = 0);
        self.rximr.iter_mut().for_each(|w| *w = 0);
    }

    fn on_write(&mut self, _base_offset: u32, _size: u8) {}
}
