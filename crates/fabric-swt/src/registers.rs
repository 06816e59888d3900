//! SWT register file. Offsets and field layout from
//! `original_source/cm2350/peripherals/swt.py`.
//!
//! `SWT_CO` (the live tick counter) has no backing storage at all in the
//! original — it's computed on read from the watchdog timer — and is
//! special-cased in `lib.rs` rather than modeled here.

use fabric_core::{AccessClass, Field, Register, RegisterDescriptor, RegisterSet, Width};

pub const MCR_OFFSET: u32 = 0x0000;
pub const IR_OFFSET: u32 = 0x0004;
pub const TO_OFFSET: u32 = 0x0008;
pub const WN_OFFSET: u32 = 0x000C;
pub const SR_OFFSET: u32 = 0x0010;
pub const CO_OFFSET: u32 = 0x0014;
pub const SK_OFFSET: u32 = 0x0018;
pub const MMIO_SIZE: u32 = 0x4000;

pub const MCR_MAP: Field = Field::msb0("map", 32, 0, 8);
pub const MCR_KEY: Field = Field::msb0("key", 32, 22, 1);
pub const MCR_RIA: Field = Field::msb0("ria", 32, 23, 1);
pub const MCR_WND: Field = Field::msb0("wnd", 32, 24, 1);
/// Renamed from the reference manual's `ITR` ("interrupt then reset") so
/// this field can double as the generic event dispatcher's mask-enable bit
/// for the `tif` event — it is NOT a status flag (that's `IR[TIF]` below).
pub const MCR_TIF: Field = Field::msb0("tif", 32, 25, 1);
pub const MCR_HLK: Field = Field::msb0("hlk", 32, 26, 1);
pub const MCR_SLK: Field = Field::msb0("slk", 32, 27, 1);
pub const MCR_CSL: Field = Field::msb0("csl", 32, 28, 1);
pub const MCR_STP: Field = Field::msb0("stp", 32, 29, 1);
pub const MCR_FRZ: Field = Field::msb0("frz", 32, 30, 1);
pub const MCR_WEN: Field = Field::msb0("wen", 32, 31, 1);

/// Reset value: MAP=0xFF, RIA=1, CSL=1, FRZ=1, WEN=1, everything else 0.
pub const MCR_RESET: u32 = 0xFF00_010B;

pub const IR_TIF: Field = Field::write_one_to_clear("tif", 0, 1);

pub const SR_WSC: Field = Field::msb0("wsc", 32, 16, 16);
pub const SK_SK: Field = Field::msb0("sk", 32, 16, 16);

pub struct SwtRegisters {
    pub mcr: Register,
    pub ir: Register,
    pub to: Register,
    pub wn: Register,
    pub sr: Register,
    pub sk: Register,
}

impl Default for SwtRegisters {
    fn default() -> Self {
        SwtRegisters {
            mcr: Register::new(Width::W32, AccessClass::ReadWrite, MCR_RESET).with_fields(&[
                MCR_MAP, MCR_KEY, MCR_RIA, MCR_WND, MCR_TIF, MCR_HLK, MCR_SLK, MCR_CSL, MCR_STP,
                MCR_FRZ, MCR_WEN,
            ]),
            ir: Register::new(Width::W32, AccessClass::ReadWrite, 0).with_fields(&[IR_TIF]),
            to: Register::new(Width::W32, AccessClass::ReadWrite, 0x0005_FCD0),
            wn: Register::new(Width::W32, AccessClass::ReadWrite, 0),
            sr: Register::new(Width::W32, AccessClass::ReadWrite, 0).with_fields(&[SR_WSC]),
            sk: Register::new(Width::W32, AccessClass::ReadWrite, 0).with_fields(&[SK_SK]),
        }
    }
}

impl SwtRegisters {
    pub fn mcr_field(&self, f: &Field) -> bool {
        self.mcr.get_field(f) != 0
    }
}

impl RegisterSet for SwtRegisters {
    fn size(&self) -> u32 {
        MMIO_SIZE
    }

    fn describe(&self, offset: u32) -> Option<RegisterDescriptor> {
        let width = Width::W32;
        match offset {
            MCR_OFFSET => Some(RegisterDescriptor {
                base_offset: MCR_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            IR_OFFSET => Some(RegisterDescriptor {
                base_offset: IR_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            TO_OFFSET => Some(RegisterDescriptor {
                base_offset: TO_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            WN_OFFSET => Some(RegisterDescriptor {
                base_offset: WN_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            SR_OFFSET => Some(RegisterDescriptor {
                base_offset: SR_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            SK_OFFSET => Some(RegisterDescriptor {
                base_offset: SK_OFFSET,
                width,
                access: AccessClass::ReadWrite,
            }),
            _ => None,
        }
    }

    fn read_raw(&self, base_offset: u32) -> u32 {
        match base_offset {
            MCR_OFFSET => self.mcr.raw(),
            IR_OFFSET => self.ir.raw(),
            TO_OFFSET => self.to.raw(),
            WN_OFFSET => self.wn.raw(),
            SR_OFFSET => self.sr.raw(),
            SK_OFFSET => self.sk.raw(),
            _ => 0,
        }
    }

    fn write_raw(&mut self, base_offset: u32, value: u32) {
        match base_offset {
            MCR_OFFSET => self.mcr.write_raw(value),
            IR_OFFSET => self.ir.write_raw(value),
            TO_OFFSET => self.to.write_raw(value),
            WN_OFFSET => self.wn.write_raw(value),
            SR_OFFSET => self.sr.write_raw(value),
            SK_OFFSET => self.sk.write_raw(value),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.mcr.reset();
        self.ir.reset();
        self.to.reset();
        self.wn.reset();
        self.sr.reset();
        self.sk.reset();
    }

    fn on_write(&mut self, _base_offset: u32, _size: u8) {}
}
