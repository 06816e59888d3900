//! INTC register file.
//!
//! Offsets and field layout are taken directly from
//! `original_source/cm2350/peripherals/intc.py`: `MCR` at `0x0000`, `CPR` at
//! `0x0008`, `IACKR`/`EOIR` at `0x0010`/`0x0018` (handled specially, see
//! `lib.rs`, not through this dispatch table), eight byte-sized `SSCIRn`
//! registers starting at `0x0020`, and a 480-byte priority array (`PSR`)
//! starting at `0x0040`.

use fabric_core::{AccessClass, Field, Register, RegisterDescriptor, RegisterSet, Width};

pub const MCR_OFFSET: u32 = 0x0000;
pub const CPR_OFFSET: u32 = 0x0008;
pub const IACKR_OFFSET: u32 = 0x0010;
pub const EOIR_OFFSET: u32 = 0x0018;
pub const SSCIR_OFFSET: u32 = 0x0020;
pub const MAX_SW_INTERRUPTS: u32 = 8;
pub const PSR_OFFSET: u32 = 0x0040;
pub const MAX_INTERRUPTS: u32 = 480;
pub const MIN_PRIO: u8 = 0;
pub const MAX_PRIO: u8 = 15;
pub const MMIO_SIZE: u32 = 0x4000;

pub const MCR_VTES: Field = Field::msb0("vtes", 32, 26, 1);
pub const MCR_HVEN: Field = Field::msb0("hven", 32, 31, 1);
pub const CPR_PRI: Field = Field::msb0("pri", 32, 28, 4);
pub const SSCIR_SET: Field = Field::msb0("set", 8, 6, 1);
pub const SSCIR_CLR: Field = Field::write_one_to_clear("clr", 0, 1);

pub struct IntcRegisters {
    pub mcr: Register,
    pub cpr: Register,
    pub sscir: [Register; MAX_SW_INTERRUPTS as usize],
    pub psr: [u8; MAX_INTERRUPTS as usize],
}

impl Default for IntcRegisters {
    fn default() -> Self {
        IntcRegisters {
            mcr: Register::new(Width::W32, AccessClass::ReadWrite, 0).with_fields(&[MCR_VTES, MCR_HVEN]),
            // Reset value is MAX_PRIO (0xF): the core boots with every
            // interrupt source masked until firmware lowers CPR.
            cpr: Register::new(Width::W32, AccessClass::ReadWrite, MAX_PRIO as u32)
                .with_fields(&[CPR_PRI]),
            sscir: std::array::from_fn(|_| {
                Register::new(Width::W8, AccessClass::ReadWrite, 0).with_fields(&[SSCIR_SET, SSCIR_CLR])
            }),
            psr: [0u8; MAX_INTERRUPTS as usize],
        }
    }
}

impl IntcRegisters {
    pub fn vtes(&self) -> bool {
        self.mcr.get_field(&MCR_VTES) != 0
    }

    pub fn hven(&self) -> bool {
        self.mcr.get_field(&MCR_HVEN) != 0
    }

    pub fn cpr_pri(&self) -> u8 {
        self.cpr.get_field(&CPR_PRI) as u8
    }

    pub fn set_cpr_pri(&mut self, pri: u8) {
        self.cpr.override_field(&CPR_PRI, pri as u32);
    }

    pub fn psr(&self, source: u16) -> u8 {
        self.psr[source as usize] & MAX_PRIO
    }
}

impl RegisterSet for IntcRegisters {
    fn size(&self) -> u32 {
        MMIO_SIZE
    }

    fn describe(&self, offset: u32) -> Option<RegisterDescriptor> {
        match offset {
            MCR_OFFSET => Some(RegisterDescriptor {
                base_offset: MCR_OFFSET,
                width: Width::W32,
                access: AccessClass::ReadWrite,
            }),
            CPR_OFFSET => Some(RegisterDescriptor {
                base_offset: CPR_OFFSET,
                width: Width::W32,
                access: AccessClass::ReadWrite,
            }),
            off if (SSCIR_OFFSET..SSCIR_OFFSET + MAX_SW_INTERRUPTS).contains(&off) => {
                Some(RegisterDescriptor {
                    base_offset: off,
                    width: Width::W8,
                    access: AccessClass::ReadWrite,
                })
            }
            off if (PSR_OFFSET..PSR_OFFSET + MAX_INTERRUPTS).contains(&off) => {
                Some(RegisterDescriptor {
                    base_offset: off,
                    width: Width::W8,
                    access: AccessClass::ReadWrite,
                })
            }
            _ => None,
        }
    }

    fn read_raw(&self, base_offset: u32) -> u32 {
        match base_offset {
            MCR_OFFSET => self.mcr.raw(),
            CPR_OFFSET => self.cpr.raw(),
            off if (SSCIR_OFFSET..SSCIR_OFFSET + MAX_SW_INTERRUPTS).contains(&off) => {
                self.sscir[(off - SSCIR_OFFSET) as usize].raw()
            }
            off if (PSR_OFFSET..PSR_OFFSET + MAX_INTERRUPTS).contains(&off) => {
                self.psr[(off - PSR_OFFSET) as usize] as u32
            }
            _ => 0,
        }
    }

    fn write_raw(&mut self, base_offset: u32, value: u32) {
        match base_offset {
            MCR_OFFSET => self.mcr.write_raw(value),
            CPR_OFFSET => self.cpr.write_raw(value),
            off if (SSCIR_OFFSET..SSCIR_OFFSET + MAX_SW_INTERRUPTS).contains(&off) => {
                self.sscir[(off - SSCIR_OFFSET) as usize].write_raw(value)
            }
            off if (PSR_OFFSET..PSR_OFFSET + MAX_INTERRUPTS).contains(&off) => {
                self.psr[(off - PSR_OFFSET) as usize] = (value & MAX_PRIO as u32) as u8;
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.mcr.reset();
        self.cpr.reset();
        for r in &mut self.sscir {
            r.reset();
        }
        self.psr.fill(0);
    }

    fn on_write(&mut self, _base_offset: u32, _size: u8) {
        // SSCIR[SET]->queue-exception and CPR-changed re-offer side effects
        // are handled by `Intc` itself, which owns the lock this dispatch
        // table doesn't have access to.
    }
}
