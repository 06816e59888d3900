//! The generic MMIO peripheral base: alignment/endian enforcement, access-class
//! fault translation, and callback dispatch on top of a [`RegisterSet`]
//! (`spec.md` §4.1, "MMIO Base").
//!
//! Grounded on the decode/dispatch shape of `crates/kernel/src/hal/mmio.rs`:
//! a thin generic wrapper that turns `(offset, size)` accesses into typed
//! register operations and funnels every fault through one error type.

use crate::error::{AccessError, BusError, UnimplementedError};
use crate::register::{AccessClass, RegisterSet, Width};

/// Byte order used to pack/unpack a register's raw `u32` value to/from the
/// wire bytes the CPU's load/store actually sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Accesses of this size or larger (debugger/workspace bulk reads, per
/// `spec.md` §4.1 "Large accesses") are segmented into natural-width chunks
/// and never fault; any reserved byte within the span simply reads as zero
/// or ignores the write.
pub const SEGMENTED_ACCESS_THRESHOLD: u8 = 8;

/// Generic MMIO wrapper around a concrete [`RegisterSet`]. One instance per
/// peripheral; the peripheral crate supplies `R` and is responsible for the
/// offset -> register dispatch table.
pub struct MmioPeripheral<R: RegisterSet> {
    pub name: &'static str,
    pub base: u32,
    pub endian: Endian,
    pub registers: R,
}

impl<R: RegisterSet> MmioPeripheral<R> {
    pub fn new(name: &'static str, base: u32, endian: Endian, registers: R) -> Self {
        MmioPeripheral {
            name,
            base,
            endian,
            registers,
        }
    }

    pub fn reset(&mut self) {
        self.registers.reset();
    }

    /// Reads `size` bytes at peripheral-relative `offset`.
    pub fn read(&self, offset: u32, size: u8, pc: u32) -> Result<Vec<u8>, AccessError> {
        let va = self.base + offset;
        if size as u32 >= SEGMENTED_ACCESS_THRESHOLD as u32 {
            return Ok(self.read_segmented(offset, size));
        }

        let desc = self
            .registers
            .describe(offset)
            .ok_or(BusError::ReadBusError { pc, va, size })?;

        if desc.width.bytes() != size || offset != desc.base_offset {
            return Err(BusError::Alignment {
                pc,
                va,
                size,
                data_consumed: false,
            }
            .into());
        }

        match desc.access {
            AccessClass::Placeholder => {
                return Err(UnimplementedError {
                    pc,
                    va,
                    size,
                    feature: format!("{}+{offset:#x}", self.name),
                }
                .into())
            }
            AccessClass::WriteOnly => return Err(BusError::ReadBusError { pc, va, size }.into()),
            _ => {}
        }

        let raw = self.registers.read_raw(desc.base_offset);
        Ok(pack(raw, desc.width, self.endian))
    }

    /// Writes `data` (exactly `size` bytes) at peripheral-relative `offset`.
    pub fn write(&mut self, offset: u32, size: u8, data: &[u8], pc: u32) -> Result<(), AccessError> {
        let va = self.base + offset;
        if size as u32 >= SEGMENTED_ACCESS_THRESHOLD as u32 {
            self.write_segmented(offset, data);
            return Ok(());
        }

        let desc = self
            .registers
            .describe(offset)
            .ok_or(BusError::WriteBusError { pc, va, size })?;

        if desc.width.bytes() != size || offset != desc.base_offset {
            return Err(BusError::Alignment {
                pc,
                va,
                size,
                data_consumed: true,
            }
            .into());
        }

        match desc.access {
            AccessClass::Placeholder => {
                return Err(UnimplementedError {
                    pc,
                    va,
                    size,
                    feature: format!("{}+{offset:#x}", self.name),
                }
                .into())
            }
            AccessClass::ReadOnly => return Err(BusError::WriteBusError { pc, va, size }.into()),
            _ => {}
        }

        let raw = unpack(data, desc.width, self.endian);
        self.registers.write_raw(desc.base_offset, raw);
        self.registers.on_write(desc.base_offset, size);
        Ok(())
    }

    /// Bulk read used for >=8 byte accesses: walks 4-byte natural chunks,
    /// substituting zero for any offset with no declared register or a
    /// write-only one, never faulting.
    fn read_segmented(&self, offset: u32, size: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(size as usize);
        let mut remaining = size as u32;
        let mut cur = offset;
        while remaining > 0 {
            let chunk = remaining.min(4) as u8;
            match self.registers.describe(cur) {
                Some(desc) if desc.access != AccessClass::WriteOnly && desc.base_offset == cur => {
                    let raw = self.registers.read_raw(desc.base_offset);
                    out.extend(pack(raw, desc.width, self.endian));
                }
                _ => out.extend(std::iter::repeat(0u8).take(chunk as usize)),
            }
            cur += chunk as u32;
            remaining -= chunk as u32;
        }
        out.truncate(size as usize);
        out
    }

    /// Bulk write counterpart to [`Self::read_segmented`]: any offset that
    /// isn't a whole, writable natural-width register is silently ignored.
    fn write_segmented(&mut self, offset: u32, data: &[u8]) {
        let mut cur = offset;
        let mut idx = 0usize;
        while idx < data.len() {
            let remaining = data.len() - idx;
            let chunk = remaining.min(4);
            if let Some(desc) = self.registers.describe(cur) {
                if desc.base_offset == cur
                    && desc.width.bytes() as usize == chunk
                    && !matches!(
                        desc.access,
                        AccessClass::ReadOnly | AccessClass::Placeholder
                    )
                {
                    let raw = unpack(&data[idx..idx + chunk], desc.width, self.endian);
                    self.registers.write_raw(desc.base_offset, raw);
                    self.registers.on_write(desc.base_offset, chunk as u8);
                }
            }
            cur += chunk as u32;
            idx += chunk;
        }
    }
}

fn pack(raw: u32, width: Width, endian: Endian) -> Vec<u8> {
    let bytes = width.bytes() as usize;
    let full = match endian {
        Endian::Big => raw.to_be_bytes(),
        Endian::Little => raw.to_le_bytes(),
    };
    match endian {
        Endian::Big => full[4 - bytes..].to_vec(),
        Endian::Little => full[..bytes].to_vec(),
    }
}

fn unpack(data: &[u8], width: Width, endian: Endian) -> u32 {
    let bytes = width.bytes() as usize;
    debug_assert_eq!(data.len(), bytes);
    let mut buf = [0u8; 4];
    match endian {
        Endian::Big => buf[4 - bytes..].copy_from_slice(data),
        Endian::Little => buf[..bytes].copy_from_slice(data),
    }
    match endian {
        Endian::Big => u32::from_be_bytes(buf),
        Endian::Little => u32::from_le_bytes(buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{Register, RegisterDescriptor};

    struct Toy {
        a: Register,
        b: Register,
    }

    impl RegisterSet for Toy {
        fn size(&self) -> u32 {
            8
        }

        fn describe(&self, offset: u32) -> Option<RegisterDescriptor> {
            match offset & !0x3 {
                0x0 => Some(RegisterDescriptor {
                    base_offset: 0x0,
                    width: self.a.width(),
                    access: self.a.access(),
                }),
                0x4 => Some(RegisterDescriptor {
                    base_offset: 0x4,
                    width: self.b.width(),
                    access: self.b.access(),
                }),
                _ => None,
            }
        }

        fn read_raw(&self, base_offset: u32) -> u32 {
            match base_offset {
                0x0 => self.a.raw(),
                0x4 => self.b.raw(),
                _ => unreachable!(),
            }
        }

        fn write_raw(&mut self, base_offset: u32, value: u32) {
            match base_offset {
                0x0 => self.a.write_raw(value),
                0x4 => self.b.write_raw(value),
                _ => unreachable!(),
            }
        }

        fn reset(&mut self) {
            self.a.reset();
            self.b.reset();
        }

        fn on_write(&mut self, _base_offset: u32, _size: u8) {}
    }

    fn toy() -> MmioPeripheral<Toy> {
        MmioPeripheral::new(
            "TOY",
            0x1000,
            Endian::Big,
            Toy {
                a: Register::new(Width::W32, AccessClass::ReadWrite, 0),
                b: Register::new(Width::W32, AccessClass::ReadOnly, 0xCAFEBABE),
            },
        )
    }

    #[test]
    fn read_write_round_trip() {
        let mut p = toy();
        p.write(0x0, 4, &[0x11, 0x22, 0x33, 0x44], 0).unwrap();
        let bytes = p.read(0x0, 4, 0).unwrap();
        assert_eq!(bytes, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn write_to_read_only_faults() {
        let mut p = toy();
        let err = p.write(0x4, 4, &[0, 0, 0, 0], 0x2000).unwrap_err();
        match err {
            AccessError::Bus(BusError::WriteBusError { pc, va, size }) => {
                assert_eq!(pc, 0x2000);
                assert_eq!(va, 0x1004);
                assert_eq!(size, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn misaligned_size_faults() {
        let mut p = toy();
        let err = p.read(0x0, 2, 0).unwrap_err();
        assert!(matches!(err, AccessError::Bus(BusError::Alignment { .. })));
    }

    #[test]
    fn reserved_offset_faults() {
        let p = toy();
        let err = p.read(0x100, 4, 0).unwrap_err();
        assert!(matches!(err, AccessError::Bus(BusError::ReadBusError { .. })));
    }

    #[test]
    fn segmented_access_never_faults() {
        let p = toy();
        let bytes = p.read(0x0, 16, 0).unwrap();
        assert_eq!(bytes.len(), 16);
    }
}
