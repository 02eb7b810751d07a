use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of bounds: addr {addr:#x} len {len}")]
    OutOfBounds { addr: u64, len: usize },
    #[error("guest address overflow: addr {addr:#x} len {len}")]
    AddressOverflow { addr: u64, len: usize },
}

/// Guest physical memory as seen by a device model.
///
/// Accessors are copy-based and take `&self`: ring memory is shared between
/// vCPU threads, the TX worker, and the event-loop thread, so implementations
/// must be internally synchronized. Devices never hold references into guest
/// memory across an operation.
pub trait GuestMemory: Send + Sync {
    /// Size of the address space in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), GuestMemoryError>;

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), GuestMemoryError>;
}

pub fn read_u8(mem: &dyn GuestMemory, addr: u64) -> Result<u8, GuestMemoryError> {
    let mut buf = [0u8; 1];
    mem.read(addr, &mut buf)?;
    Ok(buf[0])
}

pub fn read_u16_le(mem: &dyn GuestMemory, addr: u64) -> Result<u16, GuestMemoryError> {
    let mut buf = [0u8; 2];
    mem.read(addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32_le(mem: &dyn GuestMemory, addr: u64) -> Result<u32, GuestMemoryError> {
    let mut buf = [0u8; 4];
    mem.read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64_le(mem: &dyn GuestMemory, addr: u64) -> Result<u64, GuestMemoryError> {
    let mut buf = [0u8; 8];
    mem.read(addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u8(mem: &dyn GuestMemory, addr: u64, value: u8) -> Result<(), GuestMemoryError> {
    mem.write(addr, &[value])
}

pub fn write_u16_le(mem: &dyn GuestMemory, addr: u64, value: u16) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

pub fn write_u32_le(mem: &dyn GuestMemory, addr: u64, value: u32) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

pub fn write_u64_le(mem: &dyn GuestMemory, addr: u64, value: u64) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

/// Flat heap-backed guest RAM.
///
/// This is the memory every integration test drives; an embedding VMM would
/// supply its own [`GuestMemory`] over the real guest mapping.
pub struct GuestRam {
    data: RwLock<Box<[u8]>>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }
}

fn check_range(addr: u64, len: usize, size: usize) -> Result<usize, GuestMemoryError> {
    let start =
        usize::try_from(addr).map_err(|_| GuestMemoryError::AddressOverflow { addr, len })?;
    let end = start
        .checked_add(len)
        .ok_or(GuestMemoryError::AddressOverflow { addr, len })?;
    if end > size {
        return Err(GuestMemoryError::OutOfBounds { addr, len });
    }
    Ok(start)
}

impl GuestMemory for GuestRam {
    fn len(&self) -> u64 {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len() as u64
    }

    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), GuestMemoryError> {
        let ram = self.data.read().unwrap_or_else(|e| e.into_inner());
        let start = check_range(addr, data.len(), ram.len())?;
        data.copy_from_slice(&ram[start..start + data.len()]);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        let mut ram = self.data.write().unwrap_or_else(|e| e.into_inner());
        let start = check_range(addr, data.len(), ram.len())?;
        ram[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_helpers_round_trip() {
        let ram = GuestRam::new(64);
        write_u64_le(&ram, 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(read_u64_le(&ram, 8).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(read_u16_le(&ram, 8).unwrap(), 0x7788);
        assert_eq!(read_u32_le(&ram, 12).unwrap(), 0x1122_3344);
    }

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let ram = GuestRam::new(16);
        let mut buf = [0u8; 4];
        assert_eq!(
            ram.read(14, &mut buf),
            Err(GuestMemoryError::OutOfBounds { addr: 14, len: 4 })
        );
        assert_eq!(
            ram.write(u64::MAX, &buf),
            Err(GuestMemoryError::AddressOverflow {
                addr: u64::MAX,
                len: 4
            })
        );
    }
}
