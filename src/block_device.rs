//! sdcard-spi - Block Device support
//!
//! The narrow contract a filesystem mounts on top of. Nothing
//! protocol-level (commands, tokens) crosses this boundary.

/// `ioctl` op: flush caches. A no-op for devices without write-back.
pub const IOCTL_SYNC: u32 = 3;
/// `ioctl` op: number of 512-byte blocks on the device.
pub const IOCTL_BLOCK_COUNT: u32 = 4;
/// `ioctl` op: block size in bytes.
pub const IOCTL_BLOCK_SIZE: u32 = 5;
/// `ioctl` op: erase a block. Benign success on devices that don't need it.
pub const IOCTL_ERASE: u32 = 6;

/// Represents a block device - a device which reads and writes 512-byte
/// blocks (or sectors) and answers a small set of control queries.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;

    /// Read into `buffer`, starting at the given block index. `offset` asks
    /// for a partial read within the first block; devices that cannot honor
    /// it must reject a nonzero value before touching the medium.
    fn readblocks(
        &mut self,
        block_num: u32,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), Self::Error>;

    /// Write `buffer`, starting at the given block index. Same `offset`
    /// contract as [`readblocks`](Self::readblocks).
    fn writeblocks(&mut self, block_num: u32, buffer: &[u8], offset: usize)
        -> Result<(), Self::Error>;

    /// Control queries, `IOCTL_*` above. Unrecognized ops return a benign
    /// default instead of failing.
    fn ioctl(&mut self, op: u32, arg: u32) -> u32;
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn readblocks(
        &mut self,
        block_num: u32,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), Self::Error> {
        (*self).readblocks(block_num, buffer, offset)
    }

    fn writeblocks(
        &mut self,
        block_num: u32,
        buffer: &[u8],
        offset: usize,
    ) -> Result<(), Self::Error> {
        (*self).writeblocks(block_num, buffer, offset)
    }

    fn ioctl(&mut self, op: u32, arg: u32) -> u32 {
        (*self).ioctl(op, arg)
    }
}

/// A block device over a borrowed chunk of memory. Handy for testing
/// filesystem code, and the one device here that supports partial-block
/// access.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn range(&self, block_num: u32, offset: usize, len: usize) -> Option<(usize, usize)> {
        let start = (block_num as usize).checked_mul(512)?.checked_add(offset)?;
        let end = start.checked_add(len)?;
        if end <= self.memory.len() {
            Some((start, end))
        } else {
            None
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = ();

    fn readblocks(
        &mut self,
        block_num: u32,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), Self::Error> {
        let (start, end) = self.range(block_num, offset, buffer.len()).ok_or(())?;
        buffer.copy_from_slice(&self.memory[start..end]);
        Ok(())
    }

    fn writeblocks(
        &mut self,
        block_num: u32,
        buffer: &[u8],
        offset: usize,
    ) -> Result<(), Self::Error> {
        let (start, end) = self.range(block_num, offset, buffer.len()).ok_or(())?;
        self.memory[start..end].copy_from_slice(buffer);
        Ok(())
    }

    fn ioctl(&mut self, op: u32, _arg: u32) -> u32 {
        match op {
            IOCTL_BLOCK_COUNT => (self.memory.len() / 512) as u32,
            IOCTL_BLOCK_SIZE => 512,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_device_round_trips() {
        let mut memory = [0u8; 2048];
        let mut device = MemoryBlockDevice::new(&mut memory);

        let payload = [0xA5u8; 512];
        device.writeblocks(2, &payload, 0).unwrap();

        let mut back = [0u8; 512];
        device.readblocks(2, &mut back, 0).unwrap();
        assert_eq!(back[..], payload[..]);

        assert_eq!(device.ioctl(IOCTL_BLOCK_COUNT, 0), 4);
        assert_eq!(device.ioctl(IOCTL_BLOCK_SIZE, 0), 512);
        assert_eq!(device.ioctl(99, 0), 0);
    }

    #[test]
    fn memory_device_rejects_out_of_range() {
        let mut memory = [0u8; 1024];
        let mut device = MemoryBlockDevice::new(&mut memory);

        let mut buffer = [0u8; 512];
        assert!(device.readblocks(2, &mut buffer, 0).is_err());
        assert!(device.readblocks(1, &mut buffer, 1).is_err());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
