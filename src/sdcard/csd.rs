//! sdcard-spi - Card Specific Data decoding.
//!
//! The CSD is a 128-bit big-endian register read back with CMD9. Its
//! structure-version field selects between two capacity encodings: the
//! legacy layout splits a 12-bit size field across byte boundaries and
//! scales it with a multiplier, the modern layout carries one contiguous
//! 22-bit size field counted in 512 KiB units.

use super::Error;

/// Extract `bit_count` bits starting `bit_offset` above the least
/// significant bit of the register, where the register is the 16 bytes
/// interpreted as one big-endian unsigned integer. Bit offset 0 is the LSB
/// of the last byte.
pub fn extract_bits(register: &[u8; 16], bit_offset: u32, bit_count: u32) -> u32 {
    debug_assert!(bit_count <= 32 && bit_offset + bit_count <= 128);
    let value = u128::from_be_bytes(*register) >> bit_offset;
    (value & ((1u128 << bit_count) - 1)) as u32
}

/// The raw CSD register plus the capacity arithmetic over it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Csd {
    data: [u8; 16],
}

impl Csd {
    pub fn new(data: [u8; 16]) -> Csd {
        Csd { data }
    }

    /// The raw register contents as read from the card.
    pub fn data(&self) -> &[u8; 16] {
        &self.data
    }

    /// Structure-version field: 0 is the legacy layout, 1 the modern one.
    pub fn structure(&self) -> u8 {
        extract_bits(&self.data, 126, 2) as u8
    }

    /// Card capacity in bytes, computed with the formula the structure
    /// version calls for.
    pub fn capacity_bytes(&self) -> Result<u64, Error> {
        match self.structure() {
            0 => {
                let c_size = u64::from(extract_bits(&self.data, 62, 12));
                let c_size_mult = extract_bits(&self.data, 47, 3);
                let read_bl_len = extract_bits(&self.data, 80, 4);
                Ok((c_size + 1) << (c_size_mult + 2) << read_bl_len)
            }
            1 => {
                let c_size = u64::from(extract_bits(&self.data, 48, 22));
                Ok((c_size + 1) * 512 * 1024)
            }
            _ => Err(Error::UnsupportedCsdFormat),
        }
    }

    /// Card capacity in 512-byte sectors, saturating at the `u32` ceiling.
    /// Cards of 2 TiB and above hold more sectors than a `u32` can count;
    /// the saturated value keeps the addressable prefix usable.
    pub fn sectors(&self) -> Result<u32, Error> {
        self.capacity_bytes()
            .map(|bytes| (bytes / 512).min(u64::from(u32::max_value())) as u32)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
