//! sdcard-spi - SD/SPI wire protocol definitions.
//!
//! Command indexes, response bits, data-phase tokens and the retry budgets
//! used by the command engine and the initialization sequencer.

use bitflags::bitflags;

/// GO_IDLE_STATE - reset the card and enter SPI mode.
pub const CMD0: u8 = 0;
/// SEND_IF_COND - probe the card generation (V2 cards echo the pattern).
pub const CMD8: u8 = 8;
/// SEND_CSD - read the Card Specific Data register.
pub const CMD9: u8 = 9;
/// STOP_TRANSMISSION - end a multiple-block read.
pub const CMD12: u8 = 12;
/// SET_BLOCKLEN - set the block length for byte-addressed cards.
pub const CMD16: u8 = 16;
/// READ_SINGLE_BLOCK
pub const CMD17: u8 = 17;
/// READ_MULTIPLE_BLOCK
pub const CMD18: u8 = 18;
/// WRITE_BLOCK
pub const CMD24: u8 = 24;
/// WRITE_MULTIPLE_BLOCK
pub const CMD25: u8 = 25;
/// APP_CMD - prefix announcing an application-specific command.
pub const CMD55: u8 = 55;
/// READ_OCR - read the Operation Conditions Register.
pub const CMD58: u8 = 58;
/// SD_SEND_OP_COND - application-specific initialization (after CMD55).
pub const ACMD41: u8 = 41;

/// CMD8 argument: 2.7-3.6V supply plus the 0xAA check pattern.
pub const CMD8_PATTERN: u32 = 0x1AA;
/// ACMD41 argument bit telling the card the host supports high capacity.
pub const ACMD41_HCS: u32 = 0x4000_0000;

bitflags! {
    /// R1 response status bits. A byte with bit 7 clear is a valid R1.
    pub struct R1: u8 {
        const IDLE_STATE = 1 << 0;
        const ERASE_RESET = 1 << 1;
        const ILLEGAL_COMMAND = 1 << 2;
        const COM_CRC_ERROR = 1 << 3;
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        const ADDRESS_ERROR = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;
    }
}

/// Card-Capacity-Status bit in the first OCR byte; set on block-addressed
/// (SDHC/SDXC) cards once initialization completes.
pub const OCR_CCS: u8 = 0x40;
/// 3.0-3.5V window bits in the second OCR byte.
pub const OCR_VOLTAGE_WINDOW: u8 = 0x7C;

/// Start token for a read or a single-block write.
pub const DATA_START_BLOCK: u8 = 0xFE;
/// Start token for each block of a multiple-block write.
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// Stop token ending a multiple-block write.
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// Mask for the data-response byte after a write data phase.
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data-response pattern meaning the block was accepted.
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// One block, in bytes. All transfers are multiples of this.
pub const BLOCK_LEN: usize = 512;

/// How many bytes to poll for an R1 response before giving up.
pub const R1_ATTEMPTS: u32 = 100;
/// How many CMD0 attempts before deciding no card is present.
pub const CMD0_ATTEMPTS: u32 = 5;
/// ACMD41 rounds during initialization. Cards can take the better part of
/// a second to leave idle, and each round costs over a millisecond of wire
/// time at the identification clock, so this bounds the negotiation to a
/// few seconds.
pub const ACMD41_ATTEMPTS: u32 = 4_000;
/// Polls for a data start token before reporting a data timeout.
pub const DATA_TOKEN_ATTEMPTS: u32 = 100;
/// Polls while the card reports busy after a write data phase. Programming
/// a block can take low hundreds of milliseconds.
pub const BUSY_ATTEMPTS: u32 = 32_000;

/// Identification-phase bus frequency. Cards must be enumerated below
/// 400 kHz; 100 kHz keeps marginal wiring happy too.
pub const IDENTIFICATION_HZ: u32 = 100_000;
/// Default operating frequency once initialization has completed.
pub const DEFAULT_OPERATING_HZ: u32 = 25_000_000;

/// Compute the CRC7 of a command frame and fold in the stop bit, producing
/// the final byte of the 6-byte frame.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut byte in data.iter().cloned() {
        for _ in 0..8 {
            crc <<= 1;
            if ((byte & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    (crc << 1) | 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crc7_of_reset_frame() {
        // The two frames whose CRC the card actually checks in SPI mode.
        assert_eq!(crc7(&[0x40, 0x00, 0x00, 0x00, 0x00]), 0x95);
        assert_eq!(crc7(&[0x48, 0x00, 0x00, 0x01, 0xAA]), 0x87);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
