//! sdcard-spi - SD card driver core.
//!
//! Drives an SD card attached to a plain four-wire SPI bus: the two
//! generation initialization handshake, capacity discovery through the CSD
//! register, and single/multiple block transfers. This is optimised for
//! readability and debugability, not performance.

mod bus;
pub mod csd;
pub mod proto;


use self::bus::Bus;
pub use self::csd::Csd;
use self::proto::*;

use crate::block_device::{
    BlockDevice, IOCTL_BLOCK_COUNT, IOCTL_BLOCK_SIZE, IOCTL_ERASE, IOCTL_SYNC,
};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Control over the SPI bus clock. Card identification must run at a low
/// frequency, and the driver switches to the operating rate only once the
/// handshake has fully succeeded, so the peripheral has to expose its clock.
pub trait SpiClock {
    type Error;

    /// Reconfigure the bus clock to run at (approximately) `hz`.
    fn set_frequency(&mut self, hz: u32) -> Result<(), Self::Error>;
}

/// The possible errors this driver can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral.
    Transport,
    /// We couldn't drive the chip-select pin.
    Gpio,
    /// The reset command never produced the idle state; no card on the bus.
    NoCardDetected,
    /// The version probe produced a response matching neither generation.
    UnknownCardVersion,
    /// The card's voltage window does not cover 3.0-3.5V.
    VoltageUnsupported,
    /// The initialization handshake did not finish within its budget.
    InitTimeout,
    /// The CSD structure version is one this driver cannot decode.
    UnsupportedCsdFormat,
    /// A byte-addressed card refused the 512-byte block length.
    BlockLengthRejected,
    /// No response to this command within the attempt budget.
    CommandTimeout(u8),
    /// The card answered a command with an error status (command, status).
    CardError(u8, u8),
    /// No data token, or no end of busy, within the attempt budget.
    DataTimeout,
    /// The card refused the data phase of a write.
    WriteRejected,
    /// Misaligned buffer length, or a partial-block offset, neither of
    /// which ever reaches the bus.
    ContractViolation,
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    SD1,
    SD2,
    SDHC,
}

/// The state of an [`SdCard`] before initialization.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct NotInit;

/// The state of an [`SdCard`] whose initialization handshake completed.
///
/// Holds the session the sequencer publishes: it is populated exactly once,
/// on full success, and only replaced by running initialization from
/// scratch - a partially initialized card can never present a sector count.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Ready {
    card_type: CardType,
    /// Address divisor: transfer commands take `block_num * cdv`, so 512 on
    /// byte-addressed cards and 1 on block-addressed ones.
    cdv: u32,
    sectors: u32,
    csd: Csd,
}

/// Options for initializing the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct InitOpts {
    /// Bus frequency to switch to after the handshake completes.
    pub operating_hz: u32,
    /// Read block 0 once after going ready. A failure is logged but does
    /// not revert the ready state; some boards need this warm-up read.
    pub verify_read: bool,
}

impl Default for InitOpts {
    fn default() -> Self {
        InitOpts {
            operating_hz: DEFAULT_OPERATING_HZ,
            verify_read: true,
        }
    }
}

/// An SD card on an SPI bus, with a dedicated chip-select pin. Chip select
/// is separate so the driver can clock bytes out with the card deselected,
/// which the power-up sequence and shared-bus resynchronization require.
pub struct SdCard<SPI, CS, STATE>
where
    SPI: Transfer<u8> + SpiClock,
    CS: OutputPin,
{
    spi: SPI,
    cs: CS,
    state: STATE,
}

/// Bounded retry budget with a crude busy-loop delay between attempts.
struct Delay(u32);

impl Delay {
    fn new(attempts: u32) -> Delay {
        Delay(attempts)
    }

    fn delay(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            let dummy_var: u32 = 0;
            for _ in 0..100 {
                unsafe { core::ptr::read_volatile(&dummy_var) };
            }
            self.0 -= 1;
            Ok(())
        }
    }
}

impl<SPI, CS> SdCard<SPI, CS, NotInit>
where
    SPI: Transfer<u8> + SpiClock,
    CS: OutputPin,
{
    /// Create a new driver over a raw SPI interface. Does not touch the bus.
    pub fn new(spi: SPI, cs: CS) -> Self {
        SdCard {
            spi,
            cs,
            state: NotInit,
        }
    }

    /// Initialize the card with default options.
    pub fn init(self) -> Result<SdCard<SPI, CS, Ready>, (Error, Self)> {
        self.init_with_opts(Default::default())
    }

    /// Run the full initialization handshake. On success the returned card
    /// knows its addressing mode and capacity and the bus runs at the
    /// operating frequency; on failure the untouched driver is handed back
    /// along with the reason, and initialization can be retried from
    /// scratch.
    pub fn init_with_opts(
        mut self,
        opts: InitOpts,
    ) -> Result<SdCard<SPI, CS, Ready>, (Error, Self)> {
        debug!("initializing card with opts: {:?}", opts);
        match self.handshake(opts.operating_hz) {
            Ok(session) => {
                let mut card = SdCard {
                    spi: self.spi,
                    cs: self.cs,
                    state: session,
                };
                if opts.verify_read {
                    let mut block = [0u8; BLOCK_LEN];
                    if let Err(e) = card.readblocks(0, &mut block, 0) {
                        warn!("verification read of block 0 failed: {:?}", e);
                    }
                }
                Ok(card)
            }
            Err(e) => Err((e, self)),
        }
    }

    fn idle_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// The initialization sequencer: power-up, reset, version probe,
    /// capacity negotiation, CSD read, block-length setup, speed switch.
    fn handshake(&mut self, operating_hz: u32) -> Result<Ready, Error> {
        // identification must happen slow; the bus is switched up only
        // after every other step has succeeded
        self.spi
            .set_frequency(IDENTIFICATION_HZ)
            .map_err(|_e| Error::Transport)?;

        // supply a minimum of 74 clock cycles with the card deselected
        self.cs.set_high().map_err(|_e| Error::Gpio)?;
        for _ in 0..10 {
            self.idle_byte()?;
        }

        let mut bus = Bus::new(&mut self.spi, &mut self.cs)?;

        // CMD0 until the card reports idle
        let mut delay = Delay::new(CMD0_ATTEMPTS);
        let mut reset = false;
        for attempt in 0..CMD0_ATTEMPTS {
            trace!("reset card, attempt {}..", attempt);
            match bus.command(CMD0, 0) {
                Ok(r) if R1::from_bits_truncate(r) == R1::IDLE_STATE => {
                    reset = true;
                    break;
                }
                Ok(r) => {
                    warn!("CMD0 response {:#04x}, trying again..", r);
                }
                Err(Error::CommandTimeout(_)) => {
                    warn!("CMD0 timed out, trying again..");
                }
                Err(e) => return Err(e),
            }
            delay.delay(Error::NoCardDetected)?;
        }
        if !reset {
            return Err(Error::NoCardDetected);
        }

        // CMD8 sorts the two generations apart: V2 cards echo the check
        // pattern, V1 cards report the command as illegal
        let mut cond = [0u8; 4];
        let probe = bus.command_with_trailing(CMD8, CMD8_PATTERN, &mut cond)?;
        let mut card_type = match R1::from_bits_truncate(probe) {
            r if r == R1::IDLE_STATE => CardType::SD2,
            r if r == R1::IDLE_STATE | R1::ILLEGAL_COMMAND => CardType::SD1,
            _ => return Err(Error::UnknownCardVersion),
        };
        debug!("card version: {:?}", card_type);

        let cdv = match card_type {
            CardType::SD1 => {
                // repeat ACMD41 until the card leaves idle; V1 cards are
                // always byte addressed
                let mut delay = Delay::new(ACMD41_ATTEMPTS);
                while bus.app_command(ACMD41, 0)? != 0 {
                    delay.delay(Error::InitTimeout)?;
                }
                512
            }
            CardType::SD2 | CardType::SDHC => {
                let mut ocr = [0u8; 4];
                bus.command_with_trailing(CMD58, 0, &mut ocr)?;
                if ocr[1] & OCR_VOLTAGE_WINDOW == 0 {
                    return Err(Error::VoltageUnsupported);
                }

                let mut delay = Delay::new(ACMD41_ATTEMPTS);
                while bus.app_command(ACMD41, ACMD41_HCS)? != 0 {
                    delay.delay(Error::InitTimeout)?;
                }

                // only now is the capacity-status bit valid
                bus.command_with_trailing(CMD58, 0, &mut ocr)?;
                if ocr[0] & OCR_CCS != 0 {
                    card_type = CardType::SDHC;
                    1
                } else {
                    512
                }
            }
        };

        trace!("read CSD..");
        let status = bus.command(CMD9, 0)?;
        if status != 0 {
            return Err(Error::CardError(CMD9, status));
        }
        let mut raw = [0u8; 16];
        bus.read_data(&mut raw)?;
        let csd = Csd::new(raw);
        let sectors = csd.sectors()?;
        debug!("card reports {} sectors", sectors);

        if cdv == 512 {
            let status = bus.command(CMD16, BLOCK_LEN as u32)?;
            if status != 0 {
                return Err(Error::BlockLengthRejected);
            }
        }

        drop(bus);

        // identification is over, run the bus at speed
        self.spi
            .set_frequency(operating_hz)
            .map_err(|_e| Error::Transport)?;

        Ok(Ready {
            card_type,
            cdv,
            sectors,
            csd,
        })
    }
}

impl<SPI, CS> SdCard<SPI, CS, Ready>
where
    SPI: Transfer<u8> + SpiClock,
    CS: OutputPin,
{
    /// Mark the card as unused, e.g. to re-run initialization from scratch.
    /// This should be kept infallible, because Drop is unable to fail.
    pub fn deinit(self) -> SdCard<SPI, CS, NotInit> {
        SdCard {
            spi: self.spi,
            cs: self.cs,
            state: NotInit,
        }
    }

    pub fn card_type(&self) -> CardType {
        self.state.card_type
    }

    /// Capacity in 512-byte blocks, as decoded from the CSD.
    pub fn num_blocks(&self) -> u32 {
        self.state.sectors
    }

    /// Usable size of this card in bytes.
    pub fn card_size_bytes(&self) -> u64 {
        u64::from(self.state.sectors) * BLOCK_LEN as u64
    }

    /// The raw card-specific-data register read during initialization.
    pub fn csd(&self) -> &Csd {
        &self.state.csd
    }

    fn address(&self, block_num: u32) -> u32 {
        block_num * self.state.cdv
    }

    /// Enforced before any bus activity: a positive multiple of the block
    /// size, and no partial-block offset.
    fn check_buffer(len: usize, offset: usize) -> Result<usize, Error> {
        if offset != 0 || len == 0 || len % BLOCK_LEN != 0 {
            return Err(Error::ContractViolation);
        }
        Ok(len / BLOCK_LEN)
    }

    /// One idle byte with the card deselected. Some vendors need MOSI held
    /// high before a transaction when the bus is shared with other devices.
    fn resync(&mut self) -> Result<(), Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|_b| ())
            .map_err(|_e| Error::Transport)
    }
}

impl<SPI, CS> BlockDevice for SdCard<SPI, CS, Ready>
where
    SPI: Transfer<u8> + SpiClock,
    CS: OutputPin,
{
    type Error = Error;

    /// Read one or more 512-byte blocks, starting at the given block index.
    /// Partial-block reads (`offset != 0`) are not supported.
    fn readblocks(
        &mut self,
        block_num: u32,
        buffer: &mut [u8],
        offset: usize,
    ) -> Result<(), Self::Error> {
        let nblocks = Self::check_buffer(buffer.len(), offset)?;
        trace!("readblocks: {} block(s) at {}", nblocks, block_num);
        self.resync()?;

        let addr = self.address(block_num);
        let mut bus = Bus::new(&mut self.spi, &mut self.cs)?;
        if nblocks == 1 {
            let status = bus.command(CMD17, addr)?;
            if status != 0 {
                return Err(Error::CardError(CMD17, status));
            }
            bus.read_data(buffer)?;
        } else {
            let status = bus.command(CMD18, addr)?;
            if status != 0 {
                return Err(Error::CardError(CMD18, status));
            }
            for chunk in buffer.chunks_mut(BLOCK_LEN) {
                bus.read_data(chunk)?;
            }
            let status = bus.command(CMD12, 0)?;
            if status != 0 {
                return Err(Error::CardError(CMD12, status));
            }
        }
        Ok(())
    }

    /// Write one or more 512-byte blocks, starting at the given block
    /// index. Partial-block writes (`offset != 0`) are not supported.
    fn writeblocks(
        &mut self,
        block_num: u32,
        buffer: &[u8],
        offset: usize,
    ) -> Result<(), Self::Error> {
        let nblocks = Self::check_buffer(buffer.len(), offset)?;
        trace!("writeblocks: {} block(s) at {}", nblocks, block_num);
        self.resync()?;

        let addr = self.address(block_num);
        let mut bus = Bus::new(&mut self.spi, &mut self.cs)?;
        if nblocks == 1 {
            let status = bus.command(CMD24, addr)?;
            if status != 0 {
                return Err(Error::CardError(CMD24, status));
            }
            bus.write_data(DATA_START_BLOCK, buffer)?;
        } else {
            let status = bus.command(CMD25, addr)?;
            if status != 0 {
                return Err(Error::CardError(CMD25, status));
            }
            for chunk in buffer.chunks(BLOCK_LEN) {
                bus.write_data(WRITE_MULTIPLE_TOKEN, chunk)?;
            }
            bus.write_stop_token()?;
        }
        Ok(())
    }

    /// Control operations a mounting filesystem issues. Unrecognized ops
    /// answer with a benign zero rather than failing.
    fn ioctl(&mut self, op: u32, _arg: u32) -> u32 {
        match op {
            IOCTL_SYNC => 0,
            IOCTL_BLOCK_COUNT => self.state.sectors,
            IOCTL_BLOCK_SIZE => BLOCK_LEN as u32,
            IOCTL_ERASE => 0,
            _ => 0,
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
