use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use super::proto::*;
use super::{Delay, Error};

/// Exclusive ownership of the shared bus for one logical command or
/// transfer. Construction asserts chip select; `Drop` deasserts it and
/// clocks one trailing idle byte, so every exit path - success, card error
/// or timeout - releases the bus exactly once.
pub struct Bus<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
}

impl<'spi, 'cs, SPI, CS> Drop for Bus<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs.set_high().ok();
        let _ = self.spi.transfer(&mut [0xFF]);
    }
}

impl<'spi, 'cs, SPI, CS> Bus<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS) -> Result<Self, Error> {
        cs.set_low().map_err(|_| Error::Gpio)?;
        Ok(Self { spi, cs })
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the card by clocking out an idle byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Frame and send one command, then poll for its R1 response.
    ///
    /// The frame is `0b01` + the 6-bit index, the big-endian argument and
    /// CRC7 with the stop bit folded in. The first polled byte with bit 7
    /// clear is the response; exhausting the poll budget is a
    /// [`CommandTimeout`](Error::CommandTimeout).
    pub fn command(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        let mut frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        frame[5] = crc7(&frame[0..5]);

        for b in frame.iter() {
            self.send(*b)?;
        }

        // stuff byte preceding the stop-transmission response
        if cmd == CMD12 {
            let _ = self.receive()?;
        }

        for _ in 0..R1_ATTEMPTS {
            let response = self.receive()?;
            if response & 0x80 == 0 {
                return Ok(response);
            }
        }

        Err(Error::CommandTimeout(cmd))
    }

    /// Like [`command`](Self::command), but read `trailing.len()` register
    /// bytes immediately after a valid response (R3/R7 forms).
    pub fn command_with_trailing(
        &mut self,
        cmd: u8,
        arg: u32,
        trailing: &mut [u8],
    ) -> Result<u8, Error> {
        let response = self.command(cmd, arg)?;
        for b in trailing.iter_mut() {
            *b = self.receive()?;
        }
        Ok(response)
    }

    /// Run an application-specific command: CMD55 announces it, then the
    /// command itself is sent.
    pub fn app_command(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        self.command(CMD55, 0)?;
        self.command(cmd, arg)
    }

    /// One data phase of a read: wait for the start token, clock the
    /// payload in, discard the two trailing CRC bytes.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut delay = Delay::new(DATA_TOKEN_ATTEMPTS);
        loop {
            if self.receive()? == DATA_START_BLOCK {
                break;
            }
            delay.delay(Error::DataTimeout)?;
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        // data CRC is not verified in SPI mode, clock it out and drop it
        let _ = self.receive()?;
        let _ = self.receive()?;

        Ok(())
    }

    /// One data phase of a write: token, payload, dummy CRC, then the
    /// card's data response. Anything but the accept pattern aborts with
    /// [`WriteRejected`](Error::WriteRejected) and no busy-wait; an accept
    /// is followed by waiting out the programming time.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(token)?;
        for b in buffer.iter() {
            self.send(*b)?;
        }
        self.send(0xFF)?;
        self.send(0xFF)?;

        let status = self.receive()?;
        if status & DATA_RES_MASK != DATA_RES_ACCEPTED {
            return Err(Error::WriteRejected);
        }

        self.wait_not_busy()
    }

    /// End a multiple-block write: stop token, one byte of gap before the
    /// card starts signalling busy, then wait out the final programming.
    pub fn write_stop_token(&mut self) -> Result<(), Error> {
        self.send(STOP_TRAN_TOKEN)?;
        let _ = self.receive()?;
        self.wait_not_busy()
    }

    /// The card holds the line at zero while programming; spin until it
    /// lets go or the budget runs out.
    fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new(BUSY_ATTEMPTS);
        loop {
            if self.receive()? != 0x00 {
                return Ok(());
            }
            delay.delay(Error::DataTimeout)?;
        }
    }
}
